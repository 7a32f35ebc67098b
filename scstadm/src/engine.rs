use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::copy_manager::{is_copy_manager, PrunePolicy, COPY_MANAGER, COPY_MANAGER_TGT};
use crate::diff::{diff_devices, diff_luns, diff_targets};
use crate::model::{Attrs, Device, Handler, Lun, ScstConfig, Target};
use crate::modules::{load_required, ModuleLoader};
use crate::reader::read_state;
use crate::sysfs::{
    ControlIo, DIR_DEVICE_GROUPS, DIR_DG_DEVICES, DIR_DRIVERS, DIR_HANDLERS, DIR_INITIATORS,
    DIR_INI_GROUPS, DIR_LUNS, DIR_TARGET_GROUPS, FILE_ENABLED, FILE_SUSPEND,
};
use crate::ScstError;

/// Attributes a target only accepts while it is disabled.
fn target_attr_needs_disable(driver: &str, attr: &str) -> bool {
    matches!(attr, "rel_tgt_id") || (driver == "iscsi" && attr == "allowed_portal")
}

/// Driver attributes the driver only accepts once it is enabled.
fn driver_attr_needs_enable(driver: &str, attr: &str) -> bool {
    driver == "iscsi" && matches!(attr, "iSNSServer" | "link_local")
}

fn handler_dir(handler: &str) -> PathBuf {
    Path::new(DIR_HANDLERS).join(handler)
}

fn device_dir(handler: &str, device: &str) -> PathBuf {
    handler_dir(handler).join(device)
}

fn driver_dir(driver: &str) -> PathBuf {
    Path::new(DIR_DRIVERS).join(driver)
}

fn target_dir(driver: &str, target: &str) -> PathBuf {
    driver_dir(driver).join(target)
}

fn luns_dir(driver: &str, target: &str) -> PathBuf {
    target_dir(driver, target).join(DIR_LUNS)
}

fn ini_groups_dir(driver: &str, target: &str) -> PathBuf {
    target_dir(driver, target).join(DIR_INI_GROUPS)
}

fn ini_group_dir(driver: &str, target: &str, group: &str) -> PathBuf {
    ini_groups_dir(driver, target).join(group)
}

fn group_luns_dir(driver: &str, target: &str, group: &str) -> PathBuf {
    ini_group_dir(driver, target, group).join(DIR_LUNS)
}

fn group_inis_dir(driver: &str, target: &str, group: &str) -> PathBuf {
    ini_group_dir(driver, target, group).join(DIR_INITIATORS)
}

fn dg_dir(group: &str) -> PathBuf {
    Path::new(DIR_DEVICE_GROUPS).join(group)
}

fn dg_devices_dir(group: &str) -> PathBuf {
    dg_dir(group).join(DIR_DG_DEVICES)
}

fn tgs_dir(group: &str) -> PathBuf {
    dg_dir(group).join(DIR_TARGET_GROUPS)
}

fn tg_dir(group: &str, tg: &str) -> PathBuf {
    tgs_dir(group).join(tg)
}

fn tg_member_dir(group: &str, tg: &str, target: &str) -> PathBuf {
    tg_dir(group, tg).join(target)
}

#[derive(Debug, Default, Clone)]
pub struct ApplyOptions {
    /// When set, the subsystem-wide suspend toggle is raised to this value
    /// before the first mutation and lifted again at the end of the run.
    pub suspend: Option<u32>,
    /// Checked between any two mutations; a raised flag stops the run
    /// without cleanup.
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Count of control-filesystem mutations the run performed. A second
    /// run of an already-converged configuration performs none.
    pub mutations: usize,
}

/// Single-pass convergence of the live subsystem to a declared model.
///
/// ```no_run
/// use scstadm::{parse_file, ApplyOptions, Engine, Modprobe, Sysfs, DEFAULT_TIMEOUT};
///
/// # fn main() -> anyhow::Result<()> {
/// let sysfs = Sysfs::detect(DEFAULT_TIMEOUT)?;
/// let desired = parse_file("/etc/scst.conf")?;
/// let report = Engine::new(&sysfs, &Modprobe).apply(&desired, &ApplyOptions::default())?;
/// # Ok(())
/// # }
/// ```
pub struct Engine<'a> {
    io: &'a dyn ControlIo,
    modules: &'a dyn ModuleLoader,
}

impl<'a> Engine<'a> {
    pub fn new(io: &'a dyn ControlIo, modules: &'a dyn ModuleLoader) -> Self {
        Engine { io, modules }
    }

    /// Applies `desired` in one ordered pass: removals first, then device,
    /// target and LUN convergence, copy-manager pruning, device groups,
    /// and finally the enables.
    pub fn apply(&self, desired: &ScstConfig, opts: &ApplyOptions) -> Result<ApplyReport> {
        desired.validate()?;
        load_required(self.modules, desired)?;

        let current = read_state(self.io)?;
        info!(
            "converging {} handler(s), {} driver(s), {} device group(s)",
            desired.handlers.len(),
            desired.drivers.len(),
            desired.device_groups.len()
        );

        let mut run = Run {
            io: self.io,
            opts,
            live: current,
            mutations: 0,
            errors: Vec::new(),
            reenable_targets: BTreeSet::new(),
        };
        run.converge(desired)?;

        Ok(ApplyReport {
            mutations: run.mutations,
        })
    }

    /// Removes everything the subsystem holds, leaving only the built-in
    /// copy-manager driver behind.
    pub fn clear(&self, opts: &ApplyOptions) -> Result<ApplyReport> {
        self.apply(&ScstConfig::default(), opts)
    }

    /// Computes the pending changes without touching the subsystem.
    pub fn check(&self, desired: &ScstConfig) -> Result<Vec<String>> {
        desired.validate()?;
        let current = read_state(self.io)?;
        let mut plan = Vec::new();

        let dd = diff_devices(desired, &current);
        for (h, d) in &dd.del {
            plan.push(format!("remove device {} from handler {}", d, h));
        }
        for (h, d) in &dd.add {
            plan.push(format!("create device {} under handler {}", d, h));
        }
        for ((h, d), attrs) in &dd.update {
            for (k, v) in attrs {
                plan.push(format!("set {}/{} attribute {}={}", h, d, k, v));
            }
        }

        let td = diff_targets(desired, &current);
        for (drv, tgt) in &td.del {
            plan.push(format!("remove target {} from driver {}", tgt, drv));
        }
        for (drv, tgt) in &td.add {
            plan.push(format!("create target {} under driver {}", tgt, drv));
        }

        for (drv_name, want_drv) in &desired.drivers {
            let live_drv = current.drivers.get(drv_name);
            for (tgt_name, want_tgt) in &want_drv.targets {
                let live_tgt = live_drv.and_then(|d| d.targets.get(tgt_name));
                let live_luns = live_tgt.map(|t| t.luns.clone()).unwrap_or_default();
                let delta = diff_luns(&want_tgt.luns, &live_luns);
                for id in &delta.add {
                    plan.push(format!(
                        "assign LUN {} ({}) on {}/{}",
                        id, want_tgt.luns[id].device, drv_name, tgt_name
                    ));
                }
                for id in &delta.replace {
                    plan.push(format!(
                        "replace LUN {} with device {} on {}/{}",
                        id, want_tgt.luns[id].device, drv_name, tgt_name
                    ));
                }
                for id in &delta.del {
                    plan.push(format!("remove LUN {} from {}/{}", id, drv_name, tgt_name));
                }

                if let Some(goal) = want_tgt.enabled {
                    if live_tgt.and_then(|t| t.enabled) != Some(goal) {
                        let verb = if goal { "enable" } else { "disable" };
                        plan.push(format!("{} target {}/{}", verb, drv_name, tgt_name));
                    }
                }
            }
            if let Some(goal) = want_drv.enabled {
                if live_drv.and_then(|d| d.enabled) != Some(goal) {
                    let verb = if goal { "enable" } else { "disable" };
                    plan.push(format!("{} driver {}", verb, drv_name));
                }
            }
        }

        for dg_name in desired.device_groups.keys() {
            if !current.device_groups.contains_key(dg_name) {
                plan.push(format!("create device group {}", dg_name));
            }
        }
        for dg_name in current.device_groups.keys() {
            if !desired.device_groups.contains_key(dg_name) {
                plan.push(format!("remove device group {}", dg_name));
            }
        }

        Ok(plan)
    }
}

struct Run<'a> {
    io: &'a dyn ControlIo,
    opts: &'a ApplyOptions,
    live: ScstConfig,
    mutations: usize,
    errors: Vec<ScstError>,
    reenable_targets: BTreeSet<(String, String)>,
}

impl<'a> Run<'a> {
    fn converge(&mut self, desired: &ScstConfig) -> Result<()> {
        if let Some(level) = self.opts.suspend {
            self.write(PathBuf::from(FILE_SUSPEND), &level.to_string())?;
        }

        let res = self.phases(desired);

        if self.opts.suspend.is_some() {
            match self.io.write_attr(Path::new(FILE_SUSPEND), "0", true) {
                Ok(()) => self.mutations += 1,
                Err(e) => warn!("failed to lift I/O suspension: {}", e),
            }
        }

        res
    }

    fn phases(&mut self, desired: &ScstConfig) -> Result<()> {
        self.remove_conflicts(desired)?;
        self.apply_global_attrs(desired)?;
        self.converge_devices(desired)?;
        self.converge_skeleton(desired)?;
        self.converge_luns(desired)?;
        self.prune_copy_manager(desired)?;
        self.converge_device_groups(desired)?;
        self.enable_targets(desired)?;
        self.enable_drivers(desired)?;
        self.post_enable_driver_attrs(desired)?;

        if !self.errors.is_empty() {
            anyhow::bail!(ScstError::Partial {
                errors: mem::take(&mut self.errors),
            })
        }
        Ok(())
    }

    fn check_cancel(&self) -> Result<()> {
        if let Some(flag) = &self.opts.cancel {
            if flag.load(Ordering::Relaxed) {
                anyhow::bail!(ScstError::Cancelled)
            }
        }
        Ok(())
    }

    fn write(&mut self, rel: PathBuf, value: &str) -> Result<()> {
        self.check_cancel()?;
        debug!("write {} = {}", rel.display(), value);
        self.io.write_attr(&rel, value, true)?;
        self.mutations += 1;
        Ok(())
    }

    fn mgmt(&mut self, dir: PathBuf, cmd: String) -> Result<()> {
        self.check_cancel()?;
        debug!("mgmt {}: {}", dir.display(), cmd);
        self.io.mgmt(&dir, &cmd, true)?;
        self.mutations += 1;
        Ok(())
    }

    /// Aggregates a removal or attribute-update failure and lets the run
    /// continue; cancellation still stops it. Returns whether the
    /// operation succeeded.
    fn soft(&mut self, res: Result<()>) -> Result<bool> {
        match res {
            Ok(()) => Ok(true),
            Err(e) => match e.downcast::<ScstError>() {
                Ok(ScstError::Cancelled) => anyhow::bail!(ScstError::Cancelled),
                Ok(se) => {
                    warn!("{}", se);
                    self.errors.push(se);
                    Ok(false)
                }
                Err(other) => {
                    warn!("{}", other);
                    self.errors.push(ScstError::Unknown(other));
                    Ok(false)
                }
            },
        }
    }

    fn forget_device(&mut self, handler: &str, name: &str) {
        if let Some(h) = self.live.handlers.get_mut(handler) {
            h.devices.remove(name);
        }
        for dg in self.live.device_groups.values_mut() {
            dg.devices.retain(|d| d != name);
        }
        if let Some(cm) = self
            .live
            .drivers
            .get_mut(COPY_MANAGER)
            .and_then(|d| d.targets.get_mut(COPY_MANAGER_TGT))
        {
            cm.luns.retain(|_, lun| lun.device != name);
        }
    }

    fn forget_target(&mut self, driver: &str, target: &str) {
        if let Some(d) = self.live.drivers.get_mut(driver) {
            d.targets.remove(target);
        }
        for dg in self.live.device_groups.values_mut() {
            for tg in dg.target_groups.values_mut() {
                tg.targets.remove(target);
            }
        }
    }

    /// Removals in reverse dependency order: device-group memberships and
    /// groups, stale LUNs and initiators, targets, and lastly devices.
    fn remove_conflicts(&mut self, desired: &ScstConfig) -> Result<()> {
        let live = self.live.clone();
        for (dg_name, live_dg) in live.device_groups.iter().rev() {
            match desired.device_groups.get(dg_name) {
                None => {
                    let res = self.mgmt(
                        PathBuf::from(DIR_DEVICE_GROUPS),
                        format!("del {}", dg_name),
                    );
                    if self.soft(res)? {
                        self.live.device_groups.remove(dg_name);
                    }
                }
                Some(want_dg) => {
                    for (tg_name, live_tg) in live_dg.target_groups.iter().rev() {
                        match want_dg.target_groups.get(tg_name) {
                            None => {
                                let res =
                                    self.mgmt(tgs_dir(dg_name), format!("del {}", tg_name));
                                if self.soft(res)? {
                                    if let Some(dg) = self.live.device_groups.get_mut(dg_name) {
                                        dg.target_groups.remove(tg_name);
                                    }
                                }
                            }
                            Some(want_tg) => {
                                for member in live_tg.targets.keys().rev() {
                                    if want_tg.targets.contains_key(member) {
                                        continue;
                                    }
                                    let res = self.mgmt(
                                        tg_dir(dg_name, tg_name),
                                        format!("del {}", member),
                                    );
                                    if self.soft(res)? {
                                        if let Some(tg) = self
                                            .live
                                            .device_groups
                                            .get_mut(dg_name)
                                            .and_then(|dg| dg.target_groups.get_mut(tg_name))
                                        {
                                            tg.targets.remove(member);
                                        }
                                    }
                                }
                            }
                        }
                    }
                    for member in live_dg.devices.iter().rev() {
                        if want_dg.devices.contains(member) {
                            continue;
                        }
                        let res =
                            self.mgmt(dg_devices_dir(dg_name), format!("del {}", member));
                        if self.soft(res)? {
                            if let Some(dg) = self.live.device_groups.get_mut(dg_name) {
                                dg.devices.retain(|d| d != member);
                            }
                        }
                    }
                }
            }
        }

        // devices that go away entirely or move to another handler; their
        // LUN bindings must fall before the device does
        let dd = diff_devices(desired, &self.live);
        let doomed: BTreeSet<&str> = dd.del.iter().map(|(_, name)| name.as_str()).collect();

        let live = self.live.clone();
        for (drv_name, live_drv) in &live.drivers {
            if is_copy_manager(drv_name) {
                continue;
            }
            let want_drv = desired.drivers.get(drv_name);
            for (tgt_name, live_tgt) in &live_drv.targets {
                let want_tgt = match want_drv.and_then(|d| d.targets.get(tgt_name)) {
                    Some(t) => t,
                    None => continue, // the whole target falls below
                };

                for (g_name, live_g) in live_tgt.ini_groups.iter().rev() {
                    match want_tgt.ini_groups.get(g_name) {
                        None => {
                            let res = self.mgmt(
                                ini_groups_dir(drv_name, tgt_name),
                                format!("del {}", g_name),
                            );
                            if self.soft(res)? {
                                if let Some(t) = self.live_target_mut(drv_name, tgt_name) {
                                    t.ini_groups.remove(g_name);
                                }
                            }
                        }
                        Some(want_g) => {
                            for (id, lun) in live_g.luns.iter().rev() {
                                if want_g.luns.contains_key(id)
                                    && !doomed.contains(lun.device.as_str())
                                {
                                    continue;
                                }
                                let res = self.mgmt(
                                    group_luns_dir(drv_name, tgt_name, g_name),
                                    format!("del {}", id),
                                );
                                if self.soft(res)? {
                                    if let Some(g) = self
                                        .live_target_mut(drv_name, tgt_name)
                                        .and_then(|t| t.ini_groups.get_mut(g_name))
                                    {
                                        g.luns.remove(id);
                                    }
                                }
                            }
                            for ini in live_g.initiators.iter().rev() {
                                if want_g.initiators.contains(ini) {
                                    continue;
                                }
                                let res = self.mgmt(
                                    group_inis_dir(drv_name, tgt_name, g_name),
                                    format!("del {}", ini),
                                );
                                if self.soft(res)? {
                                    if let Some(g) = self
                                        .live_target_mut(drv_name, tgt_name)
                                        .and_then(|t| t.ini_groups.get_mut(g_name))
                                    {
                                        g.initiators.retain(|i| i != ini);
                                    }
                                }
                            }
                        }
                    }
                }

                for (id, lun) in live_tgt.luns.iter().rev() {
                    if want_tgt.luns.contains_key(id) && !doomed.contains(lun.device.as_str()) {
                        continue;
                    }
                    let res = self.mgmt(luns_dir(drv_name, tgt_name), format!("del {}", id));
                    if self.soft(res)? {
                        if let Some(t) = self.live_target_mut(drv_name, tgt_name) {
                            t.luns.remove(id);
                        }
                    }
                }
            }
        }

        let td = diff_targets(desired, &self.live);
        for (drv_name, tgt_name) in td.del.iter().rev() {
            let enabled = self
                .live
                .drivers
                .get(drv_name)
                .and_then(|d| d.targets.get(tgt_name))
                .and_then(|t| t.enabled);
            if enabled == Some(true) {
                let res = self.write(target_dir(drv_name, tgt_name).join(FILE_ENABLED), "0");
                self.soft(res)?;
            }
            let res = self.mgmt(driver_dir(drv_name), format!("del_target {}", tgt_name));
            if self.soft(res)? {
                self.forget_target(drv_name, tgt_name);
            }
        }

        for (h_name, dev_name) in dd.del.iter().rev() {
            let res = self.mgmt(handler_dir(h_name), format!("del_device {}", dev_name));
            if self.soft(res)? {
                self.forget_device(h_name, dev_name);
            }
        }

        Ok(())
    }

    fn live_target_mut(&mut self, driver: &str, target: &str) -> Option<&mut Target> {
        self.live
            .drivers
            .get_mut(driver)
            .and_then(|d| d.targets.get_mut(target))
    }

    fn apply_global_attrs(&mut self, desired: &ScstConfig) -> Result<()> {
        for (k, v) in desired.attributes.diff(&self.live.attributes) {
            let res = self.write(PathBuf::from(&k), &v);
            if self.soft(res)? {
                self.live.attributes.insert(k, v);
            }
        }
        Ok(())
    }

    fn converge_devices(&mut self, desired: &ScstConfig) -> Result<()> {
        let live = self.live.clone();
        for (h_name, want_h) in &desired.handlers {
            if let Some(live_h) = live.handlers.get(h_name) {
                for (k, v) in want_h.attributes.diff(&live_h.attributes) {
                    let res = self.write(handler_dir(h_name).join(&k), &v);
                    if self.soft(res)? {
                        if let Some(h) = self.live.handlers.get_mut(h_name) {
                            h.attributes.insert(k, v);
                        }
                    }
                }
            }

            for (d_name, want_d) in &want_h.devices {
                let live_d = self
                    .live
                    .handlers
                    .get(h_name)
                    .and_then(|h| h.devices.get(d_name))
                    .cloned();
                match live_d {
                    None => self.add_device(h_name, want_d)?,
                    Some(cur) => {
                        for (k, v) in want_d.attributes.diff(&cur.attributes) {
                            let res = self.write(device_dir(h_name, d_name).join(&k), &v);
                            if self.soft(res)? {
                                if let Some(d) = self
                                    .live
                                    .handlers
                                    .get_mut(h_name)
                                    .and_then(|h| h.devices.get_mut(d_name))
                                {
                                    d.attributes.insert(k, v);
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn add_device(&mut self, handler: &str, want: &Device) -> Result<()> {
        let mut cmd = format!("add_device {}", want.name);
        let primary = want.primary_attr();
        if let Some((k, v)) = primary {
            cmd.push_str(&format!(" {}={}", k, v));
        }

        // the device has to exist before anything else can bind it
        self.mgmt(handler_dir(handler), cmd)?;

        let mut applied = crate::model::Attrs::new();
        if let Some((k, v)) = primary {
            applied.insert(k, v);
        }

        for (k, v) in want.attributes.iter() {
            if primary.map_or(false, |(pk, _)| pk == k) {
                continue;
            }
            let res = self.write(device_dir(handler, &want.name).join(k), v);
            if self.soft(res)? {
                applied.insert(k, v);
            }
        }

        self.live
            .handlers
            .entry(handler.to_string())
            .or_insert_with(|| Handler {
                name: handler.to_string(),
                ..Default::default()
            })
            .devices
            .insert(
                want.name.clone(),
                Device {
                    name: want.name.clone(),
                    handler: handler.to_string(),
                    attributes: applied,
                },
            );

        Ok(())
    }

    fn converge_skeleton(&mut self, desired: &ScstConfig) -> Result<()> {
        for (drv_name, want_drv) in &desired.drivers {
            if !self.live.drivers.contains_key(drv_name) {
                // driver directories are owned by their kernel modules
                anyhow::bail!(ScstError::NoDriver(drv_name.clone()))
            }

            let live_attrs = self.live.drivers[drv_name].attributes.clone();
            for (k, v) in want_drv.attributes.diff(&live_attrs) {
                if driver_attr_needs_enable(drv_name, &k) {
                    continue; // held back until the driver is up
                }
                let res = self.write(driver_dir(drv_name).join(&k), &v);
                if self.soft(res)? {
                    if let Some(d) = self.live.drivers.get_mut(drv_name) {
                        d.attributes.insert(k, v);
                    }
                }
            }

            for (tgt_name, want_tgt) in &want_drv.targets {
                if !self.live.drivers[drv_name].targets.contains_key(tgt_name) {
                    if is_copy_manager(drv_name) {
                        continue; // built-in target, never created here
                    }
                    self.mgmt(driver_dir(drv_name), format!("add_target {}", tgt_name))?;
                    if let Some(d) = self.live.drivers.get_mut(drv_name) {
                        d.targets.insert(
                            tgt_name.clone(),
                            Target {
                                name: tgt_name.clone(),
                                enabled: Some(false),
                                ..Default::default()
                            },
                        );
                    }
                }

                self.converge_target_attrs(drv_name, tgt_name, want_tgt)?;

                for (g_name, want_g) in &want_tgt.ini_groups {
                    let missing = self
                        .live_target_mut(drv_name, tgt_name)
                        .map_or(true, |t| !t.ini_groups.contains_key(g_name));
                    if missing {
                        self.mgmt(
                            ini_groups_dir(drv_name, tgt_name),
                            format!("create {}", g_name),
                        )?;
                        if let Some(t) = self.live_target_mut(drv_name, tgt_name) {
                            t.ini_groups.insert(
                                g_name.clone(),
                                crate::model::IniGroup {
                                    name: g_name.clone(),
                                    ..Default::default()
                                },
                            );
                        }
                    }

                    let live_g_attrs = self
                        .live_target_mut(drv_name, tgt_name)
                        .and_then(|t| t.ini_groups.get(g_name))
                        .map(|g| g.attributes.clone())
                        .unwrap_or_default();
                    for (k, v) in want_g.attributes.diff(&live_g_attrs) {
                        let res = self.write(
                            ini_group_dir(drv_name, tgt_name, g_name).join(&k),
                            &v,
                        );
                        if self.soft(res)? {
                            if let Some(g) = self
                                .live_target_mut(drv_name, tgt_name)
                                .and_then(|t| t.ini_groups.get_mut(g_name))
                            {
                                g.attributes.insert(k, v);
                            }
                        }
                    }

                    for ini in &want_g.initiators {
                        let present = self
                            .live_target_mut(drv_name, tgt_name)
                            .and_then(|t| t.ini_groups.get(g_name))
                            .map_or(false, |g| g.initiators.contains(ini));
                        if present {
                            continue;
                        }
                        let res = self.mgmt(
                            group_inis_dir(drv_name, tgt_name, g_name),
                            format!("add {}", ini),
                        );
                        if self.soft(res)? {
                            if let Some(g) = self
                                .live_target_mut(drv_name, tgt_name)
                                .and_then(|t| t.ini_groups.get_mut(g_name))
                            {
                                g.initiators.push(ini.clone());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn converge_target_attrs(
        &mut self,
        drv_name: &str,
        tgt_name: &str,
        want_tgt: &Target,
    ) -> Result<()> {
        let live_view = self
            .live
            .drivers
            .get(drv_name)
            .and_then(|d| d.targets.get(tgt_name))
            .cloned()
            .unwrap_or_default();

        for (k, v) in want_tgt.attributes.diff(&live_view.attributes) {
            let live_enabled = self
                .live_target_mut(drv_name, tgt_name)
                .and_then(|t| t.enabled);
            if target_attr_needs_disable(drv_name, &k) && live_enabled == Some(true) {
                let res = self.write(target_dir(drv_name, tgt_name).join(FILE_ENABLED), "0");
                if self.soft(res)? {
                    if let Some(t) = self.live_target_mut(drv_name, tgt_name) {
                        t.enabled = Some(false);
                    }
                    if want_tgt.enabled != Some(false) {
                        self.reenable_targets
                            .insert((drv_name.to_string(), tgt_name.to_string()));
                    }
                }
            }

            let res = self.write(target_dir(drv_name, tgt_name).join(&k), &v);
            if self.soft(res)? {
                if let Some(t) = self.live_target_mut(drv_name, tgt_name) {
                    t.attributes.insert(k, v);
                }
            }
        }
        Ok(())
    }

    fn converge_luns(&mut self, desired: &ScstConfig) -> Result<()> {
        for (drv_name, want_drv) in &desired.drivers {
            for (tgt_name, want_tgt) in &want_drv.targets {
                if is_copy_manager(drv_name) && tgt_name == COPY_MANAGER_TGT {
                    // this run's device creations auto-mapped LUNs here
                    self.refresh_copy_manager_luns()?;
                }
                self.converge_lun_scope(
                    luns_dir(drv_name, tgt_name),
                    LunScope::Default {
                        driver: drv_name.clone(),
                        target: tgt_name.clone(),
                    },
                    &want_tgt.luns,
                )?;

                for (g_name, want_g) in &want_tgt.ini_groups {
                    self.converge_lun_scope(
                        group_luns_dir(drv_name, tgt_name, g_name),
                        LunScope::Group {
                            driver: drv_name.clone(),
                            target: tgt_name.clone(),
                            group: g_name.clone(),
                        },
                        &want_g.luns,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn converge_lun_scope(
        &mut self,
        dir: PathBuf,
        scope: LunScope,
        want: &BTreeMap<u64, Lun>,
    ) -> Result<()> {
        let current = self.live_luns(&scope).cloned().unwrap_or_default();
        let delta = diff_luns(want, &current);

        for id in delta.add {
            let lun = &want[&id];
            let mut cmd = format!("add {} {}", lun.device, id);
            if let Some(packed) = lun.attributes.pack() {
                cmd.push(' ');
                cmd.push_str(&packed);
            }
            let res = self.mgmt(dir.clone(), cmd);
            if self.soft(res)? {
                if let Some(set) = self.live_luns_mut(&scope) {
                    set.insert(id, lun.clone());
                }
            }
        }

        for id in delta.replace {
            let lun = &want[&id];
            let mut cmd = format!("replace {} {}", lun.device, id);
            if let Some(packed) = lun.attributes.pack() {
                cmd.push(' ');
                cmd.push_str(&packed);
            }
            let res = self.mgmt(dir.clone(), cmd);
            if self.soft(res)? {
                if let Some(set) = self.live_luns_mut(&scope) {
                    set.insert(id, lun.clone());
                }
            }
        }

        for (id, attrs) in delta.update {
            for (k, v) in attrs {
                let res = self.write(dir.join(id.to_string()).join(&k), &v);
                if self.soft(res)? {
                    if let Some(lun) = self.live_luns_mut(&scope).and_then(|s| s.get_mut(&id)) {
                        lun.attributes.insert(k.clone(), v);
                    }
                }
            }
        }

        Ok(())
    }

    fn live_luns(&self, scope: &LunScope) -> Option<&BTreeMap<u64, Lun>> {
        match scope {
            LunScope::Default { driver, target } => self
                .live
                .drivers
                .get(driver)
                .and_then(|d| d.targets.get(target))
                .map(|t| &t.luns),
            LunScope::Group {
                driver,
                target,
                group,
            } => self
                .live
                .drivers
                .get(driver)
                .and_then(|d| d.targets.get(target))
                .and_then(|t| t.ini_groups.get(group))
                .map(|g| &g.luns),
        }
    }

    fn live_luns_mut(&mut self, scope: &LunScope) -> Option<&mut BTreeMap<u64, Lun>> {
        match scope {
            LunScope::Default { driver, target } => {
                self.live_target_mut(driver, target).map(|t| &mut t.luns)
            }
            LunScope::Group {
                driver,
                target,
                group,
            } => self
                .live_target_mut(driver, target)
                .and_then(|t| t.ini_groups.get_mut(group))
                .map(|g| &mut g.luns),
        }
    }

    /// Re-lists the live copy-manager LUN set, picking up the mappings the
    /// subsystem auto-created while this run added devices.
    fn refresh_copy_manager_luns(&mut self) -> Result<()> {
        let dir = luns_dir(COPY_MANAGER, COPY_MANAGER_TGT);
        if !self.io.exists(&dir) {
            return Ok(());
        }

        let numeric = Regex::new(r"^\d+$").expect("static pattern");
        let mut luns = BTreeMap::new();
        for entry in self.io.list_dir(&dir)? {
            if !self.io.is_dir(&dir.join(&entry)) || !numeric.is_match(&entry) {
                continue;
            }
            let id = match entry.parse::<u64>() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let device = match self.io.link_name(&dir.join(&entry).join("device")) {
                Ok(device) => device,
                Err(_) => continue,
            };
            luns.insert(
                id,
                Lun {
                    id,
                    device,
                    attributes: Attrs::new(),
                },
            );
        }

        if let Some(cm) = self.live_target_mut(COPY_MANAGER, COPY_MANAGER_TGT) {
            cm.luns = luns;
        }
        Ok(())
    }

    /// The subsystem auto-maps every created device under the built-in
    /// copy-manager target. Re-list the live set now that this run's
    /// devices exist, and drop every mapping the declaration does not
    /// retain. The driver and target themselves are left alone.
    fn prune_copy_manager(&mut self, desired: &ScstConfig) -> Result<()> {
        let dir = luns_dir(COPY_MANAGER, COPY_MANAGER_TGT);
        if !self.io.exists(&dir) {
            return Ok(());
        }

        let policy = PrunePolicy::for_config(desired);
        let numeric = Regex::new(r"^\d+$").expect("static pattern");

        for entry in self.io.list_dir(&dir)? {
            if !self.io.is_dir(&dir.join(&entry)) || !numeric.is_match(&entry) {
                continue;
            }
            let id = match entry.parse::<u64>() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let device = match self.io.link_name(&dir.join(&entry).join("device")) {
                Ok(device) => device,
                Err(_) => continue,
            };
            if policy.retains(id, &device) {
                continue;
            }
            let res = self.mgmt(dir.clone(), format!("del {}", id));
            if self.soft(res)? {
                if let Some(cm) = self.live_target_mut(COPY_MANAGER, COPY_MANAGER_TGT) {
                    cm.luns.remove(&id);
                }
            }
        }

        Ok(())
    }

    fn converge_device_groups(&mut self, desired: &ScstConfig) -> Result<()> {
        for (dg_name, want_dg) in &desired.device_groups {
            if !self.live.device_groups.contains_key(dg_name) {
                self.mgmt(
                    PathBuf::from(DIR_DEVICE_GROUPS),
                    format!("create {}", dg_name),
                )?;
                self.live.device_groups.insert(
                    dg_name.clone(),
                    crate::model::DeviceGroup {
                        name: dg_name.clone(),
                        ..Default::default()
                    },
                );
            }

            for member in &want_dg.devices {
                let present = self.live.device_groups[dg_name].devices.contains(member);
                if present {
                    continue;
                }
                let res = self.mgmt(dg_devices_dir(dg_name), format!("add {}", member));
                if self.soft(res)? {
                    if let Some(dg) = self.live.device_groups.get_mut(dg_name) {
                        dg.devices.push(member.clone());
                    }
                }
            }

            for (tg_name, want_tg) in &want_dg.target_groups {
                if !self.live.device_groups[dg_name]
                    .target_groups
                    .contains_key(tg_name)
                {
                    self.mgmt(tgs_dir(dg_name), format!("create {}", tg_name))?;
                    if let Some(dg) = self.live.device_groups.get_mut(dg_name) {
                        dg.target_groups.insert(
                            tg_name.clone(),
                            crate::model::TargetGroup {
                                name: tg_name.clone(),
                                ..Default::default()
                            },
                        );
                    }
                }

                let live_tg_attrs = self.live.device_groups[dg_name].target_groups[tg_name]
                    .attributes
                    .clone();
                for (k, v) in want_tg.attributes.diff(&live_tg_attrs) {
                    let res = self.write(tg_dir(dg_name, tg_name).join(&k), &v);
                    if self.soft(res)? {
                        if let Some(tg) = self
                            .live
                            .device_groups
                            .get_mut(dg_name)
                            .and_then(|dg| dg.target_groups.get_mut(tg_name))
                        {
                            tg.attributes.insert(k, v);
                        }
                    }
                }

                for (member, want_ref) in &want_tg.targets {
                    let present = self.live.device_groups[dg_name].target_groups[tg_name]
                        .targets
                        .contains_key(member);
                    if !present {
                        let res =
                            self.mgmt(tg_dir(dg_name, tg_name), format!("add {}", member));
                        if self.soft(res)? {
                            if let Some(tg) = self
                                .live
                                .device_groups
                                .get_mut(dg_name)
                                .and_then(|dg| dg.target_groups.get_mut(tg_name))
                            {
                                tg.targets.insert(
                                    member.clone(),
                                    crate::model::TgtRef {
                                        name: member.clone(),
                                        ..Default::default()
                                    },
                                );
                            }
                        } else {
                            continue;
                        }
                    }

                    let live_ref_attrs = self.live.device_groups[dg_name].target_groups
                        [tg_name]
                        .targets
                        .get(member)
                        .map(|r| r.attributes.clone())
                        .unwrap_or_default();
                    for (k, v) in want_ref.attributes.diff(&live_ref_attrs) {
                        let res =
                            self.write(tg_member_dir(dg_name, tg_name, member).join(&k), &v);
                        if self.soft(res)? {
                            if let Some(r) = self
                                .live
                                .device_groups
                                .get_mut(dg_name)
                                .and_then(|dg| dg.target_groups.get_mut(tg_name))
                                .and_then(|tg| tg.targets.get_mut(member))
                            {
                                r.attributes.insert(k, v);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn enable_targets(&mut self, desired: &ScstConfig) -> Result<()> {
        for (drv_name, want_drv) in &desired.drivers {
            if is_copy_manager(drv_name) {
                continue;
            }
            for (tgt_name, want_tgt) in &want_drv.targets {
                let forced = self
                    .reenable_targets
                    .contains(&(drv_name.clone(), tgt_name.clone()));
                let goal = match want_tgt.enabled {
                    Some(v) => Some(v),
                    None if forced => Some(true),
                    None => None,
                };
                let goal = match goal {
                    Some(g) => g,
                    None => continue,
                };

                let live_en = self
                    .live
                    .drivers
                    .get(drv_name)
                    .and_then(|d| d.targets.get(tgt_name))
                    .and_then(|t| t.enabled);
                if live_en.is_none() || live_en == Some(goal) {
                    continue;
                }

                let value = if goal { "1" } else { "0" };
                self.write(target_dir(drv_name, tgt_name).join(FILE_ENABLED), value)?;
                if let Some(t) = self.live_target_mut(drv_name, tgt_name) {
                    t.enabled = Some(goal);
                }
            }
        }
        Ok(())
    }

    fn enable_drivers(&mut self, desired: &ScstConfig) -> Result<()> {
        for (drv_name, want_drv) in &desired.drivers {
            if is_copy_manager(drv_name) {
                continue;
            }
            let goal = match want_drv.enabled {
                Some(g) => g,
                None => continue,
            };
            let live_en = self.live.drivers.get(drv_name).and_then(|d| d.enabled);
            if live_en.is_none() || live_en == Some(goal) {
                continue;
            }

            let value = if goal { "1" } else { "0" };
            self.write(driver_dir(drv_name).join(FILE_ENABLED), value)?;
            if let Some(d) = self.live.drivers.get_mut(drv_name) {
                d.enabled = Some(goal);
            }
        }
        Ok(())
    }

    fn post_enable_driver_attrs(&mut self, desired: &ScstConfig) -> Result<()> {
        for (drv_name, want_drv) in &desired.drivers {
            let live_attrs = self
                .live
                .drivers
                .get(drv_name)
                .map(|d| d.attributes.clone())
                .unwrap_or_default();
            for (k, v) in want_drv.attributes.diff(&live_attrs) {
                if !driver_attr_needs_enable(drv_name, &k) {
                    continue;
                }
                let res = self.write(driver_dir(drv_name).join(&k), &v);
                if self.soft(res)? {
                    if let Some(d) = self.live.drivers.get_mut(drv_name) {
                        d.attributes.insert(k, v);
                    }
                }
            }
        }
        Ok(())
    }
}

enum LunScope {
    Default {
        driver: String,
        target: String,
    },
    Group {
        driver: String,
        target: String,
        group: String,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conf::parse_str;
    use crate::mock::{MockFs, NullLoader};
    use crate::reader::read_state;

    fn parse(text: &str) -> ScstConfig {
        parse_str(text, "test.conf").unwrap()
    }

    fn apply(mock: &MockFs, cfg: &ScstConfig) -> ApplyReport {
        Engine::new(mock, &NullLoader)
            .apply(cfg, &ApplyOptions::default())
            .unwrap()
    }

    const ONE_TARGET: &str = "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }\n\
                              TARGET_DRIVER iscsi {\n\
                                TARGET iqn.x:t1 { LUN 0 d1\n\
                                                  enabled 1 }\n\
                                enabled 1\n\
                              }";

    fn index_of(log: &[String], needle: &str) -> usize {
        log.iter()
            .position(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("'{}' not in log: {:#?}", needle, log))
    }

    #[test]
    fn test_fresh_apply_operation_order() {
        let mock = MockFs::new();
        apply(&mock, &parse(ONE_TARGET));

        assert_eq!(
            mock.log(),
            vec![
                "M handlers/vdisk_fileio add_device d1 filename=/v/d1.img".to_string(),
                "M targets/iscsi add_target iqn.x:t1".to_string(),
                "M targets/iscsi/iqn.x:t1/luns add d1 0".to_string(),
                "W targets/iscsi/iqn.x:t1/enabled 1".to_string(),
                "W targets/iscsi/enabled 1".to_string(),
            ]
        );
        assert_eq!(mock.driver_enabled("iscsi"), Some(true));
        assert_eq!(mock.target_enabled("iscsi", "iqn.x:t1"), Some(true));
    }

    #[test]
    fn test_second_apply_is_a_noop() {
        let mock = MockFs::new();
        let cfg = parse(ONE_TARGET);
        let first = apply(&mock, &cfg);
        assert!(first.mutations > 0);

        mock.clear_log();
        let second = apply(&mock, &cfg);
        assert_eq!(second.mutations, 0);
        assert!(mock.log().is_empty());
    }

    #[test]
    fn test_lun_number_swap_uses_replace() {
        let mock = MockFs::new();
        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio {\n\
                   DEVICE d1 { filename /v/d1.img }\n\
                   DEVICE d2 { filename /v/d2.img }\n\
                 }\n\
                 TARGET_DRIVER iscsi { TARGET iqn.x:t1 { LUN 0 d1 } }",
            ),
        );
        mock.clear_log();

        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio {\n\
                   DEVICE d1 { filename /v/d1.img }\n\
                   DEVICE d2 { filename /v/d2.img }\n\
                 }\n\
                 TARGET_DRIVER iscsi { TARGET iqn.x:t1 { LUN 0 d2 } }",
            ),
        );

        let lun_ops: Vec<String> = mock
            .log()
            .into_iter()
            .filter(|l| l.contains("/luns"))
            .collect();
        assert_eq!(
            lun_ops,
            vec!["M targets/iscsi/iqn.x:t1/luns replace d2 0".to_string()]
        );
        assert_eq!(mock.lun_map("iscsi", "iqn.x:t1"), vec![(0, "d2".to_string())]);
    }

    #[test]
    fn test_device_handler_change() {
        let mock = MockFs::new();
        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }\n\
                 TARGET_DRIVER iscsi { TARGET iqn.x:t1 { LUN 0 d1 } }",
            ),
        );
        mock.clear_log();

        apply(
            &mock,
            &parse(
                "HANDLER vdisk_blockio { DEVICE d1 { filename /dev/sdb } }\n\
                 TARGET_DRIVER iscsi { TARGET iqn.x:t1 { LUN 0 d1 } }",
            ),
        );

        let log = mock.log();
        let lun_del = index_of(&log, "luns del 0");
        let dev_del = index_of(&log, "M handlers/vdisk_fileio del_device d1");
        let dev_add = index_of(&log, "M handlers/vdisk_blockio add_device d1 filename=/dev/sdb");
        let lun_add = index_of(&log, "luns add d1 0");
        assert!(lun_del < dev_del && dev_del < dev_add && dev_add < lun_add);

        assert_eq!(mock.device_names("vdisk_fileio"), Vec::<String>::new());
        assert_eq!(mock.device_names("vdisk_blockio"), vec!["d1".to_string()]);
    }

    #[test]
    fn test_restricted_attr_forces_disable_cycle() {
        let mock = MockFs::new();
        apply(&mock, &parse(ONE_TARGET));
        mock.clear_log();

        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }\n\
                 TARGET_DRIVER iscsi {\n\
                   TARGET iqn.x:t1 {\n\
                     allowed_portal 10.1.1.1\n\
                     LUN 0 d1\n\
                     enabled 1\n\
                   }\n\
                   enabled 1\n\
                 }",
            ),
        );

        let log = mock.log();
        let disable = index_of(&log, "W targets/iscsi/iqn.x:t1/enabled 0");
        let attr = index_of(&log, "W targets/iscsi/iqn.x:t1/allowed_portal 10.1.1.1");
        let enable = index_of(&log, "W targets/iscsi/iqn.x:t1/enabled 1");
        assert!(disable < attr && attr < enable);
        assert_eq!(mock.target_enabled("iscsi", "iqn.x:t1"), Some(true));
    }

    #[test]
    fn test_clear_leaves_only_copy_manager() {
        let mock = MockFs::new();
        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio {\n\
                   DEVICE d1 { filename /v/d1.img }\n\
                   DEVICE d2 { filename /v/d2.img }\n\
                 }\n\
                 TARGET_DRIVER iscsi {\n\
                   enabled 1\n\
                   TARGET iqn.x:t1 {\n\
                     enabled 1\n\
                     LUN 0 d1\n\
                     GROUP g1 { INITIATOR iqn.y:ini\n LUN 0 d2 }\n\
                   }\n\
                 }\n\
                 DEVICE_GROUP dg1 {\n\
                   DEVICE d1\n\
                   TARGET_GROUP tgA { TARGET iqn.x:t1 { rel_tgt_id 1 } }\n\
                 }",
            ),
        );

        let report = Engine::new(&mock, &NullLoader)
            .clear(&ApplyOptions::default())
            .unwrap();
        assert!(report.mutations > 0);

        assert!(mock.device_names("vdisk_fileio").is_empty());
        assert!(mock.target_names("iscsi").is_empty());
        assert_eq!(
            mock.target_names("copy_manager"),
            vec!["copy_manager_tgt".to_string()]
        );
        assert!(mock.lun_map("copy_manager", "copy_manager_tgt").is_empty());
        assert!(!mock.has_device_group("dg1"));
    }

    #[test]
    fn test_removal_failure_aggregates_and_continues() {
        let mock = MockFs::new();
        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio {\n\
                   DEVICE d1 { filename /v/d1.img }\n\
                   DEVICE d2 { filename /v/d2.img }\n\
                 }",
            ),
        );
        mock.clear_log();
        mock.fail_command("del_device d1", "-16");

        let err = Engine::new(&mock, &NullLoader)
            .clear(&ApplyOptions::default())
            .unwrap_err();
        match err.downcast_ref::<ScstError>() {
            Some(ScstError::Partial { errors }) => assert_eq!(errors.len(), 1),
            other => panic!("expected partial convergence, got {:?}", other),
        }

        // the failing removal did not stop the rest of the phase
        assert_eq!(mock.device_names("vdisk_fileio"), vec!["d1".to_string()]);
    }

    #[test]
    fn test_cancellation_stops_before_first_mutation() {
        let mock = MockFs::new();
        let flag = Arc::new(AtomicBool::new(true));
        let opts = ApplyOptions {
            cancel: Some(flag),
            ..Default::default()
        };

        let err = Engine::new(&mock, &NullLoader)
            .apply(&parse(ONE_TARGET), &opts)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScstError>(),
            Some(ScstError::Cancelled)
        ));
        assert!(mock.log().is_empty());
    }

    #[test]
    fn test_suspension_brackets_the_run() {
        let mock = MockFs::new();
        let opts = ApplyOptions {
            suspend: Some(1),
            ..Default::default()
        };
        Engine::new(&mock, &NullLoader)
            .apply(&parse(ONE_TARGET), &opts)
            .unwrap();

        let log = mock.log();
        assert_eq!(log.first().unwrap(), "W suspend 1");
        assert_eq!(log.last().unwrap(), "W suspend 0");
    }

    #[test]
    fn test_copy_manager_pruned_to_declared_devices() {
        let mock = MockFs::new();
        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio {\n\
                   DEVICE d1 { filename /v/d1.img }\n\
                   DEVICE d2 { filename /v/d2.img }\n\
                 }",
            ),
        );
        // both devices were auto-mapped
        assert_eq!(mock.lun_map("copy_manager", "copy_manager_tgt").len(), 2);

        // a declared copy-manager set pins the mapping to d1 only
        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio {\n\
                   DEVICE d1 { filename /v/d1.img }\n\
                   DEVICE d2 { filename /v/d2.img }\n\
                 }\n\
                 TARGET_DRIVER copy_manager {\n\
                   TARGET copy_manager_tgt { LUN 0 d1 }\n\
                 }",
            ),
        );
        assert_eq!(
            mock.lun_map("copy_manager", "copy_manager_tgt"),
            vec![(0, "d1".to_string())]
        );
    }

    #[test]
    fn test_copy_manager_follows_declared_numbering() {
        let mock = MockFs::new();
        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }\n\
                 TARGET_DRIVER copy_manager {\n\
                   TARGET copy_manager_tgt { LUN 5 d1 }\n\
                 }",
            ),
        );
        assert_eq!(
            mock.lun_map("copy_manager", "copy_manager_tgt"),
            vec![(5, "d1".to_string())]
        );
    }

    #[test]
    fn test_device_group_convergence() {
        let mock = MockFs::new();
        let cfg = parse(
            "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }\n\
             TARGET_DRIVER iscsi { TARGET iqn.x:t1 { LUN 0 d1 } }\n\
             DEVICE_GROUP dg1 {\n\
               DEVICE d1\n\
               TARGET_GROUP tgA {\n\
                 group_id 7\n\
                 TARGET iqn.x:t1 { rel_tgt_id 3\n preferred 1 }\n\
               }\n\
             }",
        );
        apply(&mock, &cfg);

        assert!(mock.has_device_group("dg1"));
        assert_eq!(mock.device_group_members("dg1"), vec!["d1".to_string()]);
        assert_eq!(
            mock.target_group_members("dg1", "tgA"),
            vec!["iqn.x:t1".to_string()]
        );

        // dropping the group from the declaration removes it
        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }\n\
                 TARGET_DRIVER iscsi { TARGET iqn.x:t1 { LUN 0 d1 } }",
            ),
        );
        assert!(!mock.has_device_group("dg1"));
    }

    #[test]
    fn test_initiator_membership_converges() {
        let mock = MockFs::new();
        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }\n\
                 TARGET_DRIVER iscsi {\n\
                   TARGET iqn.x:t1 {\n\
                     GROUP g1 { INITIATOR iqn.y:a\n INITIATOR iqn.y:b\n LUN 0 d1 }\n\
                   }\n\
                 }",
            ),
        );

        apply(
            &mock,
            &parse(
                "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }\n\
                 TARGET_DRIVER iscsi {\n\
                   TARGET iqn.x:t1 {\n\
                     GROUP g1 { INITIATOR iqn.y:b\n INITIATOR iqn.y:c\n LUN 0 d1 }\n\
                   }\n\
                 }",
            ),
        );

        let cfg = read_state(&mock).unwrap();
        let group = cfg
            .get_driver("iscsi")
            .unwrap()
            .get_target("iqn.x:t1")
            .unwrap()
            .get_ini_group("g1")
            .unwrap();
        let mut inis = group.initiators().to_vec();
        inis.sort();
        assert_eq!(inis, vec!["iqn.y:b".to_string(), "iqn.y:c".to_string()]);
    }

    #[test]
    fn test_reader_round_trip_after_apply() {
        let mock = MockFs::new();
        let cfg = parse(
            "setup_id 0x20\n\
             HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img\n nv_cache 1 } }\n\
             TARGET_DRIVER iscsi {\n\
               enabled 1\n\
               TARGET iqn.x:t1 {\n\
                 enabled 1\n\
                 LUN 0 d1 read_only=1\n\
                 GROUP g1 { INITIATOR iqn.y:ini\n LUN 1 d1 }\n\
               }\n\
             }",
        );
        apply(&mock, &cfg);

        let live = read_state(&mock).unwrap();
        assert_eq!(live.attributes().get("setup_id"), Some("0x20"));

        let dev = live
            .get_handler("vdisk_fileio")
            .unwrap()
            .get_device("d1")
            .unwrap();
        assert_eq!(dev.attributes(), cfg.get_handler("vdisk_fileio").unwrap().get_device("d1").unwrap().attributes());

        let want_tgt = cfg.get_driver("iscsi").unwrap().get_target("iqn.x:t1").unwrap();
        let live_tgt = live.get_driver("iscsi").unwrap().get_target("iqn.x:t1").unwrap();
        assert_eq!(live_tgt.enabled(), Some(true));
        assert_eq!(live_tgt.luns().len(), want_tgt.luns().len());
        assert_eq!(
            live_tgt.get_lun(0).unwrap().attributes().get("read_only"),
            Some("1")
        );
        assert_eq!(
            live_tgt.get_ini_group("g1").unwrap().initiators(),
            &["iqn.y:ini".to_string()]
        );
    }

    #[test]
    fn test_check_mutates_nothing() {
        let mock = MockFs::new();
        let plan = Engine::new(&mock, &NullLoader)
            .check(&parse(ONE_TARGET))
            .unwrap();

        assert!(!plan.is_empty());
        assert!(plan.iter().any(|l| l.contains("create device d1")));
        assert!(plan.iter().any(|l| l.contains("enable driver iscsi")));
        assert!(mock.log().is_empty());
    }

    #[test]
    fn test_post_enable_driver_attribute_written_last() {
        let mock = MockFs::new();
        apply(
            &mock,
            &parse(
                "TARGET_DRIVER iscsi {\n\
                   enabled 1\n\
                   iSNSServer 10.0.0.9\n\
                 }",
            ),
        );

        let log = mock.log();
        let enable = index_of(&log, "W targets/iscsi/enabled 1");
        let attr = index_of(&log, "W targets/iscsi/iSNSServer 10.0.0.9");
        assert!(enable < attr);
    }
}
