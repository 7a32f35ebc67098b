//! In-memory control filesystem that interprets management commands the
//! way the kernel side does, including the automatic copy-manager mapping
//! of created devices. Records every mutation for order-sensitive
//! assertions.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::modules::ModuleLoader;
use crate::sysfs::{ControlIo, SysAttr};
use crate::ScstError;

type AttrMap = BTreeMap<String, (String, bool)>;

#[derive(Debug, Default)]
struct MockDevice {
    attrs: AttrMap,
}

#[derive(Debug, Default)]
struct MockHandler {
    attrs: AttrMap,
    devices: BTreeMap<String, MockDevice>,
}

#[derive(Debug, Default, Clone)]
struct MockLun {
    device: String,
    attrs: AttrMap,
}

#[derive(Debug, Default)]
struct MockGroup {
    attrs: AttrMap,
    luns: BTreeMap<u64, MockLun>,
    initiators: Vec<String>,
}

#[derive(Debug, Default)]
struct MockTarget {
    enabled: Option<bool>,
    attrs: AttrMap,
    luns: BTreeMap<u64, MockLun>,
    groups: BTreeMap<String, MockGroup>,
}

#[derive(Debug, Default)]
struct MockDriver {
    enabled: Option<bool>,
    attrs: AttrMap,
    targets: BTreeMap<String, MockTarget>,
}

#[derive(Debug, Default)]
struct MockTg {
    attrs: AttrMap,
    members: BTreeMap<String, AttrMap>,
}

#[derive(Debug, Default)]
struct MockDg {
    devices: Vec<String>,
    tgroups: BTreeMap<String, MockTg>,
}

#[derive(Debug, Default)]
struct MockState {
    root_attrs: AttrMap,
    handlers: BTreeMap<String, MockHandler>,
    drivers: BTreeMap<String, MockDriver>,
    dgs: BTreeMap<String, MockDg>,
}

pub(crate) struct MockFs {
    state: RefCell<MockState>,
    log: RefCell<Vec<String>>,
    fail: RefCell<Vec<(String, String)>>,
}

pub(crate) struct NullLoader;

impl ModuleLoader for NullLoader {
    fn load(&self, _name: &str, _optional: bool) -> Result<()> {
        Ok(())
    }
}

fn comps(rel: &Path) -> Vec<String> {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect()
}

fn not_found(rel: &Path) -> anyhow::Error {
    ScstError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no such entry: {}", rel.display()),
    ))
    .into()
}

fn mgmt_fail(dir: &Path, cmd: &str, status: &str) -> anyhow::Error {
    ScstError::MgmtFail {
        path: dir.join("mgmt").display().to_string(),
        cmd: cmd.to_string(),
        status: status.to_string(),
    }
    .into()
}

fn parse_assigns(words: &[&str]) -> Result<AttrMap> {
    let mut attrs = AttrMap::new();
    for word in words {
        let (k, v) = word
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("bad parameter '{}'", word))?;
        attrs.insert(k.to_string(), (v.to_string(), true));
    }
    Ok(attrs)
}

/// Device creation auto-maps the device at the next free copy-manager LUN.
fn auto_map(state: &mut MockState, device: &str) {
    if let Some(cm) = state
        .drivers
        .get_mut("copy_manager")
        .and_then(|d| d.targets.get_mut("copy_manager_tgt"))
    {
        let id = cm.luns.keys().next_back().map_or(0, |last| last + 1);
        cm.luns.insert(
            id,
            MockLun {
                device: device.to_string(),
                attrs: AttrMap::new(),
            },
        );
    }
}

fn device_referenced(state: &MockState, device: &str) -> bool {
    state.drivers.iter().any(|(name, driver)| {
        name != "copy_manager"
            && driver.targets.values().any(|t| {
                t.luns.values().any(|l| l.device == device)
                    || t.groups
                        .values()
                        .any(|g| g.luns.values().any(|l| l.device == device))
            })
    })
}

fn lun_cmd(
    luns: &mut BTreeMap<u64, MockLun>,
    device_exists: impl Fn(&str) -> bool,
    words: &[&str],
) -> std::result::Result<(), String> {
    match words {
        ["add", dev, id, rest @ ..] => {
            let id: u64 = id.parse().map_err(|_| "bad LUN number".to_string())?;
            if luns.contains_key(&id) {
                return Err("LUN already exists".to_string());
            }
            if !device_exists(dev) {
                return Err(format!("no such device '{}'", dev));
            }
            let attrs = parse_assigns(rest).map_err(|e| e.to_string())?;
            luns.insert(
                id,
                MockLun {
                    device: dev.to_string(),
                    attrs,
                },
            );
            Ok(())
        }
        ["replace", dev, id, rest @ ..] => {
            let id: u64 = id.parse().map_err(|_| "bad LUN number".to_string())?;
            if !device_exists(dev) {
                return Err(format!("no such device '{}'", dev));
            }
            let attrs = parse_assigns(rest).map_err(|e| e.to_string())?;
            luns.insert(
                id,
                MockLun {
                    device: dev.to_string(),
                    attrs,
                },
            );
            Ok(())
        }
        ["del", id] => {
            let id: u64 = id.parse().map_err(|_| "bad LUN number".to_string())?;
            luns.remove(&id)
                .map(|_| ())
                .ok_or_else(|| "no such LUN".to_string())
        }
        ["clear"] => {
            luns.clear();
            Ok(())
        }
        _ => Err("unknown command".to_string()),
    }
}

impl MockFs {
    pub fn new() -> Self {
        let mut state = MockState::default();
        for handler in ["vdisk_fileio", "vdisk_blockio", "vdisk_nullio", "dev_disk"] {
            state
                .handlers
                .insert(handler.to_string(), MockHandler::default());
        }
        state.drivers.insert(
            "iscsi".to_string(),
            MockDriver {
                enabled: Some(false),
                ..Default::default()
            },
        );
        let mut cm = MockDriver::default();
        cm.targets
            .insert("copy_manager_tgt".to_string(), MockTarget::default());
        state.drivers.insert("copy_manager".to_string(), cm);

        MockFs {
            state: RefCell::new(state),
            log: RefCell::new(Vec::new()),
            fail: RefCell::new(Vec::new()),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
    }

    /// Every management command or attribute write whose log line contains
    /// `needle` fails with `status` from now on.
    pub fn fail_command(&self, needle: &str, status: &str) {
        self.fail
            .borrow_mut()
            .push((needle.to_string(), status.to_string()));
    }

    fn fail_for(&self, line: &str) -> Option<String> {
        self.fail
            .borrow()
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, status)| status.clone())
    }

    // --- seeding -------------------------------------------------------

    pub fn seed_device(&self, handler: &str, name: &str, attrs: &[(&str, &str)]) {
        {
            let mut st = self.state.borrow_mut();
            let h = st.handlers.entry(handler.to_string()).or_default();
            let mut dev = MockDevice::default();
            for (k, v) in attrs {
                dev.attrs
                    .insert(k.to_string(), (v.to_string(), true));
            }
            h.devices.insert(name.to_string(), dev);
        }
        auto_map(&mut self.state.borrow_mut(), name);
    }

    /// Stores an attribute value that is *not* tagged as explicitly set.
    pub fn seed_plain_attr(&self, path: &str, value: &str) {
        let rel = Path::new(path).to_path_buf();
        let mut st = self.state.borrow_mut();
        if let Some(slot) = attr_slot(&mut st, &comps(&rel)) {
            slot.insert(
                rel.file_name().unwrap().to_string_lossy().to_string(),
                (value.to_string(), false),
            );
        }
    }

    pub fn seed_target(&self, driver: &str, name: &str) {
        let mut st = self.state.borrow_mut();
        let d = st.drivers.entry(driver.to_string()).or_default();
        d.targets.insert(
            name.to_string(),
            MockTarget {
                enabled: Some(false),
                ..Default::default()
            },
        );
    }

    pub fn seed_lun(&self, driver: &str, target: &str, id: u64, device: &str) {
        let mut st = self.state.borrow_mut();
        if let Some(t) = st
            .drivers
            .get_mut(driver)
            .and_then(|d| d.targets.get_mut(target))
        {
            t.luns.insert(
                id,
                MockLun {
                    device: device.to_string(),
                    attrs: AttrMap::new(),
                },
            );
        }
    }

    pub fn seed_ini_group(&self, driver: &str, target: &str, group: &str) {
        let mut st = self.state.borrow_mut();
        if let Some(t) = st
            .drivers
            .get_mut(driver)
            .and_then(|d| d.targets.get_mut(target))
        {
            t.groups.insert(group.to_string(), MockGroup::default());
        }
    }

    pub fn seed_initiator(&self, driver: &str, target: &str, group: &str, ini: &str) {
        let mut st = self.state.borrow_mut();
        if let Some(g) = st
            .drivers
            .get_mut(driver)
            .and_then(|d| d.targets.get_mut(target))
            .and_then(|t| t.groups.get_mut(group))
        {
            g.initiators.push(ini.to_string());
        }
    }

    // --- inspection ----------------------------------------------------

    pub fn device_names(&self, handler: &str) -> Vec<String> {
        self.state
            .borrow()
            .handlers
            .get(handler)
            .map(|h| h.devices.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn target_names(&self, driver: &str) -> Vec<String> {
        self.state
            .borrow()
            .drivers
            .get(driver)
            .map(|d| d.targets.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn lun_map(&self, driver: &str, target: &str) -> Vec<(u64, String)> {
        self.state
            .borrow()
            .drivers
            .get(driver)
            .and_then(|d| d.targets.get(target))
            .map(|t| {
                t.luns
                    .iter()
                    .map(|(id, lun)| (*id, lun.device.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn driver_enabled(&self, driver: &str) -> Option<bool> {
        self.state
            .borrow()
            .drivers
            .get(driver)
            .and_then(|d| d.enabled)
    }

    pub fn target_enabled(&self, driver: &str, target: &str) -> Option<bool> {
        self.state
            .borrow()
            .drivers
            .get(driver)
            .and_then(|d| d.targets.get(target))
            .and_then(|t| t.enabled)
    }

    pub fn has_device_group(&self, name: &str) -> bool {
        self.state.borrow().dgs.contains_key(name)
    }

    pub fn device_group_members(&self, name: &str) -> Vec<String> {
        self.state
            .borrow()
            .dgs
            .get(name)
            .map(|dg| dg.devices.clone())
            .unwrap_or_default()
    }

    pub fn target_group_members(&self, dg: &str, tg: &str) -> Vec<String> {
        self.state
            .borrow()
            .dgs
            .get(dg)
            .and_then(|dg| dg.tgroups.get(tg))
            .map(|tg| tg.members.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Resolves the attribute map a path's final component lives in. The slice
/// holds the full component list including the attribute name.
fn attr_slot<'a>(state: &'a mut MockState, comps: &[String]) -> Option<&'a mut AttrMap> {
    let s: Vec<&str> = comps.iter().map(|c| c.as_str()).collect();
    match s.as_slice() {
        [_attr] => Some(&mut state.root_attrs),
        ["handlers", h, _attr] => state.handlers.get_mut(*h).map(|h| &mut h.attrs),
        ["handlers", h, d, _attr] => state
            .handlers
            .get_mut(*h)
            .and_then(|h| h.devices.get_mut(*d))
            .map(|d| &mut d.attrs),
        ["targets", d, _attr] => state.drivers.get_mut(*d).map(|d| &mut d.attrs),
        ["targets", d, t, _attr] => state
            .drivers
            .get_mut(*d)
            .and_then(|d| d.targets.get_mut(*t))
            .map(|t| &mut t.attrs),
        ["targets", d, t, "luns", n, _attr] => {
            let id: u64 = n.parse().ok()?;
            state
                .drivers
                .get_mut(*d)
                .and_then(|d| d.targets.get_mut(*t))
                .and_then(|t| t.luns.get_mut(&id))
                .map(|l| &mut l.attrs)
        }
        ["targets", d, t, "ini_groups", g, _attr] => state
            .drivers
            .get_mut(*d)
            .and_then(|d| d.targets.get_mut(*t))
            .and_then(|t| t.groups.get_mut(*g))
            .map(|g| &mut g.attrs),
        ["targets", d, t, "ini_groups", g, "luns", n, _attr] => {
            let id: u64 = n.parse().ok()?;
            state
                .drivers
                .get_mut(*d)
                .and_then(|d| d.targets.get_mut(*t))
                .and_then(|t| t.groups.get_mut(*g))
                .and_then(|g| g.luns.get_mut(&id))
                .map(|l| &mut l.attrs)
        }
        ["device_groups", dg, "target_groups", tg, _attr] => state
            .dgs
            .get_mut(*dg)
            .and_then(|dg| dg.tgroups.get_mut(*tg))
            .map(|tg| &mut tg.attrs),
        ["device_groups", dg, "target_groups", tg, m, _attr] => state
            .dgs
            .get_mut(*dg)
            .and_then(|dg| dg.tgroups.get_mut(*tg))
            .and_then(|tg| tg.members.get_mut(*m)),
        _ => None,
    }
}

impl ControlIo for MockFs {
    fn read_attr(&self, rel: &Path) -> Result<SysAttr> {
        let c = comps(rel);
        let s: Vec<&str> = c.iter().map(|x| x.as_str()).collect();
        let st = self.state.borrow();

        let enabled_attr = |enabled: Option<bool>| -> Result<SysAttr> {
            match enabled {
                Some(v) => Ok(SysAttr {
                    value: if v { "1" } else { "0" }.to_string(),
                    is_key: false,
                }),
                None => Err(not_found(rel)),
            }
        };

        match s.as_slice() {
            ["last_sysfs_mgmt_res"] => Ok(SysAttr {
                value: "0".to_string(),
                is_key: false,
            }),
            ["targets", d, "enabled"] => {
                enabled_attr(st.drivers.get(*d).ok_or_else(|| not_found(rel))?.enabled)
            }
            ["targets", d, t, "enabled"] => enabled_attr(
                st.drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .ok_or_else(|| not_found(rel))?
                    .enabled,
            ),
            _ => {
                drop(st);
                let mut st = self.state.borrow_mut();
                let attr = c.last().cloned().ok_or_else(|| not_found(rel))?;
                let slot = attr_slot(&mut st, &c).ok_or_else(|| not_found(rel))?;
                let (value, is_key) = slot.get(&attr).cloned().ok_or_else(|| not_found(rel))?;
                Ok(SysAttr { value, is_key })
            }
        }
    }

    fn write_attr(&self, rel: &Path, value: &str, verify: bool) -> Result<()> {
        let line = format!("W {} {}", rel.display(), value);
        self.log.borrow_mut().push(line.clone());
        if let Some(status) = self.fail_for(&line) {
            if verify {
                anyhow::bail!(ScstError::SetAttrFail {
                    path: rel.display().to_string(),
                    value: value.to_string(),
                    status,
                })
            }
            return Ok(());
        }

        let c = comps(rel);
        let s: Vec<&str> = c.iter().map(|x| x.as_str()).collect();
        let mut st = self.state.borrow_mut();

        match s.as_slice() {
            ["suspend"] => {
                st.root_attrs
                    .insert("suspend".to_string(), (value.to_string(), false));
                Ok(())
            }
            ["targets", d, "enabled"] => {
                let driver = st.drivers.get_mut(*d).ok_or_else(|| not_found(rel))?;
                if driver.enabled.is_none() {
                    return Err(not_found(rel));
                }
                driver.enabled = Some(value.trim() == "1");
                Ok(())
            }
            ["targets", d, t, "enabled"] => {
                let target = st
                    .drivers
                    .get_mut(*d)
                    .and_then(|d| d.targets.get_mut(*t))
                    .ok_or_else(|| not_found(rel))?;
                if target.enabled.is_none() {
                    return Err(not_found(rel));
                }
                target.enabled = Some(value.trim() == "1");
                Ok(())
            }
            ["targets", d, t, attr] => {
                let target = st
                    .drivers
                    .get_mut(*d)
                    .and_then(|dr| dr.targets.get_mut(*t))
                    .ok_or_else(|| not_found(rel))?;
                // the kernel rejects these while the target accepts I/O
                if matches!(*attr, "rel_tgt_id" | "allowed_portal")
                    && target.enabled == Some(true)
                {
                    anyhow::bail!(ScstError::SetAttrFail {
                        path: rel.display().to_string(),
                        value: value.to_string(),
                        status: "-16".to_string(),
                    })
                }
                target
                    .attrs
                    .insert(attr.to_string(), (value.to_string(), true));
                Ok(())
            }
            _ => {
                let attr = c.last().cloned().ok_or_else(|| not_found(rel))?;
                let slot = attr_slot(&mut st, &c).ok_or_else(|| not_found(rel))?;
                slot.insert(attr, (value.to_string(), true));
                Ok(())
            }
        }
    }

    fn mgmt(&self, dir: &Path, cmd: &str, verify: bool) -> Result<()> {
        let line = format!("M {} {}", dir.display(), cmd);
        self.log.borrow_mut().push(line.clone());
        if let Some(status) = self.fail_for(&line) {
            if verify {
                return Err(mgmt_fail(dir, cmd, &status));
            }
            return Ok(());
        }

        let words: Vec<&str> = cmd.split_whitespace().collect();
        let c = comps(dir);
        let s: Vec<&str> = c.iter().map(|x| x.as_str()).collect();
        let mut st = self.state.borrow_mut();

        let res: std::result::Result<(), String> = match (s.as_slice(), words.as_slice()) {
            (["handlers", h], ["add_device", name, rest @ ..]) => {
                let outcome = (|| {
                    let handler = st
                        .handlers
                        .get_mut(*h)
                        .ok_or_else(|| "no such handler".to_string())?;
                    if handler.devices.contains_key(*name) {
                        return Err("device already exists".to_string());
                    }
                    let attrs = parse_assigns(rest).map_err(|e| e.to_string())?;
                    handler
                        .devices
                        .insert(name.to_string(), MockDevice { attrs });
                    Ok(())
                })();
                if outcome.is_ok() {
                    auto_map(&mut st, name);
                }
                outcome
            }
            (["handlers", h], ["del_device", name]) => (|| {
                if device_referenced(&st, name) {
                    return Err("device is still assigned".to_string());
                }
                let handler = st
                    .handlers
                    .get_mut(*h)
                    .ok_or_else(|| "no such handler".to_string())?;
                handler
                    .devices
                    .remove(*name)
                    .ok_or_else(|| "no such device".to_string())?;
                // the kernel drops the auto-mapping and group membership
                if let Some(cm) = st
                    .drivers
                    .get_mut("copy_manager")
                    .and_then(|d| d.targets.get_mut("copy_manager_tgt"))
                {
                    cm.luns.retain(|_, lun| lun.device != *name);
                }
                for dg in st.dgs.values_mut() {
                    dg.devices.retain(|d| d != name);
                }
                Ok(())
            })(),
            (["targets", d], ["add_target", name]) => (|| {
                if *d == "copy_manager" {
                    return Err("driver does not support target creation".to_string());
                }
                let driver = st
                    .drivers
                    .get_mut(*d)
                    .ok_or_else(|| "no such driver".to_string())?;
                if driver.targets.contains_key(*name) {
                    return Err("target already exists".to_string());
                }
                driver.targets.insert(
                    name.to_string(),
                    MockTarget {
                        enabled: Some(false),
                        ..Default::default()
                    },
                );
                Ok(())
            })(),
            (["targets", d], ["del_target", name]) => (|| {
                if *d == "copy_manager" {
                    return Err("driver does not support target removal".to_string());
                }
                let driver = st
                    .drivers
                    .get_mut(*d)
                    .ok_or_else(|| "no such driver".to_string())?;
                let target = driver
                    .targets
                    .remove(*name)
                    .ok_or_else(|| "no such target".to_string())?;
                if target.enabled == Some(true) {
                    driver.targets.insert(name.to_string(), target);
                    return Err("target is enabled".to_string());
                }
                for dg in st.dgs.values_mut() {
                    for tg in dg.tgroups.values_mut() {
                        tg.members.remove(*name);
                    }
                }
                Ok(())
            })(),
            (["targets", d, t, "luns"], rest) => {
                let devices: Vec<String> = st
                    .handlers
                    .values()
                    .flat_map(|h| h.devices.keys().cloned())
                    .collect();
                match st
                    .drivers
                    .get_mut(*d)
                    .and_then(|dr| dr.targets.get_mut(*t))
                {
                    None => Err("no such target".to_string()),
                    Some(target) => {
                        lun_cmd(&mut target.luns, |dev| devices.iter().any(|x| x == dev), rest)
                    }
                }
            }
            (["targets", d, t, "ini_groups"], ["create", name]) => (|| {
                let target = st
                    .drivers
                    .get_mut(*d)
                    .and_then(|dr| dr.targets.get_mut(*t))
                    .ok_or_else(|| "no such target".to_string())?;
                if target.groups.contains_key(*name) {
                    return Err("group already exists".to_string());
                }
                target.groups.insert(name.to_string(), MockGroup::default());
                Ok(())
            })(),
            (["targets", d, t, "ini_groups"], ["del", name]) => st
                .drivers
                .get_mut(*d)
                .and_then(|dr| dr.targets.get_mut(*t))
                .ok_or_else(|| "no such target".to_string())
                .and_then(|target| {
                    target
                        .groups
                        .remove(*name)
                        .map(|_| ())
                        .ok_or_else(|| "no such group".to_string())
                }),
            (["targets", d, t, "ini_groups", g, "luns"], rest) => {
                let devices: Vec<String> = st
                    .handlers
                    .values()
                    .flat_map(|h| h.devices.keys().cloned())
                    .collect();
                match st
                    .drivers
                    .get_mut(*d)
                    .and_then(|dr| dr.targets.get_mut(*t))
                    .and_then(|tg| tg.groups.get_mut(*g))
                {
                    None => Err("no such group".to_string()),
                    Some(group) => {
                        lun_cmd(&mut group.luns, |dev| devices.iter().any(|x| x == dev), rest)
                    }
                }
            }
            (["targets", d, t, "ini_groups", g, "initiators"], rest) => {
                match st
                    .drivers
                    .get_mut(*d)
                    .and_then(|dr| dr.targets.get_mut(*t))
                    .and_then(|tg| tg.groups.get_mut(*g))
                {
                    None => Err("no such group".to_string()),
                    Some(group) => match rest {
                        ["add", ini] => {
                            if group.initiators.iter().any(|x| x == ini) {
                                Err("initiator already exists".to_string())
                            } else {
                                group.initiators.push(ini.to_string());
                                Ok(())
                            }
                        }
                        ["del", ini] => {
                            let before = group.initiators.len();
                            group.initiators.retain(|x| x != ini);
                            if group.initiators.len() == before {
                                Err("no such initiator".to_string())
                            } else {
                                Ok(())
                            }
                        }
                        ["clear"] => {
                            group.initiators.clear();
                            Ok(())
                        }
                        _ => Err("unknown command".to_string()),
                    },
                }
            }
            (["device_groups"], ["create", name]) => {
                if st.dgs.contains_key(*name) {
                    Err("device group already exists".to_string())
                } else {
                    st.dgs.insert(name.to_string(), MockDg::default());
                    Ok(())
                }
            }
            (["device_groups"], ["del", name]) => st
                .dgs
                .remove(*name)
                .map(|_| ())
                .ok_or_else(|| "no such device group".to_string()),
            (["device_groups", dg, "devices"], rest) => {
                let devices: Vec<String> = st
                    .handlers
                    .values()
                    .flat_map(|h| h.devices.keys().cloned())
                    .collect();
                match st.dgs.get_mut(*dg) {
                    None => Err("no such device group".to_string()),
                    Some(group) => match rest {
                        ["add", dev] => {
                            if !devices.iter().any(|x| x == dev) {
                                Err(format!("no such device '{}'", dev))
                            } else if group.devices.iter().any(|x| x == dev) {
                                Err("device already in group".to_string())
                            } else {
                                group.devices.push(dev.to_string());
                                Ok(())
                            }
                        }
                        ["del", dev] => {
                            let before = group.devices.len();
                            group.devices.retain(|x| x != dev);
                            if group.devices.len() == before {
                                Err("no such device in group".to_string())
                            } else {
                                Ok(())
                            }
                        }
                        _ => Err("unknown command".to_string()),
                    },
                }
            }
            (["device_groups", dg, "target_groups"], ["create", name]) => {
                match st.dgs.get_mut(*dg) {
                    None => Err("no such device group".to_string()),
                    Some(group) => {
                        if group.tgroups.contains_key(*name) {
                            Err("target group already exists".to_string())
                        } else {
                            group.tgroups.insert(name.to_string(), MockTg::default());
                            Ok(())
                        }
                    }
                }
            }
            (["device_groups", dg, "target_groups"], ["del", name]) => st
                .dgs
                .get_mut(*dg)
                .ok_or_else(|| "no such device group".to_string())
                .and_then(|group| {
                    group
                        .tgroups
                        .remove(*name)
                        .map(|_| ())
                        .ok_or_else(|| "no such target group".to_string())
                }),
            (["device_groups", dg, "target_groups", tg], rest) => {
                match st.dgs.get_mut(*dg).and_then(|g| g.tgroups.get_mut(*tg)) {
                    None => Err("no such target group".to_string()),
                    Some(group) => match rest {
                        ["add", target] => {
                            if group.members.contains_key(*target) {
                                Err("target already in group".to_string())
                            } else {
                                group.members.insert(target.to_string(), AttrMap::new());
                                Ok(())
                            }
                        }
                        ["del", target] => group
                            .members
                            .remove(*target)
                            .map(|_| ())
                            .ok_or_else(|| "no such target in group".to_string()),
                        _ => Err("unknown command".to_string()),
                    },
                }
            }
            _ => Err("unknown command".to_string()),
        };

        match res {
            Ok(()) => Ok(()),
            Err(status) => {
                if verify {
                    Err(mgmt_fail(dir, cmd, &status))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn list_dir(&self, rel: &Path) -> Result<Vec<String>> {
        let c = comps(rel);
        let s: Vec<&str> = c.iter().map(|x| x.as_str()).collect();
        let st = self.state.borrow();

        let mut names: Vec<String> = match s.as_slice() {
            [] => {
                let mut names: Vec<String> = st.root_attrs.keys().cloned().collect();
                names.extend(
                    ["handlers", "targets", "device_groups", "last_sysfs_mgmt_res"]
                        .iter()
                        .map(|x| x.to_string()),
                );
                names
            }
            ["handlers"] => st.handlers.keys().cloned().collect(),
            ["handlers", h] => {
                let handler = st.handlers.get(*h).ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = handler.attrs.keys().cloned().collect();
                names.extend(handler.devices.keys().cloned());
                names.push("mgmt".to_string());
                names
            }
            ["handlers", h, d] => {
                let device = st
                    .handlers
                    .get(*h)
                    .and_then(|h| h.devices.get(*d))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = device.attrs.keys().cloned().collect();
                names.push("handler".to_string());
                names
            }
            ["targets"] => st.drivers.keys().cloned().collect(),
            ["targets", d] => {
                let driver = st.drivers.get(*d).ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = driver.attrs.keys().cloned().collect();
                names.extend(driver.targets.keys().cloned());
                names.push("mgmt".to_string());
                if driver.enabled.is_some() {
                    names.push("enabled".to_string());
                }
                names
            }
            ["targets", d, t] => {
                let target = st
                    .drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = target.attrs.keys().cloned().collect();
                names.extend(["mgmt".to_string(), "luns".to_string(), "ini_groups".to_string()]);
                if target.enabled.is_some() {
                    names.push("enabled".to_string());
                }
                names
            }
            ["targets", d, t, "luns"] => {
                let target = st
                    .drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> =
                    target.luns.keys().map(|id| id.to_string()).collect();
                names.push("mgmt".to_string());
                names
            }
            ["targets", d, t, "luns", n] => {
                let id: u64 = n.parse().map_err(|_| not_found(rel))?;
                let lun = st
                    .drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .and_then(|t| t.luns.get(&id))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = lun.attrs.keys().cloned().collect();
                names.push("device".to_string());
                names
            }
            ["targets", d, t, "ini_groups"] => {
                let target = st
                    .drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = target.groups.keys().cloned().collect();
                names.push("mgmt".to_string());
                names
            }
            ["targets", d, t, "ini_groups", g] => {
                let group = st
                    .drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .and_then(|t| t.groups.get(*g))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = group.attrs.keys().cloned().collect();
                names.extend(["luns".to_string(), "initiators".to_string()]);
                names
            }
            ["targets", d, t, "ini_groups", g, "luns"] => {
                let group = st
                    .drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .and_then(|t| t.groups.get(*g))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> =
                    group.luns.keys().map(|id| id.to_string()).collect();
                names.push("mgmt".to_string());
                names
            }
            ["targets", d, t, "ini_groups", g, "luns", n] => {
                let id: u64 = n.parse().map_err(|_| not_found(rel))?;
                let lun = st
                    .drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .and_then(|t| t.groups.get(*g))
                    .and_then(|g| g.luns.get(&id))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = lun.attrs.keys().cloned().collect();
                names.push("device".to_string());
                names
            }
            ["targets", d, t, "ini_groups", g, "initiators"] => {
                let group = st
                    .drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .and_then(|t| t.groups.get(*g))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = group.initiators.clone();
                names.push("mgmt".to_string());
                names
            }
            ["device_groups"] => {
                let mut names: Vec<String> = st.dgs.keys().cloned().collect();
                names.push("mgmt".to_string());
                names
            }
            ["device_groups", dg] => {
                st.dgs.get(*dg).ok_or_else(|| not_found(rel))?;
                vec!["devices".to_string(), "target_groups".to_string()]
            }
            ["device_groups", dg, "devices"] => {
                let group = st.dgs.get(*dg).ok_or_else(|| not_found(rel))?;
                let mut names = group.devices.clone();
                names.push("mgmt".to_string());
                names
            }
            ["device_groups", dg, "target_groups"] => {
                let group = st.dgs.get(*dg).ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = group.tgroups.keys().cloned().collect();
                names.push("mgmt".to_string());
                names
            }
            ["device_groups", dg, "target_groups", tg] => {
                let group = st
                    .dgs
                    .get(*dg)
                    .and_then(|dg| dg.tgroups.get(*tg))
                    .ok_or_else(|| not_found(rel))?;
                let mut names: Vec<String> = group.attrs.keys().cloned().collect();
                names.extend(group.members.keys().cloned());
                names.push("mgmt".to_string());
                names
            }
            ["device_groups", dg, "target_groups", tg, m] => {
                let member = st
                    .dgs
                    .get(*dg)
                    .and_then(|dg| dg.tgroups.get(*tg))
                    .and_then(|tg| tg.members.get(*m))
                    .ok_or_else(|| not_found(rel))?;
                member.keys().cloned().collect()
            }
            _ => return Err(not_found(rel)),
        };

        names.sort();
        Ok(names)
    }

    fn is_dir(&self, rel: &Path) -> bool {
        let c = comps(rel);
        let s: Vec<&str> = c.iter().map(|x| x.as_str()).collect();
        let st = self.state.borrow();

        match s.as_slice() {
            [] | ["handlers"] | ["targets"] | ["device_groups"] => true,
            ["handlers", h] => st.handlers.contains_key(*h),
            ["handlers", h, d] => st
                .handlers
                .get(*h)
                .map_or(false, |h| h.devices.contains_key(*d)),
            ["handlers", h, d, "handler"] => st
                .handlers
                .get(*h)
                .map_or(false, |h| h.devices.contains_key(*d)),
            ["targets", d] => st.drivers.contains_key(*d),
            ["targets", d, t] => st
                .drivers
                .get(*d)
                .map_or(false, |d| d.targets.contains_key(*t)),
            ["targets", d, t, "luns"] | ["targets", d, t, "ini_groups"] => st
                .drivers
                .get(*d)
                .map_or(false, |d| d.targets.contains_key(*t)),
            ["targets", d, t, "luns", n] => {
                n.parse::<u64>().ok().map_or(false, |id| {
                    st.drivers
                        .get(*d)
                        .and_then(|d| d.targets.get(*t))
                        .map_or(false, |t| t.luns.contains_key(&id))
                })
            }
            ["targets", d, t, "luns", _n, "device"] => st
                .drivers
                .get(*d)
                .map_or(false, |d| d.targets.contains_key(*t)),
            ["targets", d, t, "ini_groups", g] => st
                .drivers
                .get(*d)
                .and_then(|d| d.targets.get(*t))
                .map_or(false, |t| t.groups.contains_key(*g)),
            ["targets", d, t, "ini_groups", g, "luns"]
            | ["targets", d, t, "ini_groups", g, "initiators"] => st
                .drivers
                .get(*d)
                .and_then(|d| d.targets.get(*t))
                .map_or(false, |t| t.groups.contains_key(*g)),
            ["targets", d, t, "ini_groups", g, "luns", n] => {
                n.parse::<u64>().ok().map_or(false, |id| {
                    st.drivers
                        .get(*d)
                        .and_then(|d| d.targets.get(*t))
                        .and_then(|t| t.groups.get(*g))
                        .map_or(false, |g| g.luns.contains_key(&id))
                })
            }
            ["targets", d, t, "ini_groups", g, "luns", _n, "device"] => st
                .drivers
                .get(*d)
                .and_then(|d| d.targets.get(*t))
                .map_or(false, |t| t.groups.contains_key(*g)),
            ["device_groups", dg] => st.dgs.contains_key(*dg),
            ["device_groups", dg, "devices"] | ["device_groups", dg, "target_groups"] => {
                st.dgs.contains_key(*dg)
            }
            ["device_groups", dg, "devices", m] => st
                .dgs
                .get(*dg)
                .map_or(false, |dg| dg.devices.iter().any(|x| x == m)),
            ["device_groups", dg, "target_groups", tg] => st
                .dgs
                .get(*dg)
                .map_or(false, |dg| dg.tgroups.contains_key(*tg)),
            ["device_groups", dg, "target_groups", tg, m] => st
                .dgs
                .get(*dg)
                .and_then(|dg| dg.tgroups.get(*tg))
                .map_or(false, |tg| tg.members.contains_key(*m)),
            _ => false,
        }
    }

    fn exists(&self, rel: &Path) -> bool {
        if self.is_dir(rel) {
            return true;
        }
        self.read_attr(rel).is_ok()
    }

    fn link_name(&self, rel: &Path) -> Result<String> {
        let c = comps(rel);
        let s: Vec<&str> = c.iter().map(|x| x.as_str()).collect();
        let st = self.state.borrow();

        match s.as_slice() {
            ["handlers", h, d, "handler"] => {
                st.handlers
                    .get(*h)
                    .and_then(|handler| handler.devices.get(*d))
                    .ok_or_else(|| not_found(rel))?;
                Ok(h.to_string())
            }
            ["targets", d, t, "luns", n, "device"] => {
                let id: u64 = n.parse().map_err(|_| not_found(rel))?;
                st.drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .and_then(|t| t.luns.get(&id))
                    .map(|l| l.device.clone())
                    .ok_or_else(|| not_found(rel))
            }
            ["targets", d, t, "ini_groups", g, "luns", n, "device"] => {
                let id: u64 = n.parse().map_err(|_| not_found(rel))?;
                st.drivers
                    .get(*d)
                    .and_then(|d| d.targets.get(*t))
                    .and_then(|t| t.groups.get(*g))
                    .and_then(|g| g.luns.get(&id))
                    .map(|l| l.device.clone())
                    .ok_or_else(|| not_found(rel))
            }
            _ => Err(not_found(rel)),
        }
    }
}
