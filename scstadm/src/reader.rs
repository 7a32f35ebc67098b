use std::path::Path;

use anyhow::Result;
use regex::Regex;

use crate::model::{
    Attrs, Device, DeviceGroup, Driver, Handler, IniGroup, Lun, ScstConfig, Target, TargetGroup,
    TgtRef,
};
use crate::sysfs::{
    ControlIo, DIR_DEVICE_GROUPS, DIR_DG_DEVICES, DIR_DRIVERS, DIR_HANDLERS, DIR_INITIATORS,
    DIR_INI_GROUPS, DIR_LUNS, DIR_TARGET_GROUPS, FILE_ENABLED, FILE_MGMT, FILE_MGMT_RES,
    FILE_SUSPEND,
};

const ROOT_SKIP: &[&str] = &[FILE_MGMT, FILE_MGMT_RES, FILE_SUSPEND, "version", "trace_level"];
const HANDLER_SKIP: &[&str] = &[FILE_MGMT, "type", "trace_level"];
const DRIVER_SKIP: &[&str] = &[FILE_MGMT, FILE_ENABLED, "version", "open_state", "trace_level"];
const TARGET_SKIP: &[&str] = &[FILE_MGMT, FILE_ENABLED];
const GENERIC_SKIP: &[&str] = &[FILE_MGMT];

/// Builds the current-state model from the control filesystem.
///
/// Only attributes the subsystem tags as explicitly set enter the model,
/// so the later difference against a declared configuration never touches
/// values still at their defaults. Entries that vanish while the tree is
/// being walked are skipped; the next run reconciles whatever remains.
pub fn read_state(io: &dyn ControlIo) -> Result<ScstConfig> {
    let mut cfg = ScstConfig {
        attributes: read_attrs(io, Path::new(""), ROOT_SKIP),
        ..Default::default()
    };

    // traverse handler directory
    let handlers = Path::new(DIR_HANDLERS);
    if io.exists(handlers) {
        for name in io.list_dir(handlers)? {
            let root = handlers.join(&name);
            if !io.is_dir(&root) {
                continue;
            }
            if let Some(handler) = read_handler(io, &root, &name) {
                cfg.handlers.insert(name, handler);
            }
        }
    }

    // traverse driver directory
    let drivers = Path::new(DIR_DRIVERS);
    if io.exists(drivers) {
        for name in io.list_dir(drivers)? {
            let root = drivers.join(&name);
            if !io.is_dir(&root) {
                continue;
            }
            if let Some(driver) = read_driver(io, &root, &name) {
                cfg.drivers.insert(name, driver);
            }
        }
    }

    // traverse device group directory
    let groups = Path::new(DIR_DEVICE_GROUPS);
    if io.exists(groups) {
        for name in io.list_dir(groups)? {
            let root = groups.join(&name);
            if !io.is_dir(&root) {
                continue;
            }
            if let Some(dg) = read_device_group(io, &root, &name) {
                cfg.device_groups.insert(name, dg);
            }
        }
    }

    Ok(cfg)
}

/// Explicitly-set attribute files directly under `root`.
fn read_attrs(io: &dyn ControlIo, root: &Path, skip: &[&str]) -> Attrs {
    let mut attrs = Attrs::new();
    let entries = match io.list_dir(root) {
        Ok(entries) => entries,
        Err(_) => return attrs,
    };

    for name in entries {
        if skip.contains(&name.as_str()) {
            continue;
        }
        let path = root.join(&name);
        if io.is_dir(&path) {
            continue;
        }
        if let Ok(attr) = io.read_attr(&path) {
            if attr.is_key {
                attrs.insert(name.as_str(), attr.value.as_str());
            }
        }
    }

    attrs
}

fn read_enabled(io: &dyn ControlIo, root: &Path) -> Option<bool> {
    let path = root.join(FILE_ENABLED);
    if !io.exists(&path) {
        return None;
    }
    io.read_attr(&path).ok().map(|a| a.value.trim() == "1")
}

fn read_handler(io: &dyn ControlIo, root: &Path, name: &str) -> Option<Handler> {
    let mut handler = Handler {
        name: name.to_string(),
        attributes: read_attrs(io, root, HANDLER_SKIP),
        ..Default::default()
    };

    for entry in io.list_dir(root).ok()? {
        let dev_root = root.join(&entry);
        if !io.is_dir(&dev_root) {
            continue;
        }
        handler.devices.insert(
            entry.clone(),
            Device {
                name: entry,
                handler: name.to_string(),
                attributes: read_attrs(io, &dev_root, GENERIC_SKIP),
            },
        );
    }

    Some(handler)
}

fn read_driver(io: &dyn ControlIo, root: &Path, name: &str) -> Option<Driver> {
    let mut driver = Driver {
        name: name.to_string(),
        enabled: read_enabled(io, root),
        attributes: read_attrs(io, root, DRIVER_SKIP),
        ..Default::default()
    };

    for entry in io.list_dir(root).ok()? {
        let tgt_root = root.join(&entry);
        if !io.is_dir(&tgt_root) {
            continue;
        }
        if let Some(target) = read_target(io, &tgt_root, &entry) {
            driver.targets.insert(entry, target);
        }
    }

    Some(driver)
}

fn read_target(io: &dyn ControlIo, root: &Path, name: &str) -> Option<Target> {
    let mut target = Target {
        name: name.to_string(),
        enabled: read_enabled(io, root),
        attributes: read_attrs(io, root, TARGET_SKIP),
        ..Default::default()
    };

    target.luns = read_luns(io, &root.join(DIR_LUNS));

    let groups_root = root.join(DIR_INI_GROUPS);
    if io.exists(&groups_root) {
        for entry in io.list_dir(&groups_root).ok()? {
            let grp_root = groups_root.join(&entry);
            if !io.is_dir(&grp_root) {
                continue;
            }
            if let Some(group) = read_ini_group(io, &grp_root, &entry) {
                target.ini_groups.insert(entry, group);
            }
        }
    }

    Some(target)
}

fn read_luns(io: &dyn ControlIo, root: &Path) -> std::collections::BTreeMap<u64, Lun> {
    let mut luns = std::collections::BTreeMap::new();
    if !io.exists(root) {
        return luns;
    }
    let entries = match io.list_dir(root) {
        Ok(entries) => entries,
        Err(_) => return luns,
    };

    let numeric = Regex::new(r"^\d+$").expect("static pattern");
    for entry in entries {
        let lun_root = root.join(&entry);
        if !io.is_dir(&lun_root) || !numeric.is_match(&entry) {
            continue;
        }
        let id = match entry.parse::<u64>() {
            Ok(id) => id,
            Err(_) => continue,
        };
        let device = match io.link_name(&lun_root.join("device")) {
            Ok(device) => device,
            Err(_) => continue,
        };
        luns.insert(
            id,
            Lun {
                id,
                device,
                attributes: read_attrs(io, &lun_root, GENERIC_SKIP),
            },
        );
    }

    luns
}

fn read_ini_group(io: &dyn ControlIo, root: &Path, name: &str) -> Option<IniGroup> {
    let mut group = IniGroup {
        name: name.to_string(),
        attributes: read_attrs(io, root, GENERIC_SKIP),
        luns: read_luns(io, &root.join(DIR_LUNS)),
        ..Default::default()
    };

    let inis_root = root.join(DIR_INITIATORS);
    if io.exists(&inis_root) {
        for entry in io.list_dir(&inis_root).ok()? {
            if entry == FILE_MGMT || io.is_dir(&inis_root.join(&entry)) {
                continue;
            }
            group.initiators.push(entry);
        }
    }

    Some(group)
}

fn read_device_group(io: &dyn ControlIo, root: &Path, name: &str) -> Option<DeviceGroup> {
    let mut dg = DeviceGroup {
        name: name.to_string(),
        ..Default::default()
    };

    let devices_root = root.join(DIR_DG_DEVICES);
    if io.exists(&devices_root) {
        for entry in io.list_dir(&devices_root).ok()? {
            if entry == FILE_MGMT {
                continue;
            }
            dg.devices.push(entry);
        }
    }

    let tgs_root = root.join(DIR_TARGET_GROUPS);
    if io.exists(&tgs_root) {
        for entry in io.list_dir(&tgs_root).ok()? {
            let tg_root = tgs_root.join(&entry);
            if !io.is_dir(&tg_root) {
                continue;
            }
            let mut tg = TargetGroup {
                name: entry.clone(),
                attributes: read_attrs(io, &tg_root, GENERIC_SKIP),
                ..Default::default()
            };
            for member in io.list_dir(&tg_root).ok()? {
                let member_root = tg_root.join(&member);
                if !io.is_dir(&member_root) {
                    continue;
                }
                tg.targets.insert(
                    member.clone(),
                    TgtRef {
                        name: member,
                        attributes: read_attrs(io, &member_root, GENERIC_SKIP),
                    },
                );
            }
            dg.target_groups.insert(entry, tg);
        }
    }

    Some(dg)
}
