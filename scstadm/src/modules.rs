use std::collections::BTreeSet;
use std::process::Command;

use anyhow::Result;
use tracing::{debug, warn};

use crate::model::ScstConfig;
use crate::ScstError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: String,
    pub optional: bool,
}

pub fn handler_module(handler: &str) -> Option<&'static str> {
    match handler {
        "vdisk_fileio" | "vdisk_blockio" | "vdisk_nullio" | "vcdrom" => Some("scst_vdisk"),
        "dev_disk" | "dev_disk_perf" => Some("scst_disk"),
        "dev_tape" | "dev_tape_perf" => Some("scst_tape"),
        "dev_cdrom" => Some("scst_cdrom"),
        "dev_changer" => Some("scst_changer"),
        "dev_modisk" | "dev_modisk_perf" => Some("scst_modisk"),
        "dev_processor" => Some("scst_processor"),
        "dev_raid" => Some("scst_raid"),
        "scst_user" => Some("scst_user"),
        _ => None,
    }
}

pub fn driver_module(driver: &str) -> Option<&'static str> {
    match driver {
        "iscsi" => Some("iscsi_scst"),
        "qla2x00t" => Some("qla2x00tgt"),
        "ib_srpt" => Some("ib_srpt"),
        "fcst" => Some("fcst"),
        "scst_local" => Some("scst_local"),
        // built into the core, no module of its own
        "copy_manager" => None,
        _ => None,
    }
}

/// Kernel modules a configuration needs: the core module, one per handler
/// and driver kind in use, and the CRC acceleration module on x86-family
/// hosts (best effort).
pub fn required_modules(cfg: &ScstConfig) -> Vec<ModuleSpec> {
    let mut names: Vec<&str> = vec!["scst"];
    let mut seen: BTreeSet<&str> = names.iter().copied().collect();

    for handler in cfg.handlers().iter() {
        if let Some(module) = handler_module(handler.name()) {
            if seen.insert(module) {
                names.push(module);
            }
        }
    }
    for driver in cfg.drivers().iter() {
        if let Some(module) = driver_module(driver.name()) {
            if seen.insert(module) {
                names.push(module);
            }
        }
    }

    let mut specs: Vec<ModuleSpec> = names
        .into_iter()
        .map(|name| ModuleSpec {
            name: name.to_string(),
            optional: false,
        })
        .collect();

    if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        specs.push(ModuleSpec {
            name: "crc32c-intel".to_string(),
            optional: true,
        });
    }

    specs
}

pub trait ModuleLoader {
    fn load(&self, name: &str, optional: bool) -> Result<()>;
}

/// Loads modules through the system `modprobe`.
pub struct Modprobe;

impl ModuleLoader for Modprobe {
    fn load(&self, name: &str, _optional: bool) -> Result<()> {
        debug!("modprobe {}", name);
        let status = Command::new("modprobe")
            .arg(name)
            .status()
            .map_err(ScstError::Io)?;
        if !status.success() {
            anyhow::bail!(ScstError::ModuleLoadFail(name.to_string()))
        }

        Ok(())
    }
}

/// Loads every module the configuration requires. A failing optional
/// module is logged and skipped; a failing required module aborts.
pub fn load_required(loader: &dyn ModuleLoader, cfg: &ScstConfig) -> Result<()> {
    for spec in required_modules(cfg) {
        match loader.load(&spec.name, spec.optional) {
            Ok(()) => {}
            Err(e) if spec.optional => {
                warn!("optional module '{}' not loaded: {}", spec.name, e)
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use super::*;
    use crate::conf::parse_str;

    struct FakeLoader {
        loaded: RefCell<Vec<String>>,
        fail: Option<&'static str>,
    }

    impl FakeLoader {
        fn new(fail: Option<&'static str>) -> Self {
            FakeLoader {
                loaded: RefCell::new(Vec::new()),
                fail,
            }
        }
    }

    impl ModuleLoader for FakeLoader {
        fn load(&self, name: &str, _optional: bool) -> Result<()> {
            if self.fail == Some(name) {
                anyhow::bail!(ScstError::ModuleLoadFail(name.to_string()))
            }
            self.loaded.borrow_mut().push(name.to_string());
            Ok(())
        }
    }

    fn sample() -> ScstConfig {
        parse_str(
            "HANDLER vdisk_fileio { DEVICE d1 { filename /x } }\n\
             HANDLER vdisk_blockio { DEVICE d2 { filename /dev/sdb } }\n\
             TARGET_DRIVER iscsi { }\n\
             TARGET_DRIVER copy_manager { }",
            "inline",
        )
        .unwrap()
    }

    #[test]
    fn test_required_modules_deduped() {
        let specs = required_modules(&sample());
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(names.iter().filter(|n| **n == "scst_vdisk").count(), 1);
        assert!(names.contains(&"scst"));
        assert!(names.contains(&"iscsi_scst"));
        assert!(!names.contains(&"copy_manager"));
    }

    #[test]
    fn test_load_required_aborts_on_required_failure() {
        let loader = FakeLoader::new(Some("iscsi_scst"));
        assert!(load_required(&loader, &sample()).is_err());
    }

    #[test]
    fn test_load_required_skips_optional_failure() {
        let loader = FakeLoader::new(Some("crc32c-intel"));
        assert!(load_required(&loader, &sample()).is_ok());
        assert!(loader
            .loaded
            .borrow()
            .iter()
            .any(|m| m == "iscsi_scst"));
    }
}
