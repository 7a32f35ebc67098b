use std::collections::{BTreeMap, BTreeSet};

use crate::model::ScstConfig;

/// Built-in driver that auto-maps every created device for copy offload.
pub const COPY_MANAGER: &str = "copy_manager";
/// The single built-in target under the copy-manager driver.
pub const COPY_MANAGER_TGT: &str = "copy_manager_tgt";

pub fn is_copy_manager(driver: &str) -> bool {
    driver == COPY_MANAGER
}

/// What the copy-manager LUN set is pruned against after device creation.
///
/// A configuration that names the copy-manager target pins the mapping
/// exactly (LUN number and device). One that stays silent keeps the
/// auto-created mapping for every declared device, so only LUNs of
/// undeclared devices are removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrunePolicy {
    Pinned(BTreeMap<u64, String>),
    DeclaredDevices(BTreeSet<String>),
}

impl PrunePolicy {
    pub fn for_config(desired: &ScstConfig) -> Self {
        let declared = desired
            .drivers
            .get(COPY_MANAGER)
            .and_then(|d| d.targets.get(COPY_MANAGER_TGT));

        match declared {
            Some(tgt) => PrunePolicy::Pinned(
                tgt.luns
                    .values()
                    .map(|l| (l.id(), l.device().to_string()))
                    .collect(),
            ),
            None => PrunePolicy::DeclaredDevices(
                desired
                    .device_names()
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        }
    }

    /// Whether the live LUN survives pruning.
    pub fn retains(&self, id: u64, device: &str) -> bool {
        match self {
            PrunePolicy::Pinned(luns) => luns.get(&id).map_or(false, |d| d == device),
            PrunePolicy::DeclaredDevices(devices) => devices.contains(device),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Device, Driver, Handler, Lun, Target};

    #[test]
    fn test_silent_config_retains_declared_devices() {
        let mut cfg = ScstConfig::default();
        let mut h = Handler {
            name: "vdisk_fileio".to_string(),
            ..Default::default()
        };
        for name in ["d1", "d2"] {
            h.devices.insert(
                name.to_string(),
                Device {
                    name: name.to_string(),
                    handler: h.name.clone(),
                    ..Default::default()
                },
            );
        }
        cfg.handlers.insert(h.name.clone(), h);

        let policy = PrunePolicy::for_config(&cfg);
        assert!(policy.retains(0, "d1"));
        assert!(policy.retains(7, "d2"));
        assert!(!policy.retains(1, "stale"));
    }

    #[test]
    fn test_declared_target_pins_numbers_and_devices() {
        let mut cfg = ScstConfig::default();
        let mut tgt = Target {
            name: COPY_MANAGER_TGT.to_string(),
            ..Default::default()
        };
        tgt.luns.insert(
            3,
            Lun {
                id: 3,
                device: "d1".to_string(),
                ..Default::default()
            },
        );
        let mut drv = Driver {
            name: COPY_MANAGER.to_string(),
            ..Default::default()
        };
        drv.targets.insert(tgt.name.clone(), tgt);
        cfg.drivers.insert(drv.name.clone(), drv);

        let policy = PrunePolicy::for_config(&cfg);
        assert!(policy.retains(3, "d1"));
        assert!(!policy.retains(3, "d2"));
        assert!(!policy.retains(0, "d1"));
    }
}
