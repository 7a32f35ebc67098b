use std::collections::{BTreeMap, BTreeSet};

use crate::copy_manager::is_copy_manager;
use crate::model::{Lun, ScstConfig};

/// Membership difference between two name sets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SetDelta {
    pub add: Vec<String>,
    pub del: Vec<String>,
}

pub fn diff_names<'a, I, J>(desired: I, current: J) -> SetDelta
where
    I: IntoIterator<Item = &'a str>,
    J: IntoIterator<Item = &'a str>,
{
    let want: BTreeSet<&str> = desired.into_iter().collect();
    let have: BTreeSet<&str> = current.into_iter().collect();

    SetDelta {
        add: want.difference(&have).map(|s| s.to_string()).collect(),
        del: have.difference(&want).map(|s| s.to_string()).collect(),
    }
}

/// LUN set difference, keyed by LUN number. A number bound to a different
/// device becomes a `replace`; the same binding with differing attributes
/// becomes an attribute update.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LunDelta {
    pub add: Vec<u64>,
    pub del: Vec<u64>,
    pub replace: Vec<u64>,
    pub update: Vec<(u64, Vec<(String, String)>)>,
}

pub fn diff_luns(desired: &BTreeMap<u64, Lun>, current: &BTreeMap<u64, Lun>) -> LunDelta {
    let mut delta = LunDelta::default();

    for (id, want) in desired {
        match current.get(id) {
            None => delta.add.push(*id),
            Some(have) if have.device != want.device => delta.replace.push(*id),
            Some(have) => {
                let attrs = want.attributes.diff(&have.attributes);
                if !attrs.is_empty() {
                    delta.update.push((*id, attrs));
                }
            }
        }
    }

    for id in current.keys() {
        if !desired.contains_key(id) {
            delta.del.push(*id);
        }
    }

    delta
}

/// Device difference across all handlers. A device declared under a
/// different handler than it currently lives under becomes a removal from
/// the old handler plus an addition to the new one.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeviceDelta {
    pub add: Vec<(String, String)>,
    pub del: Vec<(String, String)>,
    pub update: Vec<((String, String), Vec<(String, String)>)>,
}

pub fn diff_devices(desired: &ScstConfig, current: &ScstConfig) -> DeviceDelta {
    let mut delta = DeviceDelta::default();

    let mut have: BTreeMap<&str, (&str, &crate::model::Device)> = BTreeMap::new();
    for handler in current.handlers.values() {
        for device in handler.devices.values() {
            have.insert(&device.name, (&handler.name, device));
        }
    }

    let mut want_names: BTreeSet<&str> = BTreeSet::new();
    for handler in desired.handlers.values() {
        for device in handler.devices.values() {
            want_names.insert(&device.name);
            match have.get(device.name.as_str()) {
                None => delta
                    .add
                    .push((handler.name.clone(), device.name.clone())),
                Some((cur_handler, _)) if *cur_handler != handler.name => {
                    delta
                        .del
                        .push((cur_handler.to_string(), device.name.clone()));
                    delta
                        .add
                        .push((handler.name.clone(), device.name.clone()));
                }
                Some((_, cur)) => {
                    let attrs = device.attributes.diff(&cur.attributes);
                    if !attrs.is_empty() {
                        delta
                            .update
                            .push(((handler.name.clone(), device.name.clone()), attrs));
                    }
                }
            }
        }
    }

    for (name, (handler, _)) in &have {
        if !want_names.contains(name) {
            delta.del.push((handler.to_string(), name.to_string()));
        }
    }

    delta
}

/// Target existence difference across drivers. The built-in copy-manager
/// driver and target never appear in either set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TargetDelta {
    pub add: Vec<(String, String)>,
    pub del: Vec<(String, String)>,
}

pub fn diff_targets(desired: &ScstConfig, current: &ScstConfig) -> TargetDelta {
    let mut delta = TargetDelta::default();

    for driver in desired.drivers.values() {
        if is_copy_manager(&driver.name) {
            continue;
        }
        let have = current.drivers.get(&driver.name);
        for target in driver.targets.values() {
            if have.map_or(true, |d| !d.targets.contains_key(&target.name)) {
                delta.add.push((driver.name.clone(), target.name.clone()));
            }
        }
    }

    for driver in current.drivers.values() {
        if is_copy_manager(&driver.name) {
            continue;
        }
        let want = desired.drivers.get(&driver.name);
        for target in driver.targets.values() {
            if want.map_or(true, |d| !d.targets.contains_key(&target.name)) {
                delta.del.push((driver.name.clone(), target.name.clone()));
            }
        }
    }

    delta
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Attrs, Device, Driver, Handler, Target};

    fn lun(id: u64, device: &str) -> Lun {
        Lun {
            id,
            device: device.to_string(),
            ..Default::default()
        }
    }

    fn lun_set(luns: &[(u64, &str)]) -> BTreeMap<u64, Lun> {
        luns.iter().map(|(id, dev)| (*id, lun(*id, dev))).collect()
    }

    fn cfg(devices: &[(&str, &str)]) -> ScstConfig {
        let mut cfg = ScstConfig::default();
        for (handler, device) in devices {
            let h = cfg
                .handlers
                .entry(handler.to_string())
                .or_insert_with(|| Handler {
                    name: handler.to_string(),
                    ..Default::default()
                });
            h.devices.insert(
                device.to_string(),
                Device {
                    name: device.to_string(),
                    handler: handler.to_string(),
                    ..Default::default()
                },
            );
        }
        cfg
    }

    #[test]
    fn test_diff_names() {
        let delta = diff_names(["a", "b"], ["b", "c"]);
        assert_eq!(delta.add, vec!["a".to_string()]);
        assert_eq!(delta.del, vec!["c".to_string()]);
    }

    #[test]
    fn test_diff_luns_same_number_new_device_is_replace() {
        let delta = diff_luns(&lun_set(&[(0, "d2")]), &lun_set(&[(0, "d1")]));
        assert_eq!(delta.replace, vec![0]);
        assert!(delta.add.is_empty());
        assert!(delta.del.is_empty());
    }

    #[test]
    fn test_diff_luns_add_del_update() {
        let mut want = lun_set(&[(0, "d1"), (2, "d2")]);
        want.get_mut(&0)
            .unwrap()
            .attributes
            .insert("read_only", "1");

        let have = lun_set(&[(0, "d1"), (1, "d1")]);

        let delta = diff_luns(&want, &have);
        assert_eq!(delta.add, vec![2]);
        assert_eq!(delta.del, vec![1]);
        assert_eq!(
            delta.update,
            vec![(0, vec![("read_only".to_string(), "1".to_string())])]
        );
    }

    #[test]
    fn test_diff_devices_handler_change() {
        let delta = diff_devices(
            &cfg(&[("vdisk_blockio", "d1")]),
            &cfg(&[("vdisk_fileio", "d1")]),
        );
        assert_eq!(
            delta.del,
            vec![("vdisk_fileio".to_string(), "d1".to_string())]
        );
        assert_eq!(
            delta.add,
            vec![("vdisk_blockio".to_string(), "d1".to_string())]
        );
        assert!(delta.update.is_empty());
    }

    #[test]
    fn test_diff_devices_attr_update_only_emits_changes() {
        let mut want = cfg(&[("vdisk_fileio", "d1")]);
        let mut have = cfg(&[("vdisk_fileio", "d1")]);
        let attrs: Attrs = [("filename", "/v/d1.img"), ("nv_cache", "1")]
            .into_iter()
            .collect();
        want.handlers
            .get_mut("vdisk_fileio")
            .unwrap()
            .devices
            .get_mut("d1")
            .unwrap()
            .attributes = attrs;
        have.handlers
            .get_mut("vdisk_fileio")
            .unwrap()
            .devices
            .get_mut("d1")
            .unwrap()
            .attributes = [("filename", "/v/d1.img")].into_iter().collect();

        let delta = diff_devices(&want, &have);
        assert_eq!(
            delta.update,
            vec![(
                ("vdisk_fileio".to_string(), "d1".to_string()),
                vec![("nv_cache".to_string(), "1".to_string())]
            )]
        );
    }

    #[test]
    fn test_diff_targets_skips_copy_manager() {
        let mut current = ScstConfig::default();
        let mut cm = Driver {
            name: "copy_manager".to_string(),
            ..Default::default()
        };
        cm.targets.insert(
            "copy_manager_tgt".to_string(),
            Target {
                name: "copy_manager_tgt".to_string(),
                ..Default::default()
            },
        );
        current.drivers.insert(cm.name.clone(), cm);

        let delta = diff_targets(&ScstConfig::default(), &current);
        assert!(delta.del.is_empty());
    }

    #[test]
    fn test_diff_is_deterministic() {
        let want = cfg(&[("vdisk_fileio", "a"), ("vdisk_blockio", "b")]);
        let have = cfg(&[("vdisk_fileio", "b"), ("dev_disk", "c")]);
        assert_eq!(diff_devices(&want, &have), diff_devices(&want, &have));
    }
}
