use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ScstError;

/// Ordered attribute bag, string keys to string values.
///
/// ```no_run
/// use scstadm::Attrs;
///
/// let mut attrs = Attrs::new();
/// assert_eq!(attrs.pack(), None);
///
/// attrs.insert("filename", "/dev/zvol/tank/vol");
/// assert_eq!(attrs.pack(), Some("filename=/dev/zvol/tank/vol".to_string()));
/// ```
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Attrs {
    inner: BTreeMap<String, String>,
}

impl Attrs {
    pub fn new() -> Self {
        Attrs {
            inner: BTreeMap::new(),
        }
    }

    pub fn insert<S: AsRef<str>>(&mut self, k: S, v: S) -> &mut Self {
        self.inner
            .insert(k.as_ref().to_string(), v.as_ref().to_string());
        self
    }

    pub fn get(&self, k: &str) -> Option<&str> {
        self.inner.get(k).map(|v| v.as_str())
    }

    pub fn remove(&mut self, k: &str) -> Option<String> {
        self.inner.remove(k)
    }

    pub fn contains(&self, k: &str) -> bool {
        self.inner.contains_key(k)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// packs the bag into the `k=v k=v` form management commands take.
    /// Returns `None` when the bag is empty.
    pub fn pack(&self) -> Option<String> {
        if self.inner.is_empty() {
            return None;
        }

        let slice = self
            .inner
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<String>>();

        Some(slice.join(" "))
    }

    /// keys of `self` whose value differs from (or is missing in) `other`.
    pub fn diff(&self, other: &Attrs) -> Vec<(String, String)> {
        self.inner
            .iter()
            .filter(|(k, v)| other.get(k) != Some(v.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Attrs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attrs::new();
        for (k, v) in iter {
            attrs.insert(k.as_ref(), v.as_ref());
        }
        attrs
    }
}

/// The creation-time attribute a handler requires in its `add_device`
/// command, if any.
pub fn primary_attr_for(handler: &str) -> Option<&'static str> {
    match handler {
        "vdisk_nullio" => None,
        h if h.starts_with("vdisk_") || h == "vcdrom" => Some("filename"),
        h if h.starts_with("dev_") => Some("t10_dev_id"),
        _ => None,
    }
}

/// One description of the whole subsystem, used both for the declared
/// configuration and for the state read back from the control filesystem.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ScstConfig {
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub(crate) attributes: Attrs,
    #[serde(default)]
    pub(crate) handlers: BTreeMap<String, Handler>,
    #[serde(default)]
    pub(crate) drivers: BTreeMap<String, Driver>,
    #[serde(default)]
    pub(crate) device_groups: BTreeMap<String, DeviceGroup>,
}

impl ScstConfig {
    pub fn attributes(&self) -> &Attrs {
        &self.attributes
    }

    pub fn handlers(&self) -> Vec<&Handler> {
        self.handlers.values().collect()
    }

    pub fn get_handler<S: AsRef<str>>(&self, name: S) -> Result<&Handler> {
        self.handlers
            .get(name.as_ref())
            .context(ScstError::NoHandler(name.as_ref().to_string()))
    }

    pub fn drivers(&self) -> Vec<&Driver> {
        self.drivers.values().collect()
    }

    pub fn get_driver<S: AsRef<str>>(&self, name: S) -> Result<&Driver> {
        self.drivers
            .get(name.as_ref())
            .context(ScstError::NoDriver(name.as_ref().to_string()))
    }

    pub fn device_groups(&self) -> Vec<&DeviceGroup> {
        self.device_groups.values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
            && self.handlers.is_empty()
            && self.drivers.is_empty()
            && self.device_groups.is_empty()
    }

    /// Names of every declared device, across all handlers.
    pub fn device_names(&self) -> BTreeSet<&str> {
        self.handlers
            .values()
            .flat_map(|h| h.devices.keys())
            .map(|s| s.as_str())
            .collect()
    }

    /// Looks a target up by name across all drivers.
    pub fn find_target(&self, name: &str) -> Option<(&str, &Target)> {
        self.drivers.values().find_map(|d| {
            d.targets
                .get(name)
                .map(|t| (d.name.as_str(), t))
        })
    }

    /// Checks the cross-reference rules a well-formed configuration obeys:
    /// every LUN maps a declared device, every target-group target names an
    /// existing driver/target pair, and no device sits in two device groups.
    /// LUN uniqueness per scope is structural (LUNs are keyed by number).
    pub fn validate(&self) -> Result<()> {
        let declared = self.device_names();

        for driver in self.drivers.values() {
            for target in driver.targets.values() {
                let scope = format!("{}/{}", driver.name, target.name);
                for lun in target.luns.values() {
                    if !declared.contains(lun.device.as_str()) {
                        anyhow::bail!(ScstError::LunNoDevice {
                            scope,
                            lun: lun.id,
                            device: lun.device.clone(),
                        })
                    }
                }
                for group in target.ini_groups.values() {
                    let scope = format!("{}/{}", scope, group.name);
                    for lun in group.luns.values() {
                        if !declared.contains(lun.device.as_str()) {
                            anyhow::bail!(ScstError::LunNoDevice {
                                scope,
                                lun: lun.id,
                                device: lun.device.clone(),
                            })
                        }
                    }
                }
            }
        }

        let mut grouped: BTreeMap<&str, &str> = BTreeMap::new();
        for dg in self.device_groups.values() {
            for device in &dg.devices {
                if let Some(first) = grouped.insert(device.as_str(), dg.name.as_str()) {
                    anyhow::bail!(ScstError::DeviceGroupConflict {
                        device: device.clone(),
                        first: first.to_string(),
                        second: dg.name.clone(),
                    })
                }
            }
            for tg in dg.target_groups.values() {
                for tgt in tg.targets.keys() {
                    if self.find_target(tgt).is_none() {
                        anyhow::bail!(ScstError::GroupNoTarget {
                            group: format!("{}/{}", dg.name, tg.name),
                            target: tgt.clone(),
                        })
                    }
                }
            }
        }

        Ok(())
    }

    /// encodes the model to a YAML string.
    pub fn to_yml(&self) -> Result<String> {
        let s = serde_yml::to_string(self)?;
        Ok(s)
    }

    /// echoes the model YAML string to the file.
    pub fn write_yml<S: AsRef<std::path::Path>>(&self, filename: S) -> Result<()> {
        let yml = self.to_yml()?;
        std::fs::write(filename, yml)?;

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Handler {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub(crate) attributes: Attrs,
    #[serde(default)]
    pub(crate) devices: BTreeMap<String, Device>,
}

impl Handler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &Attrs {
        &self.attributes
    }

    pub fn devices(&self) -> Vec<&Device> {
        self.devices.values().collect()
    }

    pub fn get_device<S: AsRef<str>>(&self, name: S) -> Result<&Device> {
        self.devices
            .get(name.as_ref())
            .context(ScstError::NoDevice(name.as_ref().to_string()))
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Device {
    pub(crate) name: String,
    pub(crate) handler: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub(crate) attributes: Attrs,
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn attributes(&self) -> &Attrs {
        &self.attributes
    }

    /// The creation-time attribute pair for this device, e.g.
    /// `filename=/dev/zvol/tank/vol` for a vdisk kind.
    pub fn primary_attr(&self) -> Option<(&'static str, &str)> {
        let key = primary_attr_for(&self.handler)?;
        self.attributes.get(key).map(|v| (key, v))
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Driver {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub(crate) attributes: Attrs,
    #[serde(default)]
    pub(crate) targets: BTreeMap<String, Target>,
}

impl Driver {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    pub fn attributes(&self) -> &Attrs {
        &self.attributes
    }

    pub fn targets(&self) -> Vec<&Target> {
        self.targets.values().collect()
    }

    pub fn get_target<S: AsRef<str>>(&self, name: S) -> Result<&Target> {
        self.targets
            .get(name.as_ref())
            .context(ScstError::NoTarget(name.as_ref().to_string()))
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Target {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub(crate) attributes: Attrs,
    #[serde(default)]
    pub(crate) luns: BTreeMap<u64, Lun>,
    #[serde(default)]
    pub(crate) ini_groups: BTreeMap<String, IniGroup>,
}

impl Target {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    pub fn attributes(&self) -> &Attrs {
        &self.attributes
    }

    pub fn luns(&self) -> Vec<&Lun> {
        self.luns.values().collect()
    }

    pub fn get_lun(&self, id: u64) -> Option<&Lun> {
        self.luns.get(&id)
    }

    pub fn ini_groups(&self) -> Vec<&IniGroup> {
        self.ini_groups.values().collect()
    }

    pub fn get_ini_group<S: AsRef<str>>(&self, name: S) -> Result<&IniGroup> {
        self.ini_groups
            .get(name.as_ref())
            .context(ScstError::NoGroup(name.as_ref().to_string()))
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Lun {
    pub(crate) id: u64,
    pub(crate) device: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub(crate) attributes: Attrs,
}

impl Lun {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn attributes(&self) -> &Attrs {
        &self.attributes
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct IniGroup {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub(crate) attributes: Attrs,
    #[serde(default)]
    pub(crate) luns: BTreeMap<u64, Lun>,
    #[serde(default)]
    pub(crate) initiators: Vec<String>,
}

impl IniGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn luns(&self) -> Vec<&Lun> {
        self.luns.values().collect()
    }

    pub fn initiators(&self) -> &[String] {
        &self.initiators
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct DeviceGroup {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) devices: Vec<String>,
    #[serde(default)]
    pub(crate) target_groups: BTreeMap<String, TargetGroup>,
}

impl DeviceGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn target_groups(&self) -> Vec<&TargetGroup> {
        self.target_groups.values().collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct TargetGroup {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub(crate) attributes: Attrs,
    #[serde(default)]
    pub(crate) targets: BTreeMap<String, TgtRef>,
}

impl TargetGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &Attrs {
        &self.attributes
    }

    pub fn targets(&self) -> Vec<&TgtRef> {
        self.targets.values().collect()
    }
}

/// A target membership inside a target group, with its per-member
/// attributes (`rel_tgt_id`, `preferred`).
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct TgtRef {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub(crate) attributes: Attrs,
}

impl TgtRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &Attrs {
        &self.attributes
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg_with_device(handler: &str, device: &str) -> ScstConfig {
        let mut cfg = ScstConfig::default();
        let mut h = Handler {
            name: handler.to_string(),
            ..Default::default()
        };
        h.devices.insert(
            device.to_string(),
            Device {
                name: device.to_string(),
                handler: handler.to_string(),
                ..Default::default()
            },
        );
        cfg.handlers.insert(handler.to_string(), h);
        cfg
    }

    #[test]
    fn test_pack() {
        let mut attrs = Attrs::new();
        assert_eq!(attrs.pack(), None);

        attrs.insert("filename", "/v/d1.img");
        attrs.insert("blocksize", "4096");
        assert_eq!(
            attrs.pack(),
            Some("blocksize=4096 filename=/v/d1.img".to_string())
        );
    }

    #[test]
    fn test_attrs_diff() {
        let a: Attrs = [("x", "1"), ("y", "2")].into_iter().collect();
        let b: Attrs = [("x", "1"), ("y", "3"), ("z", "4")].into_iter().collect();

        assert_eq!(a.diff(&b), vec![("y".to_string(), "2".to_string())]);
        assert_eq!(
            b.diff(&a),
            vec![
                ("y".to_string(), "3".to_string()),
                ("z".to_string(), "4".to_string())
            ]
        );
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn test_primary_attr_for() {
        assert_eq!(primary_attr_for("vdisk_fileio"), Some("filename"));
        assert_eq!(primary_attr_for("vdisk_blockio"), Some("filename"));
        assert_eq!(primary_attr_for("vdisk_nullio"), None);
        assert_eq!(primary_attr_for("dev_disk"), Some("t10_dev_id"));
        assert_eq!(primary_attr_for("scst_user"), None);
    }

    #[test]
    fn test_validate_lun_device() {
        let mut cfg = cfg_with_device("vdisk_fileio", "d1");
        let mut tgt = Target {
            name: "iqn.x:t1".to_string(),
            ..Default::default()
        };
        tgt.luns.insert(
            0,
            Lun {
                id: 0,
                device: "d1".to_string(),
                ..Default::default()
            },
        );
        let mut drv = Driver {
            name: "iscsi".to_string(),
            ..Default::default()
        };
        drv.targets.insert(tgt.name.clone(), tgt);
        cfg.drivers.insert(drv.name.clone(), drv);

        assert!(cfg.validate().is_ok());

        cfg.drivers
            .get_mut("iscsi")
            .unwrap()
            .targets
            .get_mut("iqn.x:t1")
            .unwrap()
            .luns
            .insert(
                1,
                Lun {
                    id: 1,
                    device: "missing".to_string(),
                    ..Default::default()
                },
            );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_device_group_conflict() {
        let mut cfg = cfg_with_device("vdisk_fileio", "d1");
        for name in ["dg1", "dg2"] {
            cfg.device_groups.insert(
                name.to_string(),
                DeviceGroup {
                    name: name.to_string(),
                    devices: vec!["d1".to_string()],
                    ..Default::default()
                },
            );
        }
        assert!(cfg.validate().is_err());

        cfg.device_groups.remove("dg2");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_target_group_ref() {
        let mut cfg = cfg_with_device("vdisk_fileio", "d1");
        let mut tg = TargetGroup {
            name: "controller_A".to_string(),
            ..Default::default()
        };
        tg.targets.insert(
            "iqn.x:t1".to_string(),
            TgtRef {
                name: "iqn.x:t1".to_string(),
                ..Default::default()
            },
        );
        let mut dg = DeviceGroup {
            name: "dg1".to_string(),
            devices: vec!["d1".to_string()],
            ..Default::default()
        };
        dg.target_groups.insert(tg.name.clone(), tg);
        cfg.device_groups.insert(dg.name.clone(), dg);

        // no driver declares iqn.x:t1 yet
        assert!(cfg.validate().is_err());

        let mut drv = Driver {
            name: "iscsi".to_string(),
            ..Default::default()
        };
        drv.targets.insert(
            "iqn.x:t1".to_string(),
            Target {
                name: "iqn.x:t1".to_string(),
                ..Default::default()
            },
        );
        cfg.drivers.insert(drv.name.clone(), drv);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_to_yml_round_trip() -> Result<()> {
        let cfg = cfg_with_device("vdisk_blockio", "vol");
        let yml = cfg.to_yml()?;
        let back: ScstConfig = serde_yml::from_str(&yml)?;
        assert_eq!(back, cfg);
        Ok(())
    }
}
