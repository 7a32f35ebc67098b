use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::ScstError;

static SCST_ROOT_OLD: &str = "/sys/kernel/scst_tgt";
static SCST_ROOT_NEW: &str = "/sys/devices/scst";

pub(crate) const DIR_HANDLERS: &str = "handlers";
pub(crate) const DIR_DRIVERS: &str = "targets";
pub(crate) const DIR_DEVICE_GROUPS: &str = "device_groups";
pub(crate) const DIR_LUNS: &str = "luns";
pub(crate) const DIR_INI_GROUPS: &str = "ini_groups";
pub(crate) const DIR_INITIATORS: &str = "initiators";
pub(crate) const DIR_TARGET_GROUPS: &str = "target_groups";
pub(crate) const DIR_DG_DEVICES: &str = "devices";
pub(crate) const FILE_MGMT: &str = "mgmt";
pub(crate) const FILE_MGMT_RES: &str = "last_sysfs_mgmt_res";
pub(crate) const FILE_SUSPEND: &str = "suspend";
pub(crate) const FILE_ENABLED: &str = "enabled";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// One attribute as read from the control filesystem: the value line and
/// whether the subsystem tagged it as explicitly set (non-default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysAttr {
    pub value: String,
    pub is_key: bool,
}

/// The filesystem operations the reader and the convergence engine issue.
/// All paths are relative to the subsystem root.
pub trait ControlIo {
    fn read_attr(&self, rel: &Path) -> Result<SysAttr>;
    fn write_attr(&self, rel: &Path, value: &str, verify: bool) -> Result<()>;
    fn mgmt(&self, dir: &Path, cmd: &str, verify: bool) -> Result<()>;
    fn list_dir(&self, rel: &Path) -> Result<Vec<String>>;
    fn is_dir(&self, rel: &Path) -> bool;
    fn exists(&self, rel: &Path) -> bool;
    fn link_name(&self, rel: &Path) -> Result<String>;
}

/// Takes the first line as the attribute value and strips the non-default
/// marker, whether it follows on its own line or trails the value. Only
/// one trailing marker is consumed; any further occurrence stays literal.
pub(crate) fn parse_attr(text: &str) -> SysAttr {
    let mut lines = text.lines();
    let mut value = lines.next().unwrap_or("").to_string();
    let mut is_key = lines.next().map(|l| l.trim() == "[key]").unwrap_or(false);

    if !is_key {
        if let Some(stripped) = value.strip_suffix("[key]") {
            value = stripped.trim_end().to_string();
            is_key = true;
        }
    }

    SysAttr { value, is_key }
}

/// Blocking adapter over the SCST sysfs tree with one timeout per
/// attribute or management operation.
#[derive(Debug)]
pub struct Sysfs {
    root: PathBuf,
    timeout: Duration,
}

impl Sysfs {
    pub fn new<P: AsRef<Path>>(root: P, timeout: Duration) -> Self {
        Sysfs {
            root: root.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// Probes the known sysfs mount points.
    ///
    /// ```no_run
    /// use scstadm::{Sysfs, DEFAULT_TIMEOUT};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let sysfs = Sysfs::detect(DEFAULT_TIMEOUT)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn detect(timeout: Duration) -> Result<Self> {
        for root in [SCST_ROOT_OLD, SCST_ROOT_NEW] {
            if Path::new(root).exists() {
                return Ok(Sysfs::new(root, timeout));
            }
        }
        anyhow::bail!(ScstError::NoModule)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    fn run_io<T, F>(&self, rel: &Path, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(op());
        });

        match rx.recv_timeout(self.timeout) {
            Ok(res) => {
                let out = res.map_err(ScstError::Io)?;
                Ok(out)
            }
            Err(_) => anyhow::bail!(ScstError::Timeout {
                path: rel.display().to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    fn mgmt_result(&self) -> Result<String> {
        let attr = self.read_attr(Path::new(FILE_MGMT_RES))?;
        Ok(attr.value)
    }
}

impl ControlIo for Sysfs {
    fn read_attr(&self, rel: &Path) -> Result<SysAttr> {
        let abs = self.abs(rel);
        let text = self.run_io(rel, move || fs::read_to_string(&abs))?;
        Ok(parse_attr(&text))
    }

    fn write_attr(&self, rel: &Path, value: &str, verify: bool) -> Result<()> {
        let abs = self.abs(rel);
        let line = value.to_string();
        let res = self.run_io(rel, move || fs::write(&abs, line));

        if let Err(e) = res {
            if let Some(ScstError::Io(ioe)) = e.downcast_ref::<ScstError>() {
                if ioe.kind() == io::ErrorKind::PermissionDenied {
                    anyhow::bail!(ScstError::AttrStatic(rel.display().to_string()))
                }
            }
            return Err(e);
        }

        if verify {
            let status = self.mgmt_result()?;
            if status.trim() != "0" {
                anyhow::bail!(ScstError::SetAttrFail {
                    path: rel.display().to_string(),
                    value: value.to_string(),
                    status,
                })
            }
        }

        Ok(())
    }

    fn mgmt(&self, dir: &Path, cmd: &str, verify: bool) -> Result<()> {
        let rel = dir.join(FILE_MGMT);
        let abs = self.abs(&rel);
        let line = cmd.to_string();
        self.run_io(&rel, move || fs::write(&abs, line))?;

        if verify {
            let status = self.mgmt_result()?;
            if status.trim() != "0" {
                anyhow::bail!(ScstError::MgmtFail {
                    path: rel.display().to_string(),
                    cmd: cmd.to_string(),
                    status,
                })
            }
        }

        Ok(())
    }

    fn list_dir(&self, rel: &Path) -> Result<Vec<String>> {
        let mut names = fs::read_dir(self.abs(rel))
            .map_err(ScstError::Io)?
            .filter_map(|res| res.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect::<Vec<String>>();
        names.sort();

        Ok(names)
    }

    fn is_dir(&self, rel: &Path) -> bool {
        self.abs(rel).is_dir()
    }

    fn exists(&self, rel: &Path) -> bool {
        self.abs(rel).exists()
    }

    fn link_name(&self, rel: &Path) -> Result<String> {
        let buf = fs::read_link(self.abs(rel)).map_err(ScstError::Io)?;
        let name = buf
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        Ok(name)
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn fixture() -> (TempDir, Sysfs) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(FILE_MGMT_RES), "0\n").unwrap();
        let sysfs = Sysfs::new(dir.path(), DEFAULT_TIMEOUT);
        (dir, sysfs)
    }

    #[test]
    fn test_parse_attr_forms() {
        assert_eq!(
            parse_attr("512\n"),
            SysAttr {
                value: "512".to_string(),
                is_key: false
            }
        );
        assert_eq!(
            parse_attr("512\n[key]\n"),
            SysAttr {
                value: "512".to_string(),
                is_key: true
            }
        );
        assert_eq!(
            parse_attr("open [key]"),
            SysAttr {
                value: "open".to_string(),
                is_key: true
            }
        );
        // only one trailing marker is a marker
        assert_eq!(
            parse_attr("open [key] [key]"),
            SysAttr {
                value: "open [key]".to_string(),
                is_key: true
            }
        );
        assert_eq!(
            parse_attr(""),
            SysAttr {
                value: "".to_string(),
                is_key: false
            }
        );
    }

    #[test]
    fn test_read_attr() -> anyhow::Result<()> {
        let (dir, sysfs) = fixture();
        fs::write(dir.path().join("blocksize"), "4096\n[key]\n")?;

        let attr = sysfs.read_attr(Path::new("blocksize"))?;
        assert_eq!(attr.value, "4096");
        assert!(attr.is_key);
        Ok(())
    }

    #[test]
    fn test_write_attr_verified() -> anyhow::Result<()> {
        let (dir, sysfs) = fixture();
        fs::write(dir.path().join("threads"), "1\n")?;

        sysfs.write_attr(Path::new("threads"), "8", true)?;
        assert_eq!(fs::read_to_string(dir.path().join("threads"))?, "8");
        Ok(())
    }

    #[test]
    fn test_write_attr_rejected() -> anyhow::Result<()> {
        let (dir, sysfs) = fixture();
        fs::write(dir.path().join(FILE_MGMT_RES), "-22\n")?;
        fs::write(dir.path().join("threads"), "1\n")?;

        let err = sysfs
            .write_attr(Path::new("threads"), "8", true)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScstError>(),
            Some(ScstError::SetAttrFail { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_mgmt_verified() -> anyhow::Result<()> {
        let (dir, sysfs) = fixture();
        fs::create_dir(dir.path().join("handlers"))?;
        fs::write(dir.path().join("handlers").join(FILE_MGMT), "")?;

        sysfs.mgmt(Path::new("handlers"), "add_device d1", true)?;
        assert_eq!(
            fs::read_to_string(dir.path().join("handlers").join(FILE_MGMT))?,
            "add_device d1"
        );

        fs::write(dir.path().join(FILE_MGMT_RES), "-1\n")?;
        let err = sysfs
            .mgmt(Path::new("handlers"), "add_device d2", true)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScstError>(),
            Some(ScstError::MgmtFail { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_link_name() -> anyhow::Result<()> {
        let (dir, sysfs) = fixture();
        fs::create_dir(dir.path().join("disk01"))?;
        std::os::unix::fs::symlink(dir.path().join("disk01"), dir.path().join("device"))?;

        assert_eq!(sysfs.link_name(Path::new("device"))?, "disk01");
        Ok(())
    }

    #[test]
    fn test_detect_missing_root() {
        // both well-known mount points are absent in the test environment
        if !Path::new(SCST_ROOT_OLD).exists() && !Path::new(SCST_ROOT_NEW).exists() {
            assert!(Sysfs::detect(DEFAULT_TIMEOUT).is_err());
        }
    }
}
