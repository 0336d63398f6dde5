//! CD-ROM drives, SATA controllers and datastore path helpers.

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

use crate::devices::{ControllerRef, DeviceChangeSet};
use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::types::*;
use crate::vm::VirtualMachine;

lazy_static! {
    static ref DATASTORE_PATH: Regex = Regex::new(r"^\s*\[(.*)\]\s*(.*)$").unwrap();
}

/// A `[datastore] path/to/file` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastorePath {
    pub datastore: String,
    pub path: String,
}

impl DatastorePath {
    pub fn parse(s: &str) -> Option<Self> {
        let caps = DATASTORE_PATH.captures(s)?;
        Some(Self {
            datastore: caps[1].to_string(),
            path: caps[2].to_string(),
        })
    }
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.path)
    }
}

/// Strip a leading `[datastore]` from a path, if present.
pub fn remove_datastore_prefix(path: &str) -> String {
    match DatastorePath::parse(path) {
        Some(p) => p.path,
        None => path.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CdromControllerType {
    #[default]
    Ide,
    Sata,
}

impl FromStr for CdromControllerType {
    type Err = VsphereError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "ide" => Ok(Self::Ide),
            "sata" => Ok(Self::Sata),
            other => Err(VsphereError::config(format!(
                "'cdrom_type' must be 'ide' or 'sata', got '{other}'"
            ))),
        }
    }
}

impl VirtualMachine {
    // ── SATA ────────────────────────────────────────────────────────

    pub async fn find_sata_controller(&self) -> VsphereResult<VirtualDevice> {
        self.devices()
            .await?
            .into_iter()
            .find(|d| matches!(d.kind, DeviceKind::SataController { .. }))
            .ok_or_else(|| VsphereError::new(VsphereErrorKind::NoSataController, "no available SATA controller"))
    }

    pub async fn add_sata_controller(&self) -> VsphereResult<()> {
        let devices = self.devices().await?;
        let mut set = DeviceChangeSet::new();
        set.add(VirtualDevice::new(DeviceKind::SataController { bus_number: 0 }));
        let spec = VmConfigSpec {
            device_change: set.resolve(&devices)?,
            ..Default::default()
        };
        self.reconfigure("add SATA controller", &spec).await
    }

    /// The VM's SATA controller, created first if it has none.
    pub async fn ensure_sata_controller(&self) -> VsphereResult<VirtualDevice> {
        match self.find_sata_controller().await {
            Ok(controller) => Ok(controller),
            Err(e) if e.kind == VsphereErrorKind::NoSataController => {
                self.add_sata_controller().await?;
                self.find_sata_controller().await
            }
            Err(e) => Err(e),
        }
    }

    // ── CD-ROM ──────────────────────────────────────────────────────

    /// Add a CD-ROM drive, optionally with an ISO inserted.
    ///
    /// `iso` is either a content library file (`library/item/file`) or a
    /// datastore path (`[datastore] path`).
    pub async fn add_cdrom(&self, controller: CdromControllerType, iso: Option<&str>) -> VsphereResult<()> {
        let devices = self.devices().await?;
        let controller_key = match controller {
            CdromControllerType::Sata => self.find_sata_controller().await?.key,
            CdromControllerType::Ide => free_ide_controller(&devices)?,
        };

        let iso_file = match iso {
            Some(path) => Some(self.resolve_iso_path(path).await?),
            None => None,
        };

        let mut set = DeviceChangeSet::new();
        set.attach(
            VirtualDevice::new(DeviceKind::Cdrom {
                connected: iso_file.is_some(),
                iso_file,
            }),
            ControllerRef::Existing(controller_key),
        );
        let spec = VmConfigSpec {
            device_change: set.resolve(&devices)?,
            ..Default::default()
        };
        self.reconfigure("add cdrom", &spec).await
    }

    async fn resolve_iso_path(&self, path: &str) -> VsphereResult<String> {
        match self.session().find_content_library_file_datastore_path(path).await {
            Ok(resolved) => {
                log::debug!("using content library file {path} at {resolved}");
                return Ok(resolved);
            }
            Err(e) => log::debug!("'{path}' is not a content library file: {e}"),
        }
        DatastorePath::parse(path)
            .map(|p| p.to_string())
            .ok_or_else(|| VsphereError::config(format!("{path} is not a valid iso path")))
    }

    /// Disconnect and empty every CD-ROM drive.
    pub async fn eject_cdroms(&self) -> VsphereResult<()> {
        let devices = self.devices().await?;
        let mut set = DeviceChangeSet::new();
        for mut dev in devices.into_iter().filter(|d| d.is_cdrom()) {
            dev.kind = DeviceKind::Cdrom {
                iso_file: None,
                connected: false,
            };
            set.edit(dev);
        }
        if set.is_empty() {
            return Ok(());
        }
        let spec = VmConfigSpec {
            device_change: set.resolve(&[])?,
            ..Default::default()
        };
        self.reconfigure("eject cdroms", &spec).await
    }

    pub async fn remove_cdroms(&self) -> VsphereResult<()> {
        let cdroms: Vec<VirtualDevice> = self.devices().await?.into_iter().filter(|d| d.is_cdrom()).collect();
        self.remove_device(true, &cdroms).await
    }

    /// Remove `devices`; backing files are destroyed unless `keep_files`.
    pub async fn remove_device(&self, keep_files: bool, devices: &[VirtualDevice]) -> VsphereResult<()> {
        if devices.is_empty() {
            return Ok(());
        }
        let mut set = DeviceChangeSet::new();
        for dev in devices {
            set.remove(dev.clone(), !keep_files);
        }
        let spec = VmConfigSpec {
            device_change: set.resolve(&[])?,
            ..Default::default()
        };
        self.reconfigure("remove device", &spec).await
    }
}

/// Key of the first IDE controller with a free unit.
fn free_ide_controller(devices: &[VirtualDevice]) -> VsphereResult<i32> {
    devices
        .iter()
        .filter(|d| matches!(d.kind, DeviceKind::IdeController { .. }))
        .find(|c| {
            let used = devices.iter().filter(|d| d.controller_key == Some(c.key)).count();
            used < BusFamily::Ide.max_units() as usize
        })
        .map(|c| c.key)
        .ok_or_else(|| VsphereError::new(VsphereErrorKind::DeviceState, "no IDE controller with a free unit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::simulator::SimulatedPlatform;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn vm(name: &str) -> (Arc<SimulatedPlatform>, VirtualMachine) {
        let sim = Arc::new(SimulatedPlatform::lab());
        let session = Session::open(sim.clone(), "dc1", CancellationToken::new()).await.unwrap();
        let vm = session.find_vm(name).await.unwrap();
        (sim, vm)
    }

    #[test]
    fn datastore_paths() {
        let p = DatastorePath::parse("[datastore1] iso/ubuntu.iso").unwrap();
        assert_eq!(p.datastore, "datastore1");
        assert_eq!(p.path, "iso/ubuntu.iso");
        assert_eq!(p.to_string(), "[datastore1] iso/ubuntu.iso");
        assert!(DatastorePath::parse("iso/ubuntu.iso").is_none());
        assert_eq!(remove_datastore_prefix("[ds 1] vm/dir"), "vm/dir");
        assert_eq!(remove_datastore_prefix("vm/dir"), "vm/dir");
    }

    #[test]
    fn controller_type_names() {
        assert_eq!("".parse::<CdromControllerType>().unwrap(), CdromControllerType::Ide);
        assert_eq!("sata".parse::<CdromControllerType>().unwrap(), CdromControllerType::Sata);
        assert!("scsi".parse::<CdromControllerType>().is_err());
    }

    #[tokio::test]
    async fn sata_controller_is_created_once() {
        let (sim, vm) = vm("ubuntu-template").await;
        let err = vm.find_sata_controller().await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::NoSataController);

        let first = vm.ensure_sata_controller().await.unwrap();
        let second = vm.ensure_sata_controller().await.unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(sim.reconfigurations(vm.id()).len(), 1);
    }

    #[tokio::test]
    async fn cdrom_on_ide_with_datastore_iso() {
        let (_, vm) = vm("ubuntu-template").await;
        vm.add_cdrom(CdromControllerType::Ide, Some("[datastore1] iso/ubuntu.iso")).await.unwrap();
        let cdrom = vm.devices().await.unwrap().into_iter().find(|d| d.is_cdrom()).unwrap();
        assert_eq!(cdrom.controller_key, Some(200));
        assert_eq!(
            cdrom.kind,
            DeviceKind::Cdrom { iso_file: Some("[datastore1] iso/ubuntu.iso".into()), connected: true }
        );
    }

    #[tokio::test]
    async fn cdrom_resolves_content_library_file() {
        let (_, vm) = vm("ubuntu-template").await;
        vm.ensure_sata_controller().await.unwrap();
        vm.add_cdrom(CdromControllerType::Sata, Some("lib-local/ubuntu-iso/ubuntu.iso")).await.unwrap();
        let cdrom = vm.devices().await.unwrap().into_iter().find(|d| d.is_cdrom()).unwrap();
        match cdrom.kind {
            DeviceKind::Cdrom { iso_file, .. } => {
                assert_eq!(iso_file.as_deref(), Some("[datastore1] contentlib-lib-1/item-1/ubuntu.iso"))
            }
            other => panic!("unexpected device {other:?}"),
        }
    }

    #[tokio::test]
    async fn cdrom_rejects_bad_iso_path() {
        let (_, vm) = vm("ubuntu-template").await;
        let err = vm.add_cdrom(CdromControllerType::Ide, Some("ubuntu.iso")).await.unwrap_err();
        assert_eq!(err.message, "ubuntu.iso is not a valid iso path");
    }

    #[tokio::test]
    async fn sata_cdrom_needs_controller() {
        let (_, vm) = vm("ubuntu-template").await;
        let err = vm.add_cdrom(CdromControllerType::Sata, None).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::NoSataController);
    }

    #[tokio::test]
    async fn ide_units_fill_up() {
        let (_, vm) = vm("ubuntu-template").await;
        for _ in 0..4 {
            vm.add_cdrom(CdromControllerType::Ide, None).await.unwrap();
        }
        let err = vm.add_cdrom(CdromControllerType::Ide, None).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::DeviceState);
    }

    #[tokio::test]
    async fn eject_then_remove() {
        let (_, vm) = vm("ubuntu-template").await;
        vm.add_cdrom(CdromControllerType::Ide, Some("[datastore1] a.iso")).await.unwrap();
        vm.add_cdrom(CdromControllerType::Ide, Some("[datastore1] b.iso")).await.unwrap();
        vm.eject_cdroms().await.unwrap();
        let devices = vm.devices().await.unwrap();
        assert!(devices
            .iter()
            .filter(|d| d.is_cdrom())
            .all(|d| d.kind == DeviceKind::Cdrom { iso_file: None, connected: false }));

        vm.remove_cdroms().await.unwrap();
        assert!(!vm.devices().await.unwrap().iter().any(|d| d.is_cdrom()));
    }
}
