//! Floppy drives.

use crate::devices::DeviceChangeSet;
use crate::error::VsphereResult;
use crate::types::*;
use crate::vm::VirtualMachine;

impl VirtualMachine {
    /// Add a floppy drive with `image` (a `[datastore] path`) inserted, if given.
    pub async fn add_floppy(&self, image: Option<&str>) -> VsphereResult<()> {
        let mut set = DeviceChangeSet::new();
        set.add(VirtualDevice::new(DeviceKind::Floppy {
            image_file: image.map(str::to_string),
        }));
        let spec = VmConfigSpec {
            device_change: set.resolve(&[])?,
            ..Default::default()
        };
        self.reconfigure("add floppy", &spec).await
    }

    pub async fn remove_floppies(&self) -> VsphereResult<()> {
        let floppies = self.floppy_devices().await?;
        self.remove_device(true, &floppies).await
    }
}
