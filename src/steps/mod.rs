//! Concrete build steps.
//!
//! Each step reads what it needs from its own config section and the
//! [`BuildContext`](crate::context::BuildContext), and records what it
//! produces back into the context.

mod connect;
mod customize;
mod export;
mod hardware;
mod media;
mod power;
mod vm;

pub use connect::Connect;
pub use customize::Customize;
pub use export::{ConvertToTemplate, CreateSnapshot, ImportToContentLibrary};
pub use hardware::{BootOrder, ConfigParams, ConfigureHardware, ResizeDisk};
pub use media::{AddCdrom, AddFloppy, RemoteUpload, RemoveCdrom, RemoveFloppy};
pub use power::{Run, Shutdown, WaitForIp};
pub use vm::{CloneVm, CreateVm};

/// Datastore directory that uploaded ISOs are cached in.
pub const ISO_CACHE_DIR: &str = "vsforge_cache";

/// Name of an uploaded floppy image inside the VM directory.
pub const FLOPPY_IMAGE_NAME: &str = "vsforge-tmp-created-floppy.flp";
