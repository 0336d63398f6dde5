//! # vsforge - vSphere provisioning driver
//!
//! Clones or creates virtual machines on vCenter, lays out their storage and
//! network devices, applies guest customization and waits for the guest to
//! settle on an IP address.
//!
//! ## Modules
//!
//! - **types**: Shared data structures (inventory, devices, specs, tasks)
//! - **error**: Crate error type and the error taxonomy
//! - **net**: CIDR parsing and subnet matching
//! - **platform**: The `Platform` trait every backend implements
//! - **vsphere**: HTTP client with session-based auth
//! - **vim**: VI/JSON wire codec
//! - **rest**: `Platform` over a live vCenter
//! - **session**: Datacenter-bound session and inventory finders
//! - **network**: Network name resolution and adapter assignment
//! - **devices**: Device change sets, storage layout, adapters
//! - **task**: Waiting on platform tasks with cancellation
//! - **vm**: VM handle: clone, create, configure, power, snapshot
//! - **vapp**: vApp property overrides
//! - **customize**: Guest customization spec construction
//! - **ipwait**: IP convergence waiter
//! - **cdrom** / **floppy**: Removable media devices
//! - **datastore**: Datastore file operations
//! - **library**: Content library imports
//! - **simulator**: In-memory platform (tests and the `simulator` feature)

pub mod types;
pub mod error;
pub mod net;
pub mod platform;
pub mod vsphere;
pub mod vim;
pub mod rest;
pub mod session;
pub mod network;
pub mod devices;
pub mod task;
pub mod vm;
pub mod vapp;
pub mod customize;
pub mod ipwait;
pub mod cdrom;
pub mod floppy;
pub mod datastore;
pub mod library;
#[cfg(any(test, feature = "simulator"))]
pub mod simulator;

pub use error::{ErrorCategory, VsphereError, VsphereErrorKind, VsphereResult};
pub use platform::Platform;
pub use session::Session;
pub use vm::VirtualMachine;
