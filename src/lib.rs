//! # vsforge
//!
//! Builds reusable VM templates on vSphere. A build is a JSON config run as
//! a sequence of steps: connect, clone or create the VM, lay out its devices,
//! customize the guest, boot it, wait for a stable IP, shut it down and
//! publish it as a snapshot, template or content library item.
//!
//! ## Modules
//!
//! - **config**: Build config sections and validation
//! - **context**: Typed state shared between steps
//! - **error**: `BuildError`
//! - **step**: `Step` trait and the sequencer
//! - **steps**: Concrete build steps
//! - **artifact**: The built VM
//! - **builder**: Step assembly and the build entry point
//! - **logging**: Subscriber setup for the binary

pub mod config;
pub mod context;
pub mod error;
pub mod step;
pub mod steps;
pub mod artifact;
pub mod builder;
pub mod logging;

pub use artifact::Artifact;
pub use builder::Builder;
pub use config::BuildConfig;
pub use error::{BuildError, BuildResult};
