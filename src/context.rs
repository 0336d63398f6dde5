//! Typed state shared by the build steps.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use vsforge_vsphere::{Session, VirtualMachine};

use crate::error::BuildError;

/// Everything one step hands to the next.
pub struct BuildContext {
    /// Set by the connect step.
    pub session: Option<Arc<Session>>,
    /// Set by the clone or create step.
    pub vm: Option<VirtualMachine>,
    /// Guest address found by the IP waiter; read by communicators.
    pub ip: Option<IpAddr>,
    /// `host:port` of the boot-file HTTP server, when one is running.
    pub http_addr: Option<String>,

    /// Local floppy image to upload.
    pub floppy_path: Option<PathBuf>,
    /// Local ISOs to upload.
    pub cd_paths: Vec<PathBuf>,
    /// Datastore path the floppy image was uploaded to.
    pub uploaded_floppy_path: Option<String>,
    /// Datastore paths of uploaded ISOs, in `cd_paths` order.
    pub uploaded_cd_paths: Vec<String>,

    /// Error that halted the build.
    pub error: Option<BuildError>,
    pub cancel: CancellationToken,
    pub halted: bool,
    pub cancelled: bool,
    /// Tear the VM down even when the build succeeds.
    pub destroy_vm: bool,
}

impl BuildContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            session: None,
            vm: None,
            ip: None,
            http_addr: None,
            floppy_path: None,
            cd_paths: Vec::new(),
            uploaded_floppy_path: None,
            uploaded_cd_paths: Vec::new(),
            error: None,
            cancel,
            halted: false,
            cancelled: false,
            destroy_vm: false,
        }
    }

    /// Whether cleanup should undo what the steps created.
    pub fn should_teardown(&self) -> bool {
        self.halted || self.cancelled
    }

    pub fn session(&self) -> Result<&Arc<Session>, BuildError> {
        self.session
            .as_ref()
            .ok_or_else(|| missing("session"))
    }

    pub fn vm(&self) -> Result<&VirtualMachine, BuildError> {
        self.vm.as_ref().ok_or_else(|| missing("vm"))
    }
}

fn missing(what: &str) -> BuildError {
    BuildError::Vsphere(vsforge_vsphere::VsphereError::new(
        vsforge_vsphere::VsphereErrorKind::DeviceState,
        format!("no {what} in the build context"),
    ))
}

/// Communicator host: the address recorded by the IP waiter.
pub fn comm_host(ctx: &BuildContext) -> Option<String> {
    ctx.ip.map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_host_follows_ip() {
        let mut ctx = BuildContext::new(CancellationToken::new());
        assert_eq!(comm_host(&ctx), None);
        ctx.ip = Some("10.0.0.5".parse().unwrap());
        assert_eq!(comm_host(&ctx).as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn teardown_flags() {
        let mut ctx = BuildContext::new(CancellationToken::new());
        assert!(!ctx.should_teardown());
        ctx.cancelled = true;
        assert!(ctx.should_teardown());
        assert!(ctx.vm().is_err());
    }
}
