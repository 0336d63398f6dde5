//! Assembles and runs the step list for one build.

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use vsforge_vsphere::Platform;

use crate::artifact::Artifact;
use crate::config::BuildConfig;
use crate::context::BuildContext;
use crate::error::{BuildError, BuildResult};
use crate::step::{Sequencer, Step};
use crate::steps::*;

#[derive(Default)]
pub struct Builder {
    platform: Option<Arc<dyn Platform>>,
}

impl Builder {
    /// Builder that connects to the vCenter named in each config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder that runs every build against `platform`.
    pub fn with_platform(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform: Some(platform),
        }
    }

    /// Step list for a prepared config.
    pub fn steps(&self, config: &BuildConfig) -> BuildResult<Vec<Box<dyn Step>>> {
        let policy = config.wait_ip.policy().map_err(BuildError::Config)?;
        let shutdown_timeout = config
            .shutdown
            .timeout()
            .map_err(|e| BuildError::Config(vec![e]))?;
        let location = &config.location;

        let mut steps: Vec<Box<dyn Step>> = vec![Box::new(Connect::new(
            config.connection.clone(),
            self.platform.clone(),
        ))];

        match (&config.clone, &config.create) {
            (Some(clone), _) => {
                steps.push(Box::new(CloneVm::new(
                    location.clone(),
                    clone.clone(),
                    config.storage.clone(),
                    config.force,
                )));
                if clone.disk_size > 0 {
                    steps.push(Box::new(ResizeDisk::new(clone.disk_size)));
                }
            }
            (None, Some(create)) => steps.push(Box::new(CreateVm::new(
                location.clone(),
                create.clone(),
                config.storage.clone(),
                config.network_adapters.clone(),
                config.force,
            ))),
            (None, None) => {
                return Err(BuildError::Config(vec![
                    "exactly one of 'clone' or 'create' must be set".to_string(),
                ]))
            }
        }

        steps.push(Box::new(ConfigureHardware::new(config.hardware.clone())));
        steps.push(Box::new(ConfigParams::new(
            config.configuration_parameters.clone(),
            config.tools(),
        )));
        steps.push(Box::new(RemoteUpload::new(
            location.datastore.clone(),
            location.host.clone(),
            location.set_host_for_datastore_uploads,
        )));
        steps.push(Box::new(AddCdrom::new(config.cdrom.clone())));

        let has_floppy = config.floppy.floppy_path.is_some() || !config.floppy.floppy_img_path.is_empty();
        if has_floppy {
            steps.push(Box::new(AddFloppy::new(
                config.floppy.floppy_img_path.clone(),
                location.datastore.clone(),
                location.host.clone(),
                location.set_host_for_datastore_uploads,
            )));
        }
        if let Some(customize) = &config.customize {
            steps.push(Box::new(Customize::new(customize.clone())));
        }
        if !config.boot_order.is_empty() {
            steps.push(Box::new(BootOrder::new(config.boot_order.clone())));
        }

        steps.push(Box::new(Run));
        steps.push(Box::new(WaitForIp::new(policy)));
        steps.push(Box::new(Shutdown::new(
            shutdown_timeout,
            config.shutdown.disable_shutdown,
        )));
        steps.push(Box::new(RemoveCdrom::new(config.cdrom.remove_cdrom)));
        if has_floppy {
            steps.push(Box::new(RemoveFloppy::new(
                location.datastore.clone(),
                location.host.clone(),
            )));
        }

        if config.create_snapshot {
            steps.push(Box::new(CreateSnapshot::new(config.snapshot_name.clone())));
        }
        if config.convert_to_template {
            steps.push(Box::new(ConvertToTemplate));
        }
        if let Some(lib) = &config.content_library_destination {
            steps.push(Box::new(ImportToContentLibrary::new(lib.clone())));
        }
        Ok(steps)
    }

    /// Run one build. Returns `None` when the VM was destroyed on request.
    pub async fn run(&self, mut config: BuildConfig, cancel: CancellationToken) -> BuildResult<Option<Artifact>> {
        config.prepare()?;
        let build_id = Uuid::new_v4();
        let span = tracing::info_span!("build", id = %build_id, vm = %config.location.vm_name);
        self.run_prepared(config, build_id, cancel).instrument(span).await
    }

    async fn run_prepared(
        &self,
        config: BuildConfig,
        build_id: Uuid,
        cancel: CancellationToken,
    ) -> BuildResult<Option<Artifact>> {
        let mut seq = Sequencer::new(self.steps(&config)?);
        tracing::debug!(steps = ?seq.step_names(), "assembled build");

        let output_dir = config.output_directory.clone();
        if let Some(dir) = &output_dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut ctx = BuildContext::new(cancel);
        ctx.http_addr = config.http_addr.clone();
        ctx.floppy_path = config.floppy.floppy_path.clone();
        ctx.cd_paths = config.cdrom.iso_files.clone();
        ctx.destroy_vm = config.destroy;

        seq.run(&mut ctx).await;

        let failure = match ctx.error.take() {
            Some(err) => Some(err),
            None if ctx.cancelled => Some(BuildError::Cancelled),
            None => None,
        };
        if let Some(err) = failure {
            finish_failed(&mut ctx, output_dir).await;
            return Err(err);
        }

        let Some(session) = ctx.session.take() else {
            return Err(BuildError::Cancelled);
        };
        let Some(vm) = ctx.vm.take() else {
            tracing::info!("VM destroyed; no artifact");
            if let Err(e) = session.logout().await {
                tracing::warn!("logout failed: {e}");
            }
            return Ok(None);
        };

        tracing::info!("build finished");
        Ok(Some(Artifact::new(
            config.location.vm_name,
            vm.id().to_string(),
            output_dir,
            build_id,
            session,
        )))
    }
}

async fn finish_failed(ctx: &mut BuildContext, output_dir: Option<PathBuf>) {
    if let Some(dir) = output_dir {
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!("failed to remove {}: {e}", dir.display());
        }
    }
    if let Some(session) = ctx.session.take() {
        if let Err(e) = session.logout().await {
            tracing::warn!("logout failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: &str) -> BuildConfig {
        let text = format!(
            r#"{{
                "connection": {{ "vcenter_server": "vc", "username": "u", "password": "p" }},
                "location": {{ "vm_name": "web" }},
                {mode},
                "network_adapters": [{{ "network": "VM Network", "network_card": "vmxnet3" }}],
                "storage": [{{ "disk_size": 1024 }}]
            }}"#
        );
        let mut config = BuildConfig::from_json(&text).unwrap();
        config.prepare().unwrap();
        config
    }

    #[test]
    fn clone_step_order() {
        let mut cfg = config(r#""clone": { "template": "ubuntu-template", "disk_size": 4096 }"#);
        cfg.create_snapshot = true;
        cfg.convert_to_template = true;
        let steps = Builder::new().steps(&cfg).unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "connect",
                "clone-vm",
                "resize-disk",
                "configure-hardware",
                "config-params",
                "remote-upload",
                "add-cdrom",
                "run",
                "wait-for-ip",
                "shutdown",
                "remove-cdrom",
                "create-snapshot",
                "convert-to-template",
            ]
        );
    }

    #[test]
    fn create_mode_has_no_resize_or_customize() {
        let mut cfg = config(r#""create": { "guest_os_type": "otherGuest64" }"#);
        cfg.boot_order = vec!["disk".into(), "cdrom".into()];
        cfg.floppy.floppy_img_path = "[datastore1] boot.flp".into();
        let steps = Builder::new().steps(&cfg).unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name()).collect();
        assert_eq!(names[1], "create-vm");
        assert!(!names.contains(&"resize-disk"));
        assert!(!names.contains(&"customize"));
        assert!(names.contains(&"boot-order"));
        assert!(names.contains(&"add-floppy") && names.contains(&"remove-floppy"));
    }
}
