//! Post-processing of the shut-down VM.

use async_trait::async_trait;

use vsforge_vsphere::library::{OvfImport, TemplateImport};

use crate::config::ContentLibraryConfig;
use crate::context::BuildContext;
use crate::step::{try_step, Step, StepAction};

pub struct CreateSnapshot {
    name: String,
}

impl CreateSnapshot {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

#[async_trait]
impl Step for CreateSnapshot {
    fn name(&self) -> &'static str {
        "create-snapshot"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        try_step!(ctx, vm.create_snapshot(&self.name).await);
        StepAction::Continue
    }
}

pub struct ConvertToTemplate;

#[async_trait]
impl Step for ConvertToTemplate {
    fn name(&self) -> &'static str {
        "convert-to-template"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        try_step!(ctx, vm.convert_to_template().await);
        StepAction::Continue
    }
}

/// Publish the VM to a content library, as an OVF or a VM template.
pub struct ImportToContentLibrary {
    config: ContentLibraryConfig,
}

impl ImportToContentLibrary {
    pub fn new(config: ContentLibraryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Step for ImportToContentLibrary {
    fn name(&self) -> &'static str {
        "import-to-content-library"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        let c = &self.config;
        tracing::info!("importing {} into content library {}", c.name, c.library);

        let imported = if c.ovf {
            vm.import_ovf_to_content_library(&OvfImport {
                library: c.library.clone(),
                name: c.name.clone(),
                description: c.description.clone(),
                flags: c.ovf_flags.clone(),
            })
            .await
        } else {
            vm.import_to_content_library(&TemplateImport {
                library: c.library.clone(),
                name: c.name.clone(),
                description: c.description.clone(),
                cluster: c.cluster.clone(),
                folder: c.folder.clone(),
                host: c.host.clone(),
                resource_pool: c.resource_pool.clone(),
                datastore: c.datastore.clone(),
            })
            .await
        };
        let item = try_step!(ctx, imported);
        tracing::info!("library item {item} is ready");

        if c.destroy {
            ctx.destroy_vm = true;
        }
        StepAction::Continue
    }
}
