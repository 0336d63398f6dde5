//! Clone and create steps. Both own the VM they produce: on teardown, or
//! when the build asks for the VM to be destroyed, cleanup removes it.

use async_trait::async_trait;

use vsforge_vsphere::vm::{CloneRequest, CreateRequest};
use vsforge_vsphere::devices::NicSpec;

use crate::config::{CloneConfig, CreateConfig, LocationConfig, StorageConfig};
use crate::context::BuildContext;
use crate::step::{try_step, Step, StepAction};

async fn destroy_owned_vm(ctx: &mut BuildContext) {
    if !(ctx.should_teardown() || ctx.destroy_vm) {
        return;
    }
    let Some(vm) = ctx.vm.take() else {
        return;
    };
    tracing::info!("destroying VM {}", vm.id());
    if let Err(e) = vm.power_off().await {
        tracing::warn!("failed to power off {}: {e}", vm.id());
    }
    if let Err(e) = vm.destroy().await {
        tracing::warn!("failed to destroy {}: {e}", vm.id());
    }
}

// ── Clone ───────────────────────────────────────────────────────────

pub struct CloneVm {
    location: LocationConfig,
    clone: CloneConfig,
    storage: StorageConfig,
    force: bool,
}

impl CloneVm {
    pub fn new(location: LocationConfig, clone: CloneConfig, storage: StorageConfig, force: bool) -> Self {
        Self {
            location,
            clone,
            storage,
            force,
        }
    }

    fn request(&self) -> CloneRequest {
        CloneRequest {
            name: self.location.vm_name.clone(),
            folder: self.location.folder.clone(),
            cluster: self.location.cluster.clone(),
            host: self.location.host.clone(),
            resource_pool: self.location.resource_pool.clone(),
            datastore: self.location.datastore.clone(),
            linked_clone: self.clone.linked_clone,
            network: self.clone.network.clone(),
            mac_address: self.clone.mac_address.clone(),
            annotation: self.clone.notes.clone(),
            vapp_properties: self.clone.vapp.properties.clone(),
            disk_controller_types: self.storage.disk_controller_type.clone(),
            storage: self.storage.storage.clone(),
        }
    }
}

#[async_trait]
impl Step for CloneVm {
    fn name(&self) -> &'static str {
        "clone-vm"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let session = try_step!(ctx, ctx.session().cloned());
        try_step!(ctx, session.pre_clean_vm(&self.location.vm_path(), self.force).await);

        let template = try_step!(ctx, session.find_vm(&self.clone.template).await);
        tracing::info!("cloning {} to {}", self.clone.template, self.location.vm_name);
        let vm = try_step!(ctx, template.clone_vm(&self.request()).await);
        ctx.vm = Some(vm.clone());

        if !self.clone.public_keys.is_empty() {
            try_step!(ctx, vm.add_public_keys(&self.clone.public_keys).await);
        }
        StepAction::Continue
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) {
        destroy_owned_vm(ctx).await;
    }
}

// ── Create ──────────────────────────────────────────────────────────

pub struct CreateVm {
    location: LocationConfig,
    create: CreateConfig,
    storage: StorageConfig,
    nics: Vec<NicSpec>,
    force: bool,
}

impl CreateVm {
    pub fn new(
        location: LocationConfig,
        create: CreateConfig,
        storage: StorageConfig,
        nics: Vec<NicSpec>,
        force: bool,
    ) -> Self {
        Self {
            location,
            create,
            storage,
            nics,
            force,
        }
    }

    fn request(&self) -> CreateRequest {
        CreateRequest {
            name: self.location.vm_name.clone(),
            folder: self.location.folder.clone(),
            cluster: self.location.cluster.clone(),
            host: self.location.host.clone(),
            resource_pool: self.location.resource_pool.clone(),
            datastore: self.location.datastore.clone(),
            guest_os_type: self.create.guest_os_type.clone(),
            version: self.create.version,
            annotation: self.create.notes.clone(),
            disk_controller_types: self.storage.disk_controller_type.clone(),
            storage: self.storage.storage.clone(),
            nics: self.nics.clone(),
            usb_controllers: self.create.usb_controller.clone(),
        }
    }
}

#[async_trait]
impl Step for CreateVm {
    fn name(&self) -> &'static str {
        "create-vm"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let session = try_step!(ctx, ctx.session().cloned());
        try_step!(ctx, session.pre_clean_vm(&self.location.vm_path(), self.force).await);

        tracing::info!("creating VM {}", self.location.vm_name);
        let vm = try_step!(ctx, session.create_vm(&self.request()).await);
        ctx.vm = Some(vm);
        StepAction::Continue
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) {
        destroy_owned_vm(ctx).await;
    }
}
