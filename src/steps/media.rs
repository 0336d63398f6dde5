//! Removable media: ISO uploads, CD-ROM drives and floppy drives.

use async_trait::async_trait;
use std::path::Path;

use vsforge_vsphere::datastore::Datastore;
use vsforge_vsphere::VirtualMachine;

use super::{FLOPPY_IMAGE_NAME, ISO_CACHE_DIR};
use crate::config::CdromConfig;
use crate::context::BuildContext;
use crate::error::BuildResult;
use crate::step::{try_step, Step, StepAction};

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ── ISO upload ──────────────────────────────────────────────────────

/// Upload local ISOs into the datastore cache directory. Files that are
/// already cached are reused.
pub struct RemoteUpload {
    datastore: String,
    host: String,
    set_host: bool,
}

impl RemoteUpload {
    pub fn new(datastore: String, host: String, set_host: bool) -> Self {
        Self {
            datastore,
            host,
            set_host,
        }
    }

    async fn upload(&self, ds: &Datastore, src: &Path) -> BuildResult<String> {
        let remote = format!("{ISO_CACHE_DIR}/{}", file_name(src));
        if ds.file_exists(&remote).await? {
            tracing::info!("{remote} already cached on {}", ds.name());
        } else {
            ds.upload_file(src, &remote, &self.host, self.set_host).await?;
        }
        Ok(ds.resolve_path(&remote))
    }
}

#[async_trait]
impl Step for RemoteUpload {
    fn name(&self) -> &'static str {
        "remote-upload"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        if ctx.cd_paths.is_empty() {
            return StepAction::Continue;
        }
        let session = try_step!(ctx, ctx.session().cloned());
        let ds = try_step!(ctx, session.datastore(&self.datastore, &self.host).await);
        // Fails when the cache directory already exists; a real problem
        // surfaces on upload.
        if let Err(e) = ds.make_directory(ISO_CACHE_DIR).await {
            tracing::debug!("{ISO_CACHE_DIR}: {e}");
        }

        for src in ctx.cd_paths.clone() {
            let path = try_step!(ctx, self.upload(&ds, &src).await);
            ctx.uploaded_cd_paths.push(path);
        }
        StepAction::Continue
    }
}

// ── CD-ROM ──────────────────────────────────────────────────────────

/// One drive per ISO: the configured `iso_paths` first, then the uploads.
pub struct AddCdrom {
    cdrom: CdromConfig,
}

impl AddCdrom {
    pub fn new(cdrom: CdromConfig) -> Self {
        Self { cdrom }
    }
}

#[async_trait]
impl Step for AddCdrom {
    fn name(&self) -> &'static str {
        "add-cdrom"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let isos: Vec<String> = self
            .cdrom
            .iso_paths
            .iter()
            .chain(ctx.uploaded_cd_paths.iter())
            .cloned()
            .collect();
        if isos.is_empty() {
            return StepAction::Continue;
        }

        let vm = try_step!(ctx, ctx.vm().cloned());
        let controller = self.cdrom.controller();
        if controller == vsforge_vsphere::cdrom::CdromControllerType::Sata {
            try_step!(ctx, vm.ensure_sata_controller().await);
        }
        for iso in &isos {
            tracing::info!("mounting {iso}");
            try_step!(ctx, vm.add_cdrom(controller, Some(iso)).await);
        }
        StepAction::Continue
    }
}

/// Eject every CD-ROM, and detach the drives when asked to.
pub struct RemoveCdrom {
    remove: bool,
}

impl RemoveCdrom {
    pub fn new(remove: bool) -> Self {
        Self { remove }
    }
}

#[async_trait]
impl Step for RemoveCdrom {
    fn name(&self) -> &'static str {
        "remove-cdrom"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        tracing::info!("ejecting CD-ROMs");
        try_step!(ctx, vm.eject_cdroms().await);
        if self.remove {
            tracing::info!("removing CD-ROM drives");
            try_step!(ctx, vm.remove_cdroms().await);
        }
        StepAction::Continue
    }
}

// ── Floppy ──────────────────────────────────────────────────────────

/// Attach a floppy drive. A local image is uploaded into the VM directory
/// first and takes precedence over `floppy_img_path`.
pub struct AddFloppy {
    floppy_img_path: String,
    datastore: String,
    host: String,
    set_host: bool,
}

impl AddFloppy {
    pub fn new(floppy_img_path: String, datastore: String, host: String, set_host: bool) -> Self {
        Self {
            floppy_img_path,
            datastore,
            host,
            set_host,
        }
    }

    async fn upload(&self, vm: &VirtualMachine, src: &Path) -> BuildResult<String> {
        let ds = vm.session().datastore(&self.datastore, &self.host).await?;
        let dir = vm.get_dir().await?;
        let remote = format!("{dir}/{FLOPPY_IMAGE_NAME}");
        ds.upload_file(src, &remote, &self.host, self.set_host).await?;
        Ok(ds.resolve_path(&remote))
    }
}

#[async_trait]
impl Step for AddFloppy {
    fn name(&self) -> &'static str {
        "add-floppy"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());

        if let Some(src) = ctx.floppy_path.clone() {
            let uploaded = try_step!(ctx, self.upload(&vm, &src).await);
            ctx.uploaded_floppy_path = Some(uploaded.clone());
            tracing::info!("adding floppy with {uploaded}");
            try_step!(ctx, vm.add_floppy(Some(&uploaded)).await);
        } else if !self.floppy_img_path.is_empty() {
            tracing::info!("adding floppy with {}", self.floppy_img_path);
            try_step!(ctx, vm.add_floppy(Some(&self.floppy_img_path)).await);
        }
        StepAction::Continue
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) {
        if !ctx.should_teardown() {
            return;
        }
        let Some(path) = ctx.uploaded_floppy_path.take() else {
            return;
        };
        let Ok(session) = ctx.session().cloned() else {
            return;
        };
        let deleted = match session.datastore(&self.datastore, &self.host).await {
            Ok(ds) => ds.delete(&path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = deleted {
            tracing::warn!("failed to delete floppy image {path}: {e}");
        }
    }
}

/// Detach floppy drives and delete the uploaded image.
pub struct RemoveFloppy {
    datastore: String,
    host: String,
}

impl RemoveFloppy {
    pub fn new(datastore: String, host: String) -> Self {
        Self { datastore, host }
    }
}

#[async_trait]
impl Step for RemoveFloppy {
    fn name(&self) -> &'static str {
        "remove-floppy"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        tracing::info!("removing floppy drives");
        try_step!(ctx, vm.remove_floppies().await);

        if let Some(path) = ctx.uploaded_floppy_path.clone() {
            let ds = try_step!(ctx, vm.session().datastore(&self.datastore, &self.host).await);
            try_step!(ctx, ds.delete(&path).await);
            ctx.uploaded_floppy_path = None;
        }
        StepAction::Continue
    }
}
