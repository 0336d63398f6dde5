//! The result of a successful build.

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use vsforge_vsphere::Session;

use crate::error::BuildResult;

/// A built VM (or template), identified by name and platform id.
pub struct Artifact {
    pub name: String,
    pub vm_id: String,
    pub datacenter: String,
    pub output_dir: Option<PathBuf>,
    pub build_id: Uuid,
    pub finished_at: DateTime<Utc>,
    session: Arc<Session>,
}

impl Artifact {
    pub fn new(
        name: String,
        vm_id: String,
        output_dir: Option<PathBuf>,
        build_id: Uuid,
        session: Arc<Session>,
    ) -> Self {
        Self {
            name,
            vm_id,
            datacenter: session.datacenter().name.clone(),
            output_dir,
            build_id,
            finished_at: Utc::now(),
            session,
        }
    }

    pub fn id(&self) -> &str {
        &self.vm_id
    }

    pub fn string(&self) -> String {
        format!("VM: {}", self.name)
    }

    /// Delete the VM and the local output directory.
    pub async fn destroy(&self) -> BuildResult<()> {
        let vm = self.session.vm(&self.vm_id);
        tracing::info!("destroying artifact {}", self.name);
        vm.power_off().await?;
        vm.destroy().await?;

        if let Some(dir) = &self.output_dir {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Log the session out. The artifact can no longer be destroyed afterwards.
    pub async fn close(self) -> BuildResult<()> {
        self.session.logout().await?;
        Ok(())
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} in {})", self.string(), self.vm_id, self.datacenter)
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("name", &self.name)
            .field("vm_id", &self.vm_id)
            .field("datacenter", &self.datacenter)
            .field("output_dir", &self.output_dir)
            .field("build_id", &self.build_id)
            .finish()
    }
}
