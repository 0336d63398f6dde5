//! Content library imports.

use serde::{Deserialize, Serialize};

use crate::error::{VsphereError, VsphereResult};
use crate::platform::Platform;
use crate::types::*;
use crate::vm::VirtualMachine;

/// Export a VM into a library as an OVF template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OvfImport {
    pub library: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Export a VM into a library as a VM template, placed where deployments land.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateImport {
    pub library: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub resource_pool: String,
    #[serde(default)]
    pub datastore: String,
}

fn require_local(library: &ContentLibrary) -> VsphereResult<()> {
    if library.is_local() {
        return Ok(());
    }
    Err(VsphereError::config(format!(
        "can not deploy a VM to the content library {} of type {}; the content library must be of type LOCAL",
        library.name,
        library.lib_type.as_deref().unwrap_or("UNKNOWN")
    )))
}

impl VirtualMachine {
    /// Returns the library item ID. An item with the same name is updated in place.
    pub async fn import_ovf_to_content_library(&self, import: &OvfImport) -> VsphereResult<String> {
        let session = self.session();
        let library = session.find_content_library(&import.library).await?;
        require_local(&library)?;
        let existing = session.find_library_item(&library, &import.name).await?;

        let spec = OvfLibraryItemSpec {
            source_vm: self.id().to_string(),
            library_id: library.id.clone(),
            library_item_id: existing.map(|i| i.id),
            name: import.name.clone(),
            description: import.description.clone(),
            flags: import.flags.clone(),
        };
        log::info!("importing {} into content library '{}' as OVF '{}'", self.id(), library.name, import.name);
        session
            .platform()
            .create_ovf_library_item(&spec)
            .await
            .map_err(|e| e.context("import OVF to content library", &import.name))
    }

    /// Returns the library item ID.
    pub async fn import_to_content_library(&self, import: &TemplateImport) -> VsphereResult<String> {
        let session = self.session();
        let library = session.find_content_library(&import.library).await?;
        require_local(&library)?;

        let mut placement = TemplatePlacement::default();
        if !import.cluster.is_empty() {
            placement.cluster = Some(session.find_cluster(&import.cluster).await?.cluster);
        }
        if !import.folder.is_empty() {
            placement.folder = Some(session.find_folder(&import.folder).await?.folder);
        }
        if !import.host.is_empty() {
            placement.host = Some(session.find_host(&import.host).await?.host);
        }
        if !import.resource_pool.is_empty() {
            placement.resource_pool = Some(
                session
                    .find_resource_pool(&import.cluster, &import.host, &import.resource_pool)
                    .await?
                    .resource_pool,
            );
        }
        let vm_home_datastore = if import.datastore.is_empty() {
            None
        } else {
            Some(session.find_datastore(&import.datastore, &import.host).await?.datastore)
        };

        let spec = VmTemplateLibrarySpec {
            source_vm: self.id().to_string(),
            library_id: library.id.clone(),
            name: import.name.clone(),
            description: import.description.clone(),
            placement,
            vm_home_datastore,
        };
        log::info!("importing {} into content library '{}' as VM template '{}'", self.id(), library.name, import.name);
        session
            .platform()
            .create_template_library_item(&spec)
            .await
            .map_err(|e| e.context("import to content library", &import.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VsphereErrorKind;
    use crate::session::Session;
    use crate::simulator::SimulatedPlatform;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn vm() -> (Arc<SimulatedPlatform>, VirtualMachine) {
        let sim = Arc::new(SimulatedPlatform::lab());
        let session = Session::open(sim.clone(), "dc1", CancellationToken::new()).await.unwrap();
        (sim, session.find_vm("ubuntu-template").await.unwrap())
    }

    #[tokio::test]
    async fn ovf_import_creates_then_updates() {
        let (sim, vm) = vm().await;
        let import = OvfImport {
            library: "lib-local".into(),
            name: "golden".into(),
            ..Default::default()
        };
        let first = vm.import_ovf_to_content_library(&import).await.unwrap();
        let second = vm.import_ovf_to_content_library(&import).await.unwrap();
        assert_eq!(first, second);

        let specs = sim.ovf_imports();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].library_item_id, None);
        assert_eq!(specs[1].library_item_id.as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn subscribed_library_rejected() {
        let (sim, vm) = vm().await;
        let import = OvfImport {
            library: "lib-sub".into(),
            name: "golden".into(),
            ..Default::default()
        };
        let err = vm.import_ovf_to_content_library(&import).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::Configuration);
        assert_eq!(
            err.message,
            "can not deploy a VM to the content library lib-sub of type SUBSCRIBED; the content library must be of type LOCAL"
        );
        assert!(sim.ovf_imports().is_empty());
    }

    #[tokio::test]
    async fn template_import_resolves_placement() {
        let (sim, vm) = vm().await;
        let import = TemplateImport {
            library: "lib-local".into(),
            name: "golden-vmtx".into(),
            cluster: "cluster1".into(),
            folder: "templates".into(),
            resource_pool: "pool-a".into(),
            datastore: "datastore1".into(),
            ..Default::default()
        };
        vm.import_to_content_library(&import).await.unwrap();
        let spec = sim.template_imports().pop().unwrap();
        assert_eq!(spec.placement.cluster.as_deref(), Some("domain-c1"));
        assert_eq!(spec.placement.folder.as_deref(), Some("group-v2"));
        assert_eq!(spec.placement.resource_pool.as_deref(), Some("resgroup-2"));
        assert_eq!(spec.placement.host, None);
        assert_eq!(spec.vm_home_datastore.as_deref(), Some("datastore-1"));
    }
}
