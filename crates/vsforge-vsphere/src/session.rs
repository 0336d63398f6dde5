//! Connected session: platform handle, pinned datacenter and name lookups.

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::platform::Platform;
use crate::rest::RestPlatform;
use crate::types::*;
use crate::vm::VirtualMachine;

/// Inventory that does not change during a build. VMs are never cached.
#[derive(Default)]
struct LookupCache {
    hosts: Option<Vec<HostSummary>>,
    networks: Option<Vec<NetworkSummary>>,
    datastores: Option<Vec<DatastoreSummary>>,
    pools: Option<Vec<ResourcePoolSummary>>,
    folders: Option<Vec<FolderSummary>>,
    clusters: Option<Vec<ClusterSummary>>,
    libraries: Option<Vec<ContentLibrary>>,
}

macro_rules! cached_list {
    ($name:ident, $field:ident, $ty:ty, $call:ident) => {
        pub(crate) async fn $name(&self) -> VsphereResult<Vec<$ty>> {
            if let Some(list) = self.cache().$field.clone() {
                return Ok(list);
            }
            let list = self.platform.$call(&self.datacenter.datacenter).await?;
            self.cache().$field = Some(list.clone());
            Ok(list)
        }
    };
}

/// A session bound to one datacenter.
pub struct Session {
    platform: Arc<dyn Platform>,
    datacenter: DatacenterSummary,
    cache: Mutex<LookupCache>,
    cancel: CancellationToken,
}

impl Session {
    /// Log into a vCenter endpoint and pin the configured datacenter.
    pub async fn connect(config: &VsphereConfig, cancel: CancellationToken) -> VsphereResult<Arc<Self>> {
        let platform = RestPlatform::connect(config).await?;
        let datacenter = config.datacenter.clone().unwrap_or_default();
        Self::open(Arc::new(platform), &datacenter, cancel).await
    }

    /// Bind an already authenticated platform. An empty datacenter name
    /// selects the only datacenter, if there is exactly one.
    pub async fn open(
        platform: Arc<dyn Platform>,
        datacenter: &str,
        cancel: CancellationToken,
    ) -> VsphereResult<Arc<Self>> {
        let all = platform.list_datacenters().await?;
        let datacenter = if datacenter.is_empty() {
            match all.as_slice() {
                [only] => only.clone(),
                [] => return Err(VsphereError::not_found("no datacenters found")),
                _ => {
                    return Err(VsphereError::ambiguous(
                        "multiple datacenters found; specify one with 'datacenter'",
                    ))
                }
            }
        } else {
            all.into_iter()
                .find(|dc| dc.name == datacenter || dc.datacenter == datacenter)
                .ok_or_else(|| VsphereError::not_found(format!("datacenter '{datacenter}' not found")))?
        };
        log::debug!("using datacenter {} ({})", datacenter.name, datacenter.datacenter);

        Ok(Arc::new(Self {
            platform,
            datacenter,
            cache: Mutex::new(LookupCache::default()),
            cancel,
        }))
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub fn datacenter(&self) -> &DatacenterSummary {
        &self.datacenter
    }

    /// Build-wide cancellation signal.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn logout(&self) -> VsphereResult<()> {
        self.platform.logout().await
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, LookupCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    cached_list!(hosts, hosts, HostSummary, list_hosts);
    cached_list!(networks, networks, NetworkSummary, list_networks);
    cached_list!(datastores, datastores, DatastoreSummary, list_datastores);
    cached_list!(resource_pools, pools, ResourcePoolSummary, list_resource_pools);
    cached_list!(folders, folders, FolderSummary, list_folders);
    cached_list!(clusters, clusters, ClusterSummary, list_clusters);

    pub(crate) async fn libraries(&self) -> VsphereResult<Vec<ContentLibrary>> {
        if let Some(list) = self.cache().libraries.clone() {
            return Ok(list);
        }
        let list = self.platform.list_libraries().await?;
        self.cache().libraries = Some(list.clone());
        Ok(list)
    }

    // ── VMs ─────────────────────────────────────────────────────────

    /// Look up a VM by `name` or `folder/name`.
    pub async fn find_vm(self: &Arc<Self>, path: &str) -> VsphereResult<VirtualMachine> {
        let vms = self.platform.list_vms(&self.datacenter.datacenter).await?;
        let path = path.trim_matches('/');
        let matches: Vec<&VmSummary> = match path.rsplit_once('/') {
            Some((folder, name)) => vms
                .iter()
                .filter(|vm| vm.name == name && vm.folder.as_deref().unwrap_or("") == folder)
                .collect(),
            None => vms.iter().filter(|vm| vm.name == path).collect(),
        };
        match matches.as_slice() {
            [] => Err(VsphereError::not_found(format!("vm '{path}' not found"))),
            [vm] => Ok(self.vm(&vm.vm)),
            _ => Err(VsphereError::ambiguous(format!(
                "vm name '{path}' matches {} VMs; use the folder path",
                matches.len()
            ))),
        }
    }

    /// Handle for a VM known by ID.
    pub fn vm(self: &Arc<Self>, id: &str) -> VirtualMachine {
        VirtualMachine::new(self.clone(), id)
    }

    /// Destroy a leftover VM of the same name when `force` is set.
    pub async fn pre_clean_vm(self: &Arc<Self>, path: &str, force: bool) -> VsphereResult<()> {
        let vm = match self.find_vm(path).await {
            Ok(vm) => vm,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !force {
            return Err(VsphereError::new(
                VsphereErrorKind::AlreadyExists,
                format!("{path} already exists, you can use -force flag to destroy it"),
            ));
        }
        log::info!("the force flag is set; deleting existing VM '{path}'");
        vm.power_off().await?;
        vm.destroy().await
    }

    // ── Hosts / clusters / folders ──────────────────────────────────

    pub async fn find_host(&self, name: &str) -> VsphereResult<HostSummary> {
        self.hosts()
            .await?
            .into_iter()
            .find(|h| h.name == name || h.host == name)
            .ok_or_else(|| VsphereError::not_found(format!("host '{name}' not found")))
    }

    pub async fn find_cluster(&self, name: &str) -> VsphereResult<ClusterSummary> {
        self.clusters()
            .await?
            .into_iter()
            .find(|c| c.name == name || c.cluster == name)
            .ok_or_else(|| VsphereError::not_found(format!("cluster '{name}' not found")))
    }

    /// VM folder by path relative to the datacenter VM folder; "" is the root.
    pub async fn find_folder(&self, path: &str) -> VsphereResult<FolderSummary> {
        let path = path.trim_matches('/');
        self.folders()
            .await?
            .into_iter()
            .find(|f| f.path == path)
            .ok_or_else(|| VsphereError::not_found(format!("folder '{path}' not found")))
    }

    /// Resource pool under the given cluster or host. An empty name picks
    /// the owner's root pool.
    pub async fn find_resource_pool(
        &self,
        cluster: &str,
        host: &str,
        name: &str,
    ) -> VsphereResult<ResourcePoolSummary> {
        let owner = if !cluster.is_empty() {
            Some(self.find_cluster(cluster).await?.cluster)
        } else if !host.is_empty() {
            let h = self.find_host(host).await?;
            Some(h.cluster.unwrap_or(h.host))
        } else {
            None
        };

        let pools: Vec<ResourcePoolSummary> = self
            .resource_pools()
            .await?
            .into_iter()
            .filter(|p| owner.is_none() || p.owner == owner)
            .collect();

        let matches: Vec<&ResourcePoolSummary> = if name.is_empty() {
            pools.iter().filter(|p| p.root).collect()
        } else {
            pools
                .iter()
                .filter(|p| p.name == name || p.resource_pool == name)
                .collect()
        };

        match matches.as_slice() {
            [pool] => Ok((*pool).clone()),
            [] if name.is_empty() => Err(VsphereError::not_found("no root resource pool found")),
            [] => Err(VsphereError::not_found(format!("resource pool '{name}' not found"))),
            _ if name.is_empty() => Err(VsphereError::config(
                "a cluster or host is required to pick the default resource pool",
            )),
            _ => Err(VsphereError::ambiguous(format!(
                "resource pool '{name}' matches more than one pool; specify a cluster or host"
            ))),
        }
    }

    // ── Datastores ──────────────────────────────────────────────────

    /// Datastore by name. With an empty name the host's only datastore is used.
    pub async fn find_datastore(&self, name: &str, host: &str) -> VsphereResult<DatastoreSummary> {
        let all = self.datastores().await?;
        if !name.is_empty() {
            return all
                .into_iter()
                .find(|d| d.name == name || d.datastore == name)
                .ok_or_else(|| VsphereError::not_found(format!("datastore '{name}' not found")));
        }
        if host.is_empty() {
            return Err(VsphereError::config(
                "a datastore name is required when no host is specified",
            ));
        }
        let h = self.find_host(host).await?;
        let mounted: Vec<&DatastoreSummary> = all
            .iter()
            .filter(|d| h.datastores.contains(&d.datastore))
            .collect();
        match mounted.as_slice() {
            [ds] => Ok((*ds).clone()),
            [] => Err(VsphereError::not_found(format!("host '{host}' has no datastores"))),
            _ => Err(VsphereError::ambiguous("Host has multiple datastores. Specify it explicitly")),
        }
    }

    // ── Content libraries ───────────────────────────────────────────

    pub async fn find_content_library(&self, name: &str) -> VsphereResult<ContentLibrary> {
        self.libraries()
            .await?
            .into_iter()
            .find(|l| l.name == name || l.id == name)
            .ok_or_else(|| VsphereError::not_found(format!("content library '{name}' not found")))
    }

    pub async fn find_library_item(&self, library: &ContentLibrary, name: &str) -> VsphereResult<Option<LibraryItem>> {
        let items = self.platform.list_library_items(&library.id).await?;
        Ok(items.into_iter().find(|i| i.name == name || i.id == name))
    }

    /// Translate `library/item/file` into the datastore path backing it.
    pub async fn find_content_library_file_datastore_path(&self, path: &str) -> VsphereResult<String> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        let [lib_name, item_name, file_name] = parts.as_slice() else {
            return Err(VsphereError::config(format!(
                "'{path}' is not a content library file path; expected library/item/file"
            )));
        };
        let library = self.find_content_library(lib_name).await?;
        let item = self.find_library_item(&library, item_name).await?.ok_or_else(|| {
            VsphereError::not_found(format!("item '{item_name}' not found in library '{lib_name}'"))
        })?;
        if !item.files.iter().any(|f| f == file_name) {
            return Err(VsphereError::not_found(format!(
                "file '{file_name}' not found in library item '{item_name}'"
            )));
        }
        let ds_id = library.datastore.as_deref().ok_or_else(|| {
            VsphereError::not_found(format!("content library '{lib_name}' has no backing datastore"))
        })?;
        let ds = self.find_datastore(ds_id, "").await?;
        Ok(format!("[{}] contentlib-{}/{}/{}", ds.name, library.id, item.id, file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedPlatform;

    async fn lab() -> (Arc<SimulatedPlatform>, Arc<Session>) {
        let sim = Arc::new(SimulatedPlatform::lab());
        let session = Session::open(sim.clone(), "dc1", CancellationToken::new()).await.unwrap();
        (sim, session)
    }

    #[tokio::test]
    async fn open_picks_single_datacenter() {
        let sim = Arc::new(SimulatedPlatform::lab());
        let session = Session::open(sim, "", CancellationToken::new()).await.unwrap();
        assert_eq!(session.datacenter().name, "dc1");
    }

    #[tokio::test]
    async fn open_unknown_datacenter() {
        let sim = Arc::new(SimulatedPlatform::lab());
        let err = Session::open(sim, "dc9", CancellationToken::new()).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn find_vm_by_name_and_path() {
        let (sim, session) = lab().await;
        let id = sim.vm_id("ubuntu-template").unwrap();
        assert_eq!(session.find_vm("ubuntu-template").await.unwrap().id(), id);
        assert_eq!(session.find_vm("templates/ubuntu-template").await.unwrap().id(), id);
        assert!(session.find_vm("other/ubuntu-template").await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn inventory_is_cached() {
        let (sim, session) = lab().await;
        session.find_host("esxi-01").await.unwrap();
        session.find_host("esxi-02").await.unwrap();
        let lists = sim.calls().iter().filter(|c| c.starts_with("list_hosts")).count();
        assert_eq!(lists, 1);
    }

    #[tokio::test]
    async fn folders() {
        let (_, session) = lab().await;
        assert_eq!(session.find_folder("").await.unwrap().name, "vm");
        assert_eq!(session.find_folder("/templates/").await.unwrap().name, "templates");
        assert!(session.find_folder("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn resource_pools() {
        let (_, session) = lab().await;
        assert_eq!(session.find_resource_pool("cluster1", "", "").await.unwrap().name, "Resources");
        assert_eq!(session.find_resource_pool("", "esxi-01", "pool-a").await.unwrap().name, "pool-a");
        assert_eq!(
            session.find_resource_pool("", "esxi-solo", "").await.unwrap().resource_pool,
            "resgroup-3"
        );
        let err = session.find_resource_pool("", "", "").await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::Configuration);
    }

    #[tokio::test]
    async fn datastore_defaults_to_host_single() {
        let (_, session) = lab().await;
        assert_eq!(session.find_datastore("", "esxi-solo").await.unwrap().name, "solo-ds");
        assert_eq!(session.find_datastore("datastore1", "").await.unwrap().datastore, "datastore-1");
    }

    #[tokio::test]
    async fn datastore_ambiguous_host() {
        let sim = Arc::new(SimulatedPlatform::lab());
        sim.mount_datastore("esxi-01", "datastore-2");
        let session = Session::open(sim, "dc1", CancellationToken::new()).await.unwrap();
        let err = session.find_datastore("", "esxi-01").await.unwrap_err();
        assert_eq!(err.message, "Host has multiple datastores. Specify it explicitly");
    }

    #[tokio::test]
    async fn content_library_file_path() {
        let (_, session) = lab().await;
        let path = session
            .find_content_library_file_datastore_path("lib-local/ubuntu-iso/ubuntu.iso")
            .await
            .unwrap();
        assert_eq!(path, "[datastore1] contentlib-lib-1/item-1/ubuntu.iso");

        let err = session
            .find_content_library_file_datastore_path("[datastore1] iso/ubuntu.iso")
            .await
            .unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::Configuration);
    }

    #[tokio::test]
    async fn pre_clean_without_force() {
        let (_, session) = lab().await;
        let err = session.pre_clean_vm("ubuntu-template", false).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::AlreadyExists);
        assert_eq!(
            err.message,
            "ubuntu-template already exists, you can use -force flag to destroy it"
        );
        session.pre_clean_vm("missing-vm", false).await.unwrap();
    }

    #[tokio::test]
    async fn pre_clean_with_force_destroys() {
        let (sim, session) = lab().await;
        sim.set_power_state("bare-template", VmPowerState::PoweredOn);
        session.pre_clean_vm("bare-template", true).await.unwrap();
        assert!(sim.vm_id("bare-template").is_none());
        let calls = sim.calls();
        let off = calls.iter().position(|c| c.starts_with("power_off_vm")).unwrap();
        let destroy = calls.iter().position(|c| c.starts_with("destroy_vm")).unwrap();
        assert!(off < destroy);
    }
}
