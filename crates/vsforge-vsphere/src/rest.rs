//! [`Platform`] over a live vCenter.
//!
//! Inventory listing, guest networking and content library imports use the
//! Automation API. Task-returning mutations, device-level VM properties and
//! inventory relationships the Automation API does not expose (host networks,
//! pool owners, folder parents) go through VI/JSON. Datastore files use the
//! `/folder` file-access endpoint.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tokio_util::io::ReaderStream;

use crate::customize::CustomizationSpec;
use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::platform::Platform;
use crate::types::*;
use crate::vim::{self, moref, moref_value};
use crate::vsphere::VsphereClient;

// ── Automation API payloads ─────────────────────────────────────────

#[derive(Deserialize)]
struct ApiVm {
    vm: String,
    name: String,
    #[serde(default)]
    power_state: VmPowerState,
}

#[derive(Deserialize)]
struct ApiHost {
    host: String,
    name: String,
}

#[derive(Deserialize)]
struct ApiNetwork {
    network: String,
    name: String,
    #[serde(rename = "type")]
    network_type: Option<String>,
}

#[derive(Deserialize)]
struct ApiResourcePool {
    resource_pool: String,
    name: String,
}

#[derive(Deserialize)]
struct ApiFolder {
    folder: String,
    name: String,
}

#[derive(Deserialize)]
struct ApiStorageBacking {
    datastore_id: Option<String>,
}

#[derive(Deserialize)]
struct ApiLibrary {
    id: String,
    name: String,
    #[serde(rename = "type")]
    lib_type: Option<String>,
    #[serde(default)]
    storage_backings: Vec<ApiStorageBacking>,
}

#[derive(Deserialize)]
struct ApiLibraryItem {
    id: String,
    name: String,
    library_id: Option<String>,
    #[serde(rename = "type")]
    item_type: Option<String>,
}

#[derive(Deserialize)]
struct ApiItemFile {
    name: String,
}

#[derive(Deserialize)]
struct ApiIpAddress {
    ip_address: String,
}

#[derive(Deserialize)]
struct ApiIpConfig {
    #[serde(default)]
    ip_addresses: Vec<ApiIpAddress>,
}

#[derive(Deserialize)]
struct ApiGuestNic {
    ip: Option<ApiIpConfig>,
}

#[derive(Deserialize)]
struct ApiOvfResult {
    succeeded: bool,
    ovf_library_item_id: Option<String>,
    error: Option<Value>,
}

pub struct RestPlatform {
    client: VsphereClient,
    /// Distributed portgroup id -> switch UUID, needed to encode port backings.
    switch_uuids: Mutex<HashMap<String, String>>,
}

impl RestPlatform {
    /// Log in to the endpoint described by `config`.
    pub async fn connect(config: &VsphereConfig) -> VsphereResult<Self> {
        let mut client = VsphereClient::new(config)?;
        client
            .login()
            .await
            .map_err(|e| e.context("connect", &config.host))?;
        log::info!("connected to {}", config.host);
        Ok(Self {
            client,
            switch_uuids: Mutex::new(HashMap::new()),
        })
    }

    async fn vim_get(&self, kind: &str, moid: &str, member: &str) -> VsphereResult<Value> {
        self.client.get(&VsphereClient::vim_path(kind, moid, member)).await
    }

    async fn vim_refs(&self, kind: &str, moid: &str, member: &str) -> VsphereResult<Vec<String>> {
        let value = self.vim_get(kind, moid, member).await?;
        Ok(value
            .as_array()
            .map(|refs| refs.iter().filter_map(moref_value).collect())
            .unwrap_or_default())
    }

    async fn vim_task(&self, kind: &str, moid: &str, method: &str, body: &Value) -> VsphereResult<TaskRef> {
        let value: Value = self.client.post(&VsphereClient::vim_path(kind, moid, method), body).await?;
        moref_value(&value)
            .map(TaskRef)
            .ok_or_else(|| VsphereError::parse(format!("{method} did not return a task: {value}")))
    }

    fn cached_switch_uuids(&self) -> HashMap<String, String> {
        self.switch_uuids.lock().map(|m| m.clone()).unwrap_or_default()
    }

    async fn switch_of(&self, portgroup: &str) -> VsphereResult<(String, String)> {
        let config = self.vim_get("DistributedVirtualPortgroup", portgroup, "config").await?;
        let switch = config
            .get("distributedVirtualSwitch")
            .and_then(moref_value)
            .ok_or_else(|| VsphereError::parse(format!("portgroup {portgroup} has no switch")))?;
        let name = self.vim_get("DistributedVirtualSwitch", &switch, "name").await?;
        let uuid = self.vim_get("DistributedVirtualSwitch", &switch, "uuid").await?;
        let uuid = uuid.as_str().unwrap_or_default().to_string();
        if let Ok(mut cache) = self.switch_uuids.lock() {
            cache.insert(portgroup.to_string(), uuid);
        }
        Ok((switch, name.as_str().unwrap_or_default().to_string()))
    }

    /// Look up switch UUIDs for every distributed portgroup the changes attach to.
    async fn prepare_backings(&self, changes: &[DeviceChange]) -> VsphereResult<HashMap<String, String>> {
        let known = self.cached_switch_uuids();
        let missing: HashSet<&str> = changes
            .iter()
            .filter_map(|c| match &c.device.kind {
                DeviceKind::Ethernet { network, .. } => Some(network.as_str()),
                _ => None,
            })
            .filter(|n| vim::network_kind(n) == "DistributedVirtualPortgroup" && !known.contains_key(*n))
            .collect();
        for portgroup in missing {
            self.switch_of(portgroup).await?;
        }
        Ok(self.cached_switch_uuids())
    }

    /// Folder id -> path relative to the datacenter VM folder.
    async fn folder_paths(&self, datacenter: &str) -> VsphereResult<Vec<FolderSummary>> {
        let folders: Vec<ApiFolder> = self
            .client
            .get_with_params(
                "/api/vcenter/folder",
                &[("datacenters", datacenter), ("type", "VIRTUAL_MACHINE")],
            )
            .await?;
        let parents = try_join_all(folders.iter().map(|f| self.vim_get("Folder", &f.folder, "parent"))).await?;

        let mut parent_of: HashMap<&str, Option<String>> = HashMap::new();
        for (f, parent) in folders.iter().zip(&parents) {
            let is_folder = parent.get("type").and_then(Value::as_str) == Some("Folder");
            parent_of.insert(f.folder.as_str(), if is_folder { moref_value(parent) } else { None });
        }
        let names: HashMap<&str, &str> = folders.iter().map(|f| (f.folder.as_str(), f.name.as_str())).collect();

        Ok(folders
            .iter()
            .map(|f| {
                let mut segments = Vec::new();
                let mut cursor = f.folder.clone();
                // the root VM folder has no folder parent and contributes no segment
                while let Some(Some(parent)) = parent_of.get(cursor.as_str()) {
                    segments.push(names.get(cursor.as_str()).copied().unwrap_or_default().to_string());
                    cursor = parent.clone();
                }
                segments.reverse();
                FolderSummary {
                    folder: f.folder.clone(),
                    name: f.name.clone(),
                    path: segments.join("/"),
                }
            })
            .collect())
    }

    async fn datacenter_id(&self, name: &str) -> VsphereResult<String> {
        self.list_datacenters()
            .await?
            .into_iter()
            .find(|dc| dc.name == name || dc.datacenter == name)
            .map(|dc| dc.datacenter)
            .ok_or_else(|| VsphereError::not_found(format!("datacenter '{name}' not found")))
    }
}

fn folder_params(file: &DatastoreFile) -> (String, [(&str, &str); 2]) {
    (
        format!("/folder/{}", file.path.trim_start_matches('/')),
        [("dcPath", file.datacenter.as_str()), ("dsName", file.datastore.as_str())],
    )
}

#[async_trait]
impl Platform for RestPlatform {
    // ── Inventory ───────────────────────────────────────────────────

    async fn list_datacenters(&self) -> VsphereResult<Vec<DatacenterSummary>> {
        self.client.get("/api/vcenter/datacenter").await
    }

    async fn list_vms(&self, datacenter: &str) -> VsphereResult<Vec<VmSummary>> {
        let folders = self.folder_paths(datacenter).await?;
        let per_folder = try_join_all(folders.iter().map(|f| async move {
            self.client
                .get_with_params::<Vec<ApiVm>>("/api/vcenter/vm", &[("folders", f.folder.as_str())])
                .await
        }))
        .await?;

        Ok(folders
            .iter()
            .zip(per_folder)
            .flat_map(|(folder, vms)| {
                vms.into_iter().map(move |vm| VmSummary {
                    vm: vm.vm,
                    name: vm.name,
                    power_state: vm.power_state,
                    folder: Some(folder.path.clone()),
                })
            })
            .collect())
    }

    async fn list_hosts(&self, datacenter: &str) -> VsphereResult<Vec<HostSummary>> {
        let hosts: Vec<ApiHost> = self
            .client
            .get_with_params("/api/vcenter/host", &[("datacenters", datacenter)])
            .await?;
        let clusters = self.list_clusters(datacenter).await?;

        let mut cluster_of: HashMap<String, String> = HashMap::new();
        for cluster in &clusters {
            let members: Vec<ApiHost> = self
                .client
                .get_with_params("/api/vcenter/host", &[("clusters", cluster.cluster.as_str())])
                .await?;
            for m in members {
                cluster_of.insert(m.host, cluster.cluster.clone());
            }
        }

        try_join_all(hosts.into_iter().map(|h| {
            let cluster = cluster_of.get(&h.host).cloned();
            async move {
                let networks = self.vim_refs("HostSystem", &h.host, "network").await?;
                let datastores = self.vim_refs("HostSystem", &h.host, "datastore").await?;
                Ok::<_, VsphereError>(HostSummary {
                    host: h.host,
                    name: h.name,
                    cluster,
                    networks,
                    datastores,
                })
            }
        }))
        .await
    }

    async fn list_networks(&self, datacenter: &str) -> VsphereResult<Vec<NetworkSummary>> {
        let networks: Vec<ApiNetwork> = self
            .client
            .get_with_params("/api/vcenter/network", &[("datacenters", datacenter)])
            .await?;

        try_join_all(networks.into_iter().map(|n| async move {
            let kind = vim::network_kind(&n.network);
            let hosts = self.vim_refs(kind, &n.network, "host").await?;
            let path = if kind == "DistributedVirtualPortgroup" {
                let (_, switch) = self.switch_of(&n.network).await?;
                format!("{switch}/{}", n.name)
            } else {
                n.name.clone()
            };
            Ok::<_, VsphereError>(NetworkSummary {
                network: n.network,
                name: n.name,
                path: Some(path),
                network_type: n.network_type,
                hosts,
            })
        }))
        .await
    }

    async fn list_datastores(&self, datacenter: &str) -> VsphereResult<Vec<DatastoreSummary>> {
        self.client
            .get_with_params("/api/vcenter/datastore", &[("datacenters", datacenter)])
            .await
    }

    async fn list_resource_pools(&self, datacenter: &str) -> VsphereResult<Vec<ResourcePoolSummary>> {
        let pools: Vec<ApiResourcePool> = self
            .client
            .get_with_params("/api/vcenter/resource-pool", &[("datacenters", datacenter)])
            .await?;

        try_join_all(pools.into_iter().map(|p| async move {
            let owner_ref = self.vim_get("ResourcePool", &p.resource_pool, "owner").await?;
            let parent = self.vim_get("ResourcePool", &p.resource_pool, "parent").await?;
            // standalone hosts own their pools through a ComputeResource; report the host
            let owner = match (owner_ref.get("type").and_then(Value::as_str), moref_value(&owner_ref)) {
                (Some("ComputeResource"), Some(id)) => {
                    self.vim_refs("ComputeResource", &id, "host").await?.into_iter().next()
                }
                (_, id) => id,
            };
            Ok::<_, VsphereError>(ResourcePoolSummary {
                resource_pool: p.resource_pool,
                name: p.name,
                owner,
                root: parent.get("type").and_then(Value::as_str) != Some("ResourcePool"),
            })
        }))
        .await
    }

    async fn list_folders(&self, datacenter: &str) -> VsphereResult<Vec<FolderSummary>> {
        self.folder_paths(datacenter).await
    }

    async fn list_clusters(&self, datacenter: &str) -> VsphereResult<Vec<ClusterSummary>> {
        self.client
            .get_with_params("/api/vcenter/cluster", &[("datacenters", datacenter)])
            .await
    }

    async fn list_libraries(&self) -> VsphereResult<Vec<ContentLibrary>> {
        let ids: Vec<String> = self.client.get("/api/content/library").await?;
        try_join_all(ids.iter().map(|id| async move {
            let lib: ApiLibrary = self.client.get(&format!("/api/content/library/{id}")).await?;
            Ok::<_, VsphereError>(ContentLibrary {
                id: lib.id,
                name: lib.name,
                lib_type: lib.lib_type,
                datastore: lib.storage_backings.into_iter().find_map(|b| b.datastore_id),
            })
        }))
        .await
    }

    async fn list_library_items(&self, library_id: &str) -> VsphereResult<Vec<LibraryItem>> {
        let ids: Vec<String> = self
            .client
            .get_with_params("/api/content/library/item", &[("library_id", library_id)])
            .await?;
        try_join_all(ids.iter().map(|id| async move {
            let item: ApiLibraryItem = self.client.get(&format!("/api/content/library/item/{id}")).await?;
            let files: Vec<ApiItemFile> = self.client.get(&format!("/api/content/library/item/{id}/file")).await?;
            Ok::<_, VsphereError>(LibraryItem {
                id: item.id,
                name: item.name,
                library_id: item.library_id,
                item_type: item.item_type,
                files: files.into_iter().map(|f| f.name).collect(),
            })
        }))
        .await
    }

    // ── VM state ────────────────────────────────────────────────────

    async fn vm_properties(&self, vm: &str) -> VsphereResult<VmProperties> {
        let (config, runtime, snapshot, layout) = tokio::try_join!(
            self.vim_get("VirtualMachine", vm, "config"),
            self.vim_get("VirtualMachine", vm, "runtime"),
            self.vim_get("VirtualMachine", vm, "snapshot"),
            self.vim_get("VirtualMachine", vm, "layoutEx"),
        )?;
        Ok(vim::decode_vm_properties(&config, &runtime, &snapshot, &layout))
    }

    async fn guest_ip_addresses(&self, vm: &str) -> VsphereResult<Vec<String>> {
        let path = format!("/api/vcenter/vm/{vm}/guest/networking/interfaces");
        let nics: Vec<ApiGuestNic> = match self.client.get(&path).await {
            Ok(nics) => nics,
            // guest tools not running yet
            Err(e) if e.kind == VsphereErrorKind::ApiError(503) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(nics
            .into_iter()
            .filter_map(|n| n.ip)
            .flat_map(|ip| ip.ip_addresses.into_iter().map(|a| a.ip_address))
            .collect())
    }

    // ── Task-returning mutations ────────────────────────────────────

    async fn clone_vm(&self, spec: &CloneSpec) -> VsphereResult<TaskRef> {
        let uuids = self.prepare_backings(&spec.config.device_change).await?;
        let body = vim::encode_clone(spec, &uuids)?;
        log::info!("cloning {} to '{}'", spec.source, spec.name);
        self.vim_task("VirtualMachine", &spec.source, "CloneVM_Task", &body).await
    }

    async fn create_vm(&self, spec: &CreateSpec) -> VsphereResult<TaskRef> {
        let uuids = self.prepare_backings(&spec.config.device_change).await?;
        let body = vim::encode_create(spec, &uuids)?;
        log::info!("creating '{}' in {}", spec.config.name.as_deref().unwrap_or_default(), spec.folder);
        self.vim_task("Folder", &spec.folder, "CreateVM_Task", &body).await
    }

    async fn reconfigure_vm(&self, vm: &str, spec: &VmConfigSpec) -> VsphereResult<TaskRef> {
        let uuids = self.prepare_backings(&spec.device_change).await?;
        let body = json!({ "spec": vim::encode_config_spec(spec, &uuids)? });
        self.vim_task("VirtualMachine", vm, "ReconfigVM_Task", &body).await
    }

    async fn customize_vm(&self, vm: &str, spec: &CustomizationSpec) -> VsphereResult<TaskRef> {
        let body = json!({ "spec": vim::encode_customization(spec) });
        self.vim_task("VirtualMachine", vm, "CustomizeVM_Task", &body).await
    }

    async fn power_on_vm(&self, vm: &str) -> VsphereResult<TaskRef> {
        self.vim_task("VirtualMachine", vm, "PowerOnVM_Task", &json!({})).await
    }

    async fn power_off_vm(&self, vm: &str) -> VsphereResult<TaskRef> {
        self.vim_task("VirtualMachine", vm, "PowerOffVM_Task", &json!({})).await
    }

    async fn destroy_vm(&self, vm: &str) -> VsphereResult<TaskRef> {
        self.vim_task("VirtualMachine", vm, "Destroy_Task", &json!({})).await
    }

    async fn create_snapshot(&self, vm: &str, spec: &SnapshotSpec) -> VsphereResult<TaskRef> {
        let body = json!({
            "name": spec.name,
            "description": spec.description,
            "memory": spec.memory,
            "quiesce": spec.quiesce,
        });
        self.vim_task("VirtualMachine", vm, "CreateSnapshot_Task", &body).await
    }

    // ── Immediate mutations ─────────────────────────────────────────

    async fn shutdown_guest(&self, vm: &str) -> VsphereResult<()> {
        self.client
            .post_empty(&VsphereClient::vim_path("VirtualMachine", vm, "ShutdownGuest"))
            .await
    }

    async fn mark_as_template(&self, vm: &str) -> VsphereResult<()> {
        self.client
            .post_empty(&VsphereClient::vim_path("VirtualMachine", vm, "MarkAsTemplate"))
            .await
    }

    async fn create_ovf_library_item(&self, spec: &OvfLibraryItemSpec) -> VsphereResult<String> {
        let target = match &spec.library_item_id {
            Some(item) => json!({ "library_item_id": item }),
            None => json!({ "library_id": spec.library_id }),
        };
        let body = json!({
            "source": { "type": "VirtualMachine", "id": spec.source_vm },
            "target": target,
            "create_spec": {
                "name": spec.name,
                "description": spec.description,
                "flags": spec.flags,
            },
        });
        let result: ApiOvfResult = self
            .client
            .post("/api/vcenter/ovf/library-item?action=create", &body)
            .await?;
        match (result.succeeded, result.ovf_library_item_id) {
            (true, Some(id)) => Ok(id),
            _ => Err(VsphereError::task(format!(
                "OVF export failed: {}",
                result.error.map(|e| e.to_string()).unwrap_or_default()
            ))),
        }
    }

    async fn create_template_library_item(&self, spec: &VmTemplateLibrarySpec) -> VsphereResult<String> {
        let mut body = json!({
            "source_vm": spec.source_vm,
            "library": spec.library_id,
            "name": spec.name,
            "description": spec.description,
            "placement": spec.placement,
        });
        if let Some(ds) = &spec.vm_home_datastore {
            body["vm_home_storage"] = json!({ "datastore": ds });
        }
        self.client.post("/api/vcenter/vm-template/library-items", &body).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn task_info(&self, task: &TaskRef) -> VsphereResult<TaskInfo> {
        let info = self.vim_get("Task", &task.0, "info").await?;
        Ok(vim::decode_task_info(task, &info))
    }

    async fn cancel_task(&self, task: &TaskRef) -> VsphereResult<()> {
        self.client
            .post_empty(&VsphereClient::vim_path("Task", &task.0, "CancelTask"))
            .await
    }

    // ── Datastore files ─────────────────────────────────────────────

    async fn upload_file(&self, dst: &DatastoreFile, src: &Path, host: Option<&str>) -> VsphereResult<()> {
        let file = tokio::fs::File::open(src).await?;
        let len = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let (path, params) = folder_params(dst);
        log::info!("uploading {} ({len} bytes) to {dst}", src.display());
        self.client.put_stream(host, &path, &params, len, body).await
    }

    async fn delete_file(&self, file: &DatastoreFile) -> VsphereResult<()> {
        let (path, params) = folder_params(file);
        self.client.delete_with_params(&path, &params).await
    }

    async fn file_exists(&self, file: &DatastoreFile) -> VsphereResult<bool> {
        let (path, params) = folder_params(file);
        let status = self.client.head_status(&path, &params).await?;
        match status.as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            code => Err(VsphereError::api(code, format!("checking {file} failed with status {code}"))),
        }
    }

    async fn make_directory(&self, dir: &DatastoreFile) -> VsphereResult<()> {
        let datacenter = self.datacenter_id(&dir.datacenter).await?;
        let body = json!({
            "name": dir.to_string(),
            "datacenter": moref("Datacenter", &datacenter),
            "createParentDirectories": true,
        });
        self.client
            .post_raw(&VsphereClient::vim_path("FileManager", "FileManager", "MakeDirectory"), &body)
            .await?;
        Ok(())
    }

    async fn logout(&self) -> VsphereResult<()> {
        self.client.logout().await
    }
}
