//! Abstraction over the virtualization platform endpoint.
//!
//! Everything the driver needs from vCenter goes through [`Platform`]:
//! inventory listing, property reads, task-returning mutations, task polling
//! and datastore file transfer. [`crate::rest::RestPlatform`] talks to a real
//! endpoint; the simulator implements the same trait in memory.

use async_trait::async_trait;
use std::path::Path;

use crate::customize::CustomizationSpec;
use crate::error::VsphereResult;
use crate::types::*;

#[async_trait]
pub trait Platform: Send + Sync {
    // ── Inventory ───────────────────────────────────────────────────

    async fn list_datacenters(&self) -> VsphereResult<Vec<DatacenterSummary>>;
    async fn list_vms(&self, datacenter: &str) -> VsphereResult<Vec<VmSummary>>;
    async fn list_hosts(&self, datacenter: &str) -> VsphereResult<Vec<HostSummary>>;
    async fn list_networks(&self, datacenter: &str) -> VsphereResult<Vec<NetworkSummary>>;
    async fn list_datastores(&self, datacenter: &str) -> VsphereResult<Vec<DatastoreSummary>>;
    async fn list_resource_pools(&self, datacenter: &str) -> VsphereResult<Vec<ResourcePoolSummary>>;
    async fn list_folders(&self, datacenter: &str) -> VsphereResult<Vec<FolderSummary>>;
    async fn list_clusters(&self, datacenter: &str) -> VsphereResult<Vec<ClusterSummary>>;
    async fn list_libraries(&self) -> VsphereResult<Vec<ContentLibrary>>;
    async fn list_library_items(&self, library_id: &str) -> VsphereResult<Vec<LibraryItem>>;

    // ── VM state ────────────────────────────────────────────────────

    async fn vm_properties(&self, vm: &str) -> VsphereResult<VmProperties>;
    /// Addresses currently reported by guest tools, in adapter order.
    async fn guest_ip_addresses(&self, vm: &str) -> VsphereResult<Vec<String>>;

    // ── Task-returning mutations ────────────────────────────────────

    async fn clone_vm(&self, spec: &CloneSpec) -> VsphereResult<TaskRef>;
    async fn create_vm(&self, spec: &CreateSpec) -> VsphereResult<TaskRef>;
    async fn reconfigure_vm(&self, vm: &str, spec: &VmConfigSpec) -> VsphereResult<TaskRef>;
    async fn customize_vm(&self, vm: &str, spec: &CustomizationSpec) -> VsphereResult<TaskRef>;
    async fn power_on_vm(&self, vm: &str) -> VsphereResult<TaskRef>;
    async fn power_off_vm(&self, vm: &str) -> VsphereResult<TaskRef>;
    async fn destroy_vm(&self, vm: &str) -> VsphereResult<TaskRef>;
    async fn create_snapshot(&self, vm: &str, spec: &SnapshotSpec) -> VsphereResult<TaskRef>;

    // ── Immediate mutations ─────────────────────────────────────────

    /// Ask guest tools for a clean shutdown; returns once the request is accepted.
    async fn shutdown_guest(&self, vm: &str) -> VsphereResult<()>;
    async fn mark_as_template(&self, vm: &str) -> VsphereResult<()>;
    /// Returns the library item ID.
    async fn create_ovf_library_item(&self, spec: &OvfLibraryItemSpec) -> VsphereResult<String>;
    /// Returns the library item ID.
    async fn create_template_library_item(&self, spec: &VmTemplateLibrarySpec) -> VsphereResult<String>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn task_info(&self, task: &TaskRef) -> VsphereResult<TaskInfo>;
    async fn cancel_task(&self, task: &TaskRef) -> VsphereResult<()>;

    // ── Datastore files ─────────────────────────────────────────────

    /// Upload a local file. `host` pins the transfer to an ESXi host's datastore service.
    async fn upload_file(&self, dst: &DatastoreFile, src: &Path, host: Option<&str>) -> VsphereResult<()>;
    async fn delete_file(&self, file: &DatastoreFile) -> VsphereResult<()>;
    async fn file_exists(&self, file: &DatastoreFile) -> VsphereResult<bool>;
    async fn make_directory(&self, dir: &DatastoreFile) -> VsphereResult<()>;

    /// Release the platform session. Default is a no-op.
    async fn logout(&self) -> VsphereResult<()> {
        Ok(())
    }
}
