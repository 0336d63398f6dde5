//! Build configuration.
//!
//! A build is described by one JSON document. [`BuildConfig::prepare`] fills
//! in defaults and checks every section before any remote call is made,
//! reporting all problems at once rather than stopping at the first.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use vsforge_vsphere::cdrom::{CdromControllerType, DatastorePath};
use vsforge_vsphere::customize::{GlobalDns, GlobalGateways, NetworkInterfaceCustomization};
use vsforge_vsphere::devices::{validate_disks, DiskSpec, NicSpec};
use vsforge_vsphere::ipwait::IpWaitPolicy;
use vsforge_vsphere::net::Cidr;
use vsforge_vsphere::types::{AdapterType, ToolsConfig, VsphereConfig};
use vsforge_vsphere::vm::HardwareSpec;

use crate::error::{BuildError, BuildResult};

const DEFAULT_CONTROLLER: &str = "lsilogic";
const DEFAULT_SNAPSHOT_NAME: &str = "Created by vsforge";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the new VM lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationConfig {
    pub vm_name: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub resource_pool: String,
    #[serde(default)]
    pub datastore: String,
    /// Route datastore uploads straight to `host` instead of through vCenter.
    #[serde(default)]
    pub set_host_for_datastore_uploads: bool,
}

impl LocationConfig {
    /// `folder/vm_name`, or just the name when no folder is set.
    pub fn vm_path(&self) -> String {
        if self.folder.is_empty() {
            self.vm_name.clone()
        } else {
            format!("{}/{}", self.folder.trim_end_matches('/'), self.vm_name)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VAppConfig {
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneConfig {
    #[serde(default)]
    pub template: String,
    /// New size of the template's single disk, in MiB.
    #[serde(default)]
    pub disk_size: i64,
    #[serde(default)]
    pub linked_clone: bool,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub vapp: VAppConfig,
    /// Published to the guest through the `public-keys` vApp property.
    #[serde(default)]
    pub public_keys: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConfig {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub guest_os_type: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub usb_controller: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub disk_controller_type: Vec<String>,
    #[serde(default)]
    pub storage: Vec<DiskSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdromConfig {
    /// "ide" (default) or "sata"
    #[serde(default)]
    pub cdrom_type: String,
    /// ISOs already on a datastore (`[datastore] path`) or in a content
    /// library (`library/item/file`).
    #[serde(default)]
    pub iso_paths: Vec<String>,
    /// Local ISOs uploaded to the datastore cache before they are attached.
    #[serde(default)]
    pub iso_files: Vec<PathBuf>,
    /// Detach every CD-ROM drive once the guest is shut down.
    #[serde(default)]
    pub remove_cdrom: bool,
}

impl CdromConfig {
    pub fn controller(&self) -> CdromControllerType {
        self.cdrom_type.parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloppyConfig {
    /// Image already on a datastore.
    #[serde(default)]
    pub floppy_img_path: String,
    /// Local image uploaded into the VM directory.
    #[serde(default)]
    pub floppy_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinuxOptions {
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub hw_clock_utc: Option<bool>,
    #[serde(default)]
    pub time_zone: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomizeConfig {
    #[serde(default)]
    pub linux_options: Option<LinuxOptions>,
    /// Local unattend answer file sent verbatim.
    #[serde(default)]
    pub windows_sysprep_file: String,
    #[serde(default)]
    pub network_interface: Vec<NetworkInterfaceCustomization>,
    #[serde(flatten)]
    pub gateways: GlobalGateways,
    #[serde(flatten)]
    pub dns: GlobalDns,
}

impl CustomizeConfig {
    fn prepare(&mut self) -> Vec<String> {
        let mut errs = Vec::new();

        if self.linux_options.is_none() && self.windows_sysprep_file.is_empty() {
            errs.push("customize is empty".to_string());
        }
        if self.linux_options.is_some() && !self.windows_sysprep_file.is_empty() {
            errs.push(
                "`linux_options` and `windows_sysprep_file` both set - one must not be included if the other is specified"
                    .to_string(),
            );
        }

        if let Some(linux) = self.linux_options.as_mut() {
            if linux.host_name.is_empty() {
                errs.push("linux options `host_name` is empty".to_string());
            }
            if linux.domain.is_empty() {
                errs.push("linux options `domain` is empty".to_string());
            }
            linux.hw_clock_utc.get_or_insert(true);
            if linux.time_zone.is_empty() {
                linux.time_zone = "UTC".to_string();
            }
        }

        if self.network_interface.is_empty() {
            errs.push("one or more `network_interface` must be provided".to_string());
        }
        errs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitIpConfig {
    #[serde(default = "default_ip_wait_timeout")]
    pub ip_wait_timeout: String,
    #[serde(default = "default_ip_settle_timeout")]
    pub ip_settle_timeout: String,
    /// Only accept guest addresses inside this network.
    #[serde(default)]
    pub ip_wait_address: Option<String>,
}

fn default_ip_wait_timeout() -> String {
    "30m".into()
}

fn default_ip_settle_timeout() -> String {
    "5s".into()
}

impl Default for WaitIpConfig {
    fn default() -> Self {
        Self {
            ip_wait_timeout: default_ip_wait_timeout(),
            ip_settle_timeout: default_ip_settle_timeout(),
            ip_wait_address: None,
        }
    }
}

impl WaitIpConfig {
    pub fn policy(&self) -> Result<IpWaitPolicy, Vec<String>> {
        let mut errs = Vec::new();
        let total_timeout = parse_duration(&self.ip_wait_timeout)
            .map_err(|e| errs.push(format!("'ip_wait_timeout': {e}")))
            .ok();
        let settle_timeout = parse_duration(&self.ip_settle_timeout)
            .map_err(|e| errs.push(format!("'ip_settle_timeout': {e}")))
            .ok();
        let allowed = match self.ip_wait_address.as_deref() {
            None | Some("") => None,
            Some(addr) => addr
                .parse::<Cidr>()
                .map_err(|e| errs.push(format!("'ip_wait_address': {}", e.message)))
                .ok(),
        };
        match (total_timeout, settle_timeout) {
            (Some(total_timeout), Some(settle_timeout)) if errs.is_empty() => Ok(IpWaitPolicy {
                settle_timeout,
                total_timeout,
                allowed,
            }),
            _ => Err(errs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
    /// Wait for the guest to power itself off instead of asking tools.
    #[serde(default)]
    pub disable_shutdown: bool,
}

fn default_shutdown_timeout() -> String {
    "5m".into()
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: default_shutdown_timeout(),
            disable_shutdown: false,
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Result<Duration, String> {
        parse_duration(&self.shutdown_timeout).map_err(|e| format!("'shutdown_timeout': {e}"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentLibraryConfig {
    #[serde(default)]
    pub library: String,
    /// Item name; defaults to the VM name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Import as an OVF template instead of a VM template.
    #[serde(default)]
    pub ovf: bool,
    #[serde(default)]
    pub ovf_flags: Vec<String>,
    /// Delete the VM once it has been imported.
    #[serde(default)]
    pub destroy: bool,
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

impl ContentLibraryConfig {
    fn prepare(&mut self, vm_name: &str) -> Vec<String> {
        let mut errs = Vec::new();
        if self.library.is_empty() {
            errs.push("content_library_destination: 'library' is required".to_string());
        }
        if self.name.is_empty() {
            self.name = vm_name.to_string();
        }
        let placement = [&self.cluster, &self.folder, &self.host, &self.resource_pool, &self.datastore];
        if self.ovf && placement.iter().any(|p| !p.is_empty()) {
            errs.push("content_library_destination: placement settings cannot be used with 'ovf'".to_string());
        }
        if !self.ovf && !self.ovf_flags.is_empty() {
            errs.push("content_library_destination: 'ovf_flags' requires 'ovf'".to_string());
        }
        errs
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  BuildConfig
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub connection: VsphereConfig,
    pub location: LocationConfig,

    #[serde(default)]
    pub clone: Option<CloneConfig>,
    #[serde(default)]
    pub create: Option<CreateConfig>,

    #[serde(default)]
    pub hardware: HardwareSpec,
    #[serde(flatten)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network_adapters: Vec<NicSpec>,
    #[serde(default)]
    pub cdrom: CdromConfig,
    #[serde(default)]
    pub floppy: FloppyConfig,
    #[serde(default)]
    pub customize: Option<CustomizeConfig>,

    #[serde(default)]
    pub configuration_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub tools_sync_time: bool,
    /// Upgrade VMware Tools on the next power cycle.
    #[serde(default)]
    pub tools_upgrade_policy: bool,
    #[serde(default)]
    pub boot_order: Vec<String>,

    #[serde(default)]
    pub wait_ip: WaitIpConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub create_snapshot: bool,
    #[serde(default)]
    pub snapshot_name: String,
    #[serde(default)]
    pub convert_to_template: bool,
    #[serde(default)]
    pub content_library_destination: Option<ContentLibraryConfig>,

    /// Replace an existing VM with the same name.
    #[serde(default)]
    pub force: bool,
    /// Delete the VM once the build finishes.
    #[serde(default)]
    pub destroy: bool,
    #[serde(default)]
    pub output_directory: Option<PathBuf>,
    /// Address of an HTTP server the guest fetches boot files from.
    #[serde(default)]
    pub http_addr: Option<String>,
}

impl BuildConfig {
    pub fn from_json(text: &str) -> BuildResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> BuildResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn is_clone(&self) -> bool {
        self.clone.is_some()
    }

    /// Tools settings, if any were requested.
    pub fn tools(&self) -> Option<ToolsConfig> {
        if !self.tools_sync_time && !self.tools_upgrade_policy {
            return None;
        }
        Some(ToolsConfig {
            sync_time_with_host: self.tools_sync_time.then_some(true),
            tools_upgrade_policy: self.tools_upgrade_policy.then(|| "upgradeAtPowerCycle".to_string()),
        })
    }

    /// Fill in defaults and validate. Fails with every problem found.
    pub fn prepare(&mut self) -> BuildResult<()> {
        let mut errs = Vec::new();

        if self.connection.host.is_empty() {
            errs.push("'vcenter_server' is required".to_string());
        }
        if self.connection.username.is_empty() {
            errs.push("'username' is required".to_string());
        }
        if self.connection.password.is_empty() {
            errs.push("'password' is required".to_string());
        }
        if self.location.vm_name.is_empty() {
            errs.push("'vm_name' is required".to_string());
        }
        if self.location.set_host_for_datastore_uploads && self.location.host.is_empty() {
            errs.push("'host' is required when 'set_host_for_datastore_uploads' is set".to_string());
        }

        if !self.storage.storage.is_empty() && self.storage.disk_controller_type.is_empty() {
            self.storage.disk_controller_type.push(DEFAULT_CONTROLLER.to_string());
        }
        errs.extend(
            validate_disks(self.storage.disk_controller_type.len(), &self.storage.storage)
                .into_iter()
                .map(|e| e.message),
        );
        for name in &self.storage.disk_controller_type {
            if let Err(e) = name.parse::<vsforge_vsphere::types::DiskControllerType>() {
                errs.push(e.message);
            }
        }

        match (&self.clone, &self.create) {
            (Some(clone), None) => errs.extend(prepare_clone(clone)),
            (None, Some(create)) => errs.extend(self.prepare_create(create)),
            _ => errs.push("exactly one of 'clone' or 'create' must be set".to_string()),
        }

        errs.extend(self.hardware.validate().into_iter().map(|e| e.message));

        if let Some(customize) = self.customize.as_mut() {
            if self.create.is_some() {
                errs.push("'customize' can only be used when cloning".to_string());
            }
            errs.extend(customize.prepare());
        }

        if let Err(e) = self.wait_ip.policy() {
            errs.extend(e);
        }
        if let Err(e) = self.shutdown.timeout() {
            errs.push(e);
        }

        if let Err(e) = self.cdrom.cdrom_type.parse::<CdromControllerType>() {
            errs.push(e.message);
        }
        for (i, path) in self.cdrom.iso_paths.iter().enumerate() {
            if !is_iso_reference(path) {
                errs.push(format!("iso_paths[{i}]: {path} is not a valid iso path"));
            }
        }

        if self.create_snapshot && self.snapshot_name.is_empty() {
            self.snapshot_name = DEFAULT_SNAPSHOT_NAME.to_string();
        }
        if let Some(lib) = self.content_library_destination.as_mut() {
            errs.extend(lib.prepare(&self.location.vm_name));
            if !lib.ovf && self.convert_to_template {
                errs.push("'convert_to_template' cannot be used with a VM template content library destination".to_string());
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Config(errs))
        }
    }

    fn prepare_create(&self, create: &CreateConfig) -> Vec<String> {
        let mut errs = Vec::new();
        if self.storage.storage.is_empty() {
            errs.push("no storage devices have been defined".to_string());
        }
        if self.network_adapters.is_empty() {
            errs.push("at least one network adapter must be defined".to_string());
        }
        for (i, nic) in self.network_adapters.iter().enumerate() {
            if let Err(e) = nic.network_card.parse::<AdapterType>() {
                errs.push(format!("network_adapters[{i}]: {}", e.message));
            }
        }

        let (mut usb, mut xhci) = (0, 0);
        for (i, kind) in create.usb_controller.iter().enumerate() {
            match kind.as_str() {
                "usb" | "true" | "1" => usb += 1,
                "xhci" => xhci += 1,
                "false" | "0" => {}
                _ => errs.push(format!("usb_controller[{i}] references an unknown usb controller")),
            }
        }
        if usb > 1 || xhci > 1 {
            errs.push("there can only be one usb controller and one xhci controller".to_string());
        }
        errs
    }
}

fn prepare_clone(clone: &CloneConfig) -> Vec<String> {
    let mut errs = Vec::new();
    if clone.template.is_empty() {
        errs.push("'template' is required".to_string());
    }
    if clone.linked_clone && clone.disk_size != 0 {
        errs.push("'linked_clone' and 'disk_size' cannot be used together".to_string());
    }
    if !clone.mac_address.is_empty() && clone.network.is_empty() {
        errs.push("'network' is required when 'mac_address' is specified".to_string());
    }
    errs
}

/// `[datastore] path` or a `library/item/file` content library reference.
fn is_iso_reference(path: &str) -> bool {
    if DatastorePath::parse(path).is_some() {
        return true;
    }
    let parts: Vec<&str> = path.split('/').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty())
}

// ── Durations ───────────────────────────────────────────────────────

/// Parse a humanised duration such as "5s", "30m", "1h30m" or "250ms".
/// A bare "0" is accepted; negative values are rejected.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s.starts_with('-') {
        return Err(format!("duration '{s}' must not be negative"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration '{s}'"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid duration '{s}'"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in duration '{s}'")),
            other => return Err(format!("unknown unit '{other}' in duration '{s}'")),
        };
        total = Duration::try_from_secs_f64(value * scale)
            .ok()
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("invalid duration '{s}'"))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
