use async_trait::async_trait;
use std::collections::BTreeMap;

use vsforge_vsphere::types::ToolsConfig;
use vsforge_vsphere::vm::HardwareSpec;

use crate::context::BuildContext;
use crate::step::{try_step, Step, StepAction};

/// Grow the single disk of a cloned VM.
pub struct ResizeDisk {
    /// MiB
    disk_size: i64,
}

impl ResizeDisk {
    pub fn new(disk_size: i64) -> Self {
        Self { disk_size }
    }
}

#[async_trait]
impl Step for ResizeDisk {
    fn name(&self) -> &'static str {
        "resize-disk"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        tracing::info!("resizing disk to {} MiB", self.disk_size);
        try_step!(ctx, vm.resize_disk(self.disk_size * 1024).await);
        StepAction::Continue
    }
}

pub struct ConfigureHardware {
    hardware: HardwareSpec,
}

impl ConfigureHardware {
    pub fn new(hardware: HardwareSpec) -> Self {
        Self { hardware }
    }
}

#[async_trait]
impl Step for ConfigureHardware {
    fn name(&self) -> &'static str {
        "configure-hardware"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        tracing::info!("customizing hardware");
        try_step!(ctx, vm.configure(&self.hardware).await);
        StepAction::Continue
    }
}

/// extraConfig entries and VMware Tools settings.
pub struct ConfigParams {
    params: BTreeMap<String, String>,
    tools: Option<ToolsConfig>,
}

impl ConfigParams {
    pub fn new(params: BTreeMap<String, String>, tools: Option<ToolsConfig>) -> Self {
        Self { params, tools }
    }
}

#[async_trait]
impl Step for ConfigParams {
    fn name(&self) -> &'static str {
        "config-params"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        try_step!(ctx, vm.add_config_params(&self.params, self.tools.as_ref()).await);
        StepAction::Continue
    }
}

pub struct BootOrder {
    order: Vec<String>,
}

impl BootOrder {
    pub fn new(order: Vec<String>) -> Self {
        Self { order }
    }
}

#[async_trait]
impl Step for BootOrder {
    fn name(&self) -> &'static str {
        "boot-order"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        tracing::info!("setting boot order to {}", self.order.join(","));
        try_step!(ctx, vm.set_boot_order(&self.order).await);
        StepAction::Continue
    }
}
