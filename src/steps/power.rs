//! Power on, wait for the guest address, shut down.

use async_trait::async_trait;
use std::time::Duration;

use vsforge_vsphere::ipwait::{IpWaitOutcome, IpWaitPolicy};

use crate::context::BuildContext;
use crate::step::{try_step, Step, StepAction};

pub struct Run;

#[async_trait]
impl Step for Run {
    fn name(&self) -> &'static str {
        "run"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        tracing::info!("powering on {}", vm.id());
        try_step!(ctx, vm.power_on().await);
        StepAction::Continue
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) {
        if !ctx.should_teardown() {
            return;
        }
        let Some(vm) = ctx.vm.as_ref() else {
            return;
        };
        if let Err(e) = vm.power_off().await {
            tracing::warn!("failed to power off {}: {e}", vm.id());
        }
    }
}

pub struct WaitForIp {
    policy: IpWaitPolicy,
}

impl WaitForIp {
    pub fn new(policy: IpWaitPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Step for WaitForIp {
    fn name(&self) -> &'static str {
        "wait-for-ip"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        tracing::info!("waiting for IP (settle {:?})", self.policy.settle_timeout);
        let outcome = try_step!(ctx, vm.wait_for_ip(&self.policy).await);
        match outcome {
            IpWaitOutcome::Stable(ip) => tracing::info!("IP address: {ip}"),
            IpWaitOutcome::Degraded(ip) => {
                tracing::warn!("IP address {ip} did not settle before the timeout; using it anyway")
            }
        }
        ctx.ip = Some(outcome.address());
        StepAction::Continue
    }
}

/// Bring the guest down cleanly. With `disable` the guest is expected to
/// power itself off.
pub struct Shutdown {
    timeout: Duration,
    disable: bool,
}

impl Shutdown {
    pub fn new(timeout: Duration, disable: bool) -> Self {
        Self { timeout, disable }
    }
}

#[async_trait]
impl Step for Shutdown {
    fn name(&self) -> &'static str {
        "shutdown"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        if try_step!(ctx, vm.is_powered_off().await) {
            tracing::info!("{} is already powered off", vm.id());
            return StepAction::Continue;
        }

        if self.disable {
            tracing::info!("automatic shutdown disabled; waiting for the guest to power off");
        } else {
            try_step!(ctx, vm.start_shutdown().await);
        }
        tracing::info!("waiting up to {:?} for shutdown", self.timeout);
        try_step!(ctx, vm.wait_for_shutdown(self.timeout).await);
        tracing::info!("{} is shut down", vm.id());
        StepAction::Continue
    }
}
