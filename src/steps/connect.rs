use async_trait::async_trait;
use std::sync::Arc;

use vsforge_vsphere::types::VsphereConfig;
use vsforge_vsphere::{Platform, Session};

use crate::context::BuildContext;
use crate::step::{try_step, Step, StepAction};

/// Log in and pin the datacenter.
pub struct Connect {
    config: VsphereConfig,
    /// Already authenticated platform; a live connection is made when unset.
    platform: Option<Arc<dyn Platform>>,
}

impl Connect {
    pub fn new(config: VsphereConfig, platform: Option<Arc<dyn Platform>>) -> Self {
        Self { config, platform }
    }
}

#[async_trait]
impl Step for Connect {
    fn name(&self) -> &'static str {
        "connect"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let cancel = ctx.cancel.clone();
        let session = match self.platform.clone() {
            Some(platform) => {
                let datacenter = self.config.datacenter.clone().unwrap_or_default();
                Session::open(platform, &datacenter, cancel).await
            }
            None => Session::connect(&self.config, cancel).await,
        };
        let session = try_step!(ctx, session);
        tracing::info!(
            datacenter = %session.datacenter().name,
            "connected to {}",
            self.config.host
        );
        ctx.session = Some(session);
        StepAction::Continue
    }
}
