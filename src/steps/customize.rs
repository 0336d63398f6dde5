use async_trait::async_trait;

use vsforge_vsphere::customize::{build_spec, CustomizationSpec, Identity, LinuxPrep};

use crate::config::CustomizeConfig;
use crate::context::BuildContext;
use crate::error::BuildResult;
use crate::step::{try_step, Step, StepAction};

/// Guest customization of a cloned VM. Runs before first power-on.
pub struct Customize {
    config: CustomizeConfig,
}

impl Customize {
    pub fn new(config: CustomizeConfig) -> Self {
        Self { config }
    }

    async fn identity(&self) -> BuildResult<Identity> {
        if let Some(linux) = &self.config.linux_options {
            let mut prep = LinuxPrep::new(&linux.host_name, &linux.domain);
            if !linux.time_zone.is_empty() {
                prep.time_zone = linux.time_zone.clone();
            }
            if let Some(utc) = linux.hw_clock_utc {
                prep.hw_clock_utc = utc;
            }
            return Ok(Identity::LinuxPrep(prep));
        }
        let value = tokio::fs::read_to_string(&self.config.windows_sysprep_file).await?;
        Ok(Identity::SysprepText { value })
    }

    async fn spec(&self) -> BuildResult<CustomizationSpec> {
        let identity = self.identity().await?;
        Ok(build_spec(
            identity,
            &self.config.network_interface,
            &self.config.gateways,
            &self.config.dns,
        )?)
    }
}

#[async_trait]
impl Step for Customize {
    fn name(&self) -> &'static str {
        "customize"
    }

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = try_step!(ctx, ctx.vm().cloned());
        let spec = try_step!(ctx, self.spec().await);
        tracing::info!("customizing guest with {} interface(s)", spec.nic_setting_map.len());
        try_step!(ctx, vm.customize(&spec).await);
        StepAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinuxOptions;
    use std::io::Write;
    use vsforge_vsphere::customize::NetworkInterfaceCustomization;

    fn dhcp_nic() -> Vec<NetworkInterfaceCustomization> {
        vec![NetworkInterfaceCustomization::default()]
    }

    #[tokio::test]
    async fn linux_identity_keeps_clock_settings() {
        let step = Customize::new(CustomizeConfig {
            linux_options: Some(LinuxOptions {
                host_name: "web".into(),
                domain: "lab.local".into(),
                hw_clock_utc: Some(false),
                time_zone: "Europe/Lisbon".into(),
            }),
            network_interface: dhcp_nic(),
            ..Default::default()
        });
        let spec = step.spec().await.unwrap();
        let Identity::LinuxPrep(prep) = spec.identity else {
            panic!("expected a linux identity");
        };
        assert_eq!(prep.host_name, "web");
        assert_eq!(prep.time_zone, "Europe/Lisbon");
        assert!(!prep.hw_clock_utc);
    }

    #[tokio::test]
    async fn sysprep_file_is_sent_verbatim() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "<unattend/>").unwrap();
        let step = Customize::new(CustomizeConfig {
            windows_sysprep_file: file.path().display().to_string(),
            network_interface: dhcp_nic(),
            ..Default::default()
        });
        let spec = step.spec().await.unwrap();
        assert_eq!(
            spec.identity,
            Identity::SysprepText {
                value: "<unattend/>".into()
            }
        );
    }

    #[tokio::test]
    async fn missing_sysprep_file_is_an_io_error() {
        let step = Customize::new(CustomizeConfig {
            windows_sysprep_file: "/nonexistent/unattend.xml".into(),
            network_interface: dhcp_nic(),
            ..Default::default()
        });
        assert!(matches!(step.spec().await, Err(crate::error::BuildError::Io(_))));
    }
}
