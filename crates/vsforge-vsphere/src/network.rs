//! Network resolution and adapter assignment.

use std::sync::Arc;

use crate::devices::{network_adapter, DeviceChangeSet, NicSpec};
use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::session::Session;
use crate::types::{HostSummary, NetworkSummary};

fn find_host<'a>(hosts: &'a [HostSummary], host: &str) -> VsphereResult<&'a HostSummary> {
    hosts
        .iter()
        .find(|h| h.name == host || h.host == host)
        .ok_or_else(|| VsphereError::not_found(format!("host '{host}' not found")))
}

/// Pick one network for a (name, host) pair.
///
/// A name matches a network's short name or full path. When a name matches
/// several networks the host narrows the candidates; with no name the host's
/// only network is used.
pub fn resolve_network(
    networks: &[NetworkSummary],
    hosts: &[HostSummary],
    name: &str,
    host: &str,
) -> VsphereResult<NetworkSummary> {
    if !name.is_empty() {
        let matches: Vec<&NetworkSummary> = networks
            .iter()
            .filter(|n| n.name == name || n.path.as_deref() == Some(name))
            .collect();
        return match matches.as_slice() {
            [] => Err(VsphereError::not_found(format!("network '{name}' not found"))),
            [one] => Ok((*one).clone()),
            _ if host.is_empty() => Err(VsphereError::new(
                VsphereErrorKind::AmbiguousNetwork,
                format!(
                    "path '{name}' resolves to multiple networks. please provide a host to match or the network full path"
                ),
            )),
            _ => {
                let h = find_host(hosts, host).map_err(|e| {
                    VsphereError::new(
                        VsphereErrorKind::AmbiguousNetwork,
                        format!(
                            "path '{name}' resolves to multiple networks. unable to match a network to the host {host}: {}",
                            e.message
                        ),
                    )
                })?;
                let on_host: Vec<&&NetworkSummary> =
                    matches.iter().filter(|n| h.networks.contains(&n.network)).collect();
                match on_host.as_slice() {
                    [one] => Ok((**one).clone()),
                    _ => Err(VsphereError::new(
                        VsphereErrorKind::AmbiguousNetwork,
                        format!(
                            "path '{name}' resolves to multiple networks. unable to match a network to the host {host}"
                        ),
                    )),
                }
            }
        };
    }

    if !host.is_empty() {
        let h = find_host(hosts, host)?;
        let on_host: Vec<&NetworkSummary> =
            networks.iter().filter(|n| h.networks.contains(&n.network)).collect();
        return match on_host.as_slice() {
            [one] => Ok((*one).clone()),
            [] => Err(VsphereError::not_found(format!("host '{host}' has no networks"))),
            _ => Err(VsphereError::new(
                VsphereErrorKind::MultipleNetworks,
                "Host has multiple networks. Specify it explicitly",
            )),
        };
    }

    Err(VsphereError::config(
        "Couldn't find network; 'host' and 'network' not specified. At least one of the two must be specified.",
    ))
}

impl Session {
    /// All networks whose name or path equals `name`.
    pub async fn find_networks(&self, name: &str) -> VsphereResult<Vec<NetworkSummary>> {
        Ok(self
            .networks()
            .await?
            .into_iter()
            .filter(|n| n.name == name || n.path.as_deref() == Some(name))
            .collect())
    }

    pub async fn find_network(&self, name: &str, host: &str) -> VsphereResult<NetworkSummary> {
        let networks = self.networks().await?;
        let hosts = self.hosts().await?;
        resolve_network(&networks, &hosts, name, host)
    }

    /// One new ethernet card per entry, resolved against `host`.
    pub async fn assign_networks(self: &Arc<Self>, nics: &[NicSpec], host: &str) -> VsphereResult<DeviceChangeSet> {
        if nics.is_empty() {
            return Err(VsphereError::config("no network adapters have been defined"));
        }
        let networks = self.networks().await?;
        let hosts = self.hosts().await?;

        let mut set = DeviceChangeSet::new();
        for (i, nic) in nics.iter().enumerate() {
            let network = resolve_network(&networks, &hosts, &nic.network, host)
                .map_err(|e| e.context("network adapter", &i.to_string()))?;
            set.add(network_adapter(nic, &network)?);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedPlatform;
    use tokio_util::sync::CancellationToken;

    fn net(id: &str, name: &str, path: &str, hosts: &[&str]) -> NetworkSummary {
        NetworkSummary {
            network: id.into(),
            name: name.into(),
            path: Some(path.into()),
            network_type: None,
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn host(id: &str, name: &str, networks: &[&str]) -> HostSummary {
        HostSummary {
            host: id.into(),
            name: name.into(),
            cluster: None,
            networks: networks.iter().map(|s| s.to_string()).collect(),
            datastores: vec![],
        }
    }

    fn inventory() -> (Vec<NetworkSummary>, Vec<HostSummary>) {
        (
            vec![
                net("net-1", "VM Network", "VM Network", &["host-1", "host-2"]),
                net("pg-a", "prod", "dvs-a/prod", &["host-1"]),
                net("pg-b", "prod", "dvs-b/prod", &["host-2"]),
            ],
            vec![
                host("host-1", "esxi-01", &["net-1", "pg-a"]),
                host("host-2", "esxi-02", &["net-1", "pg-b"]),
                host("host-3", "esxi-03", &["net-1"]),
            ],
        )
    }

    #[test]
    fn unique_name() {
        let (nets, hosts) = inventory();
        assert_eq!(resolve_network(&nets, &hosts, "VM Network", "").unwrap().network, "net-1");
    }

    #[test]
    fn full_path_disambiguates() {
        let (nets, hosts) = inventory();
        assert_eq!(resolve_network(&nets, &hosts, "dvs-b/prod", "").unwrap().network, "pg-b");
    }

    #[test]
    fn host_disambiguates() {
        let (nets, hosts) = inventory();
        assert_eq!(resolve_network(&nets, &hosts, "prod", "esxi-01").unwrap().network, "pg-a");
    }

    #[test]
    fn ambiguous_without_host() {
        let (nets, hosts) = inventory();
        let err = resolve_network(&nets, &hosts, "prod", "").unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::AmbiguousNetwork);
        assert!(err.message.contains("please provide a host to match or the network full path"));
    }

    #[test]
    fn ambiguous_when_host_sees_none() {
        let (nets, hosts) = inventory();
        let err = resolve_network(&nets, &hosts, "prod", "esxi-03").unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::AmbiguousNetwork);
        assert_eq!(
            err.message,
            "path 'prod' resolves to multiple networks. unable to match a network to the host esxi-03"
        );
    }

    #[test]
    fn ambiguous_with_unknown_host() {
        let (nets, hosts) = inventory();
        let err = resolve_network(&nets, &hosts, "prod", "esxi-99").unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::AmbiguousNetwork);
        assert!(err.message.ends_with("esxi-99: host 'esxi-99' not found"));
    }

    #[test]
    fn host_only() {
        let (nets, hosts) = inventory();
        assert_eq!(resolve_network(&nets, &hosts, "", "esxi-03").unwrap().network, "net-1");
        let err = resolve_network(&nets, &hosts, "", "esxi-01").unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::MultipleNetworks);
        assert_eq!(err.message, "Host has multiple networks. Specify it explicitly");
    }

    #[test]
    fn neither_name_nor_host() {
        let (nets, hosts) = inventory();
        let err = resolve_network(&nets, &hosts, "", "").unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::Configuration);
    }

    #[test]
    fn unknown_network() {
        let (nets, hosts) = inventory();
        assert!(resolve_network(&nets, &hosts, "nope", "").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn assign_networks_against_lab() {
        let sim = Arc::new(SimulatedPlatform::lab());
        let session = Session::open(sim, "dc1", CancellationToken::new()).await.unwrap();

        let nics = vec![
            NicSpec { network: "dvs-prod".into(), network_card: "vmxnet3".into(), ..Default::default() },
            NicSpec { network: "VM Network".into(), network_card: "e1000".into(), ..Default::default() },
        ];
        let changes = session.assign_networks(&nics, "esxi-02").await.unwrap().resolve(&[]).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.device.is_ethernet()));

        let err = session.assign_networks(&nics, "").await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::AmbiguousNetwork);
        assert!(err.message.starts_with("network adapter '0':"));

        let err = session.assign_networks(&[], "esxi-02").await.unwrap_err();
        assert_eq!(err.message, "no network adapters have been defined");
    }
}
