//! Waiting for a guest to report a stable IP address.
//!
//! Two timelines run against one poll loop. The settle loop runs as a
//! spawned task and publishes every new address on a watch channel. The
//! caller races that task against the total-timeout deadline and external
//! cancellation:
//!
//! - settle loop finishes first: the address is [`IpWaitOutcome::Stable`];
//! - deadline fires first: the last published address is returned as
//!   [`IpWaitOutcome::Degraded`], or `Timeout` when none was ever seen;
//! - cancellation: `Cancelled`, never a partial address.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{VsphereError, VsphereResult};
use crate::net::Cidr;

/// Anything that can report the guest's current addresses.
#[async_trait]
pub trait AddressSource: Send + Sync + 'static {
    async fn guest_addresses(&self) -> VsphereResult<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct IpWaitPolicy {
    /// How long an address must stay unchanged.
    pub settle_timeout: Duration,
    /// Hard deadline for the whole wait.
    pub total_timeout: Duration,
    /// Only accept addresses inside this network. Unset means first IPv4.
    pub allowed: Option<Cidr>,
}

impl IpWaitPolicy {
    pub fn poll_interval(&self) -> Duration {
        let settle = self.settle_timeout;
        if settle >= Duration::from_secs(120) {
            Duration::from_secs(30)
        } else if settle >= Duration::from_secs(60) {
            Duration::from_secs(15)
        } else if settle >= Duration::from_secs(10) {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpWaitOutcome {
    /// Unchanged for the whole settle window.
    Stable(IpAddr),
    /// Last address seen when the total timeout expired.
    Degraded(IpAddr),
}

impl IpWaitOutcome {
    pub fn address(&self) -> IpAddr {
        match self {
            Self::Stable(ip) | Self::Degraded(ip) => *ip,
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Stable(_))
    }
}

/// Pick the address to track from one poll.
pub fn select_address(addresses: &[String], allowed: Option<&Cidr>) -> Option<IpAddr> {
    let mut parsed = addresses.iter().filter_map(|a| a.trim().parse::<IpAddr>().ok());
    match allowed {
        Some(net) => parsed.find(|ip| net.contains(ip)),
        None => parsed.find(IpAddr::is_ipv4),
    }
}

pub async fn wait_for_ip(
    source: Arc<dyn AddressSource>,
    policy: &IpWaitPolicy,
    cancel: &CancellationToken,
) -> VsphereResult<IpWaitOutcome> {
    let loop_cancel = cancel.child_token();
    let (seen_tx, seen_rx) = watch::channel(None);
    let mut settle = tokio::spawn(settle_loop(source, policy.clone(), loop_cancel.clone(), seen_tx));
    let deadline = tokio::time::sleep(policy.total_timeout);
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VsphereError::cancelled("waiting for IP cancelled")),
        joined = &mut settle => match joined {
            Ok(Ok(ip)) => Ok(IpWaitOutcome::Stable(ip)),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(VsphereError::task(format!("IP wait loop failed: {e}"))),
        },
        _ = &mut deadline => {
            let last = *seen_rx.borrow();
            match last {
                Some(ip) => {
                    log::warn!(
                        "timeout waiting for a stable IP after {:?}; using last seen address {ip}",
                        policy.total_timeout
                    );
                    Ok(IpWaitOutcome::Degraded(ip))
                }
                None => Err(VsphereError::timeout(format!(
                    "timeout waiting for IP address after {:?}",
                    policy.total_timeout
                ))),
            }
        }
    };

    loop_cancel.cancel();
    outcome
}

async fn settle_loop(
    source: Arc<dyn AddressSource>,
    policy: IpWaitPolicy,
    cancel: CancellationToken,
    seen: watch::Sender<Option<IpAddr>>,
) -> VsphereResult<IpAddr> {
    let interval = policy.poll_interval();
    let mut previous: Option<IpAddr> = None;
    let mut first = true;
    let mut stop = Instant::now();

    loop {
        let addresses = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VsphereError::cancelled("waiting for IP cancelled")),
            r = source.guest_addresses() => r?,
        };
        let current = select_address(&addresses, policy.allowed.as_ref());

        if first || current != previous {
            first = false;
            match current {
                Some(ip) => {
                    log::info!("guest reported IP {ip}; waiting {:?} for it to settle", policy.settle_timeout);
                    seen.send_replace(Some(ip));
                }
                None if previous.is_some() => log::debug!("guest address disappeared"),
                None => {}
            }
            previous = current;
            stop = Instant::now() + policy.settle_timeout;
            continue;
        }

        if let Some(ip) = current {
            if Instant::now() >= stop {
                log::info!("IP {ip} is stable");
                return Ok(ip);
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VsphereError::cancelled("waiting for IP cancelled")),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VsphereErrorKind;
    use std::sync::Mutex;

    /// Addresses keyed by the time (since start) they become visible.
    struct Timeline {
        start: Instant,
        points: Vec<(Duration, Vec<&'static str>)>,
        polls: Mutex<u32>,
    }

    impl Timeline {
        fn new(points: Vec<(u64, Vec<&'static str>)>) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                points: points
                    .into_iter()
                    .map(|(ms, a)| (Duration::from_millis(ms), a))
                    .collect(),
                polls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl AddressSource for Timeline {
        async fn guest_addresses(&self) -> VsphereResult<Vec<String>> {
            *self.polls.lock().unwrap() += 1;
            let elapsed = self.start.elapsed();
            Ok(self
                .points
                .iter()
                .rev()
                .find(|(at, _)| *at <= elapsed)
                .map(|(_, a)| a.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default())
        }
    }

    struct Failing;

    #[async_trait]
    impl AddressSource for Failing {
        async fn guest_addresses(&self) -> VsphereResult<Vec<String>> {
            Err(VsphereError::connection("session expired"))
        }
    }

    fn policy(settle: u64, total: u64) -> IpWaitPolicy {
        IpWaitPolicy {
            settle_timeout: Duration::from_secs(settle),
            total_timeout: Duration::from_secs(total),
            allowed: None,
        }
    }

    #[test]
    fn poll_interval_scales_with_settle() {
        assert_eq!(policy(5, 60).poll_interval(), Duration::from_secs(1));
        assert_eq!(policy(10, 60).poll_interval(), Duration::from_secs(5));
        assert_eq!(policy(60, 600).poll_interval(), Duration::from_secs(15));
        assert_eq!(policy(300, 600).poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn address_selection() {
        let addrs: Vec<String> = vec!["fe80::1".into(), "172.16.0.4".into(), "10.0.0.5".into()];
        assert_eq!(select_address(&addrs, None), Some("172.16.0.4".parse().unwrap()));
        let net: Cidr = "10.0.0.0/8".parse().unwrap();
        assert_eq!(select_address(&addrs, Some(&net)), Some("10.0.0.5".parse().unwrap()));
        let v6: Cidr = "fe80::/10".parse().unwrap();
        assert_eq!(select_address(&addrs, Some(&v6)), Some("fe80::1".parse().unwrap()));
        assert_eq!(select_address(&["garbage".to_string()], None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_address_settles_from_first_sighting() {
        let source = Timeline::new(vec![(0, vec!["10.0.0.5"])]);
        let start = Instant::now();
        let outcome = wait_for_ip(source, &policy(5, 60), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, IpWaitOutcome::Stable("10.0.0.5".parse().unwrap()));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn change_restarts_settle_window() {
        let source = Timeline::new(vec![(0, vec!["10.0.0.5"]), (3_000, vec!["10.0.0.6"])]);
        let start = Instant::now();
        let outcome = wait_for_ip(source, &policy(5, 60), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.address(), "10.0.0.6".parse::<IpAddr>().unwrap());
        assert!(outcome.is_stable());
        assert_eq!(start.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn address_appears_late() {
        let source = Timeline::new(vec![(0, vec![]), (4_000, vec!["192.168.1.20"])]);
        let start = Instant::now();
        let outcome = wait_for_ip(source, &policy(5, 60), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, IpWaitOutcome::Stable("192.168.1.20".parse().unwrap()));
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_returns_last_seen() {
        let source = Timeline::new(vec![
            (0, vec![]),
            (8_000, vec!["10.0.0.5"]),
            (9_000, vec!["10.0.0.9"]),
        ]);
        let outcome = wait_for_ip(source, &policy(5, 10), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, IpWaitOutcome::Degraded("10.0.0.9".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_without_address_fails() {
        let source = Timeline::new(vec![(0, vec![])]);
        let err = wait_for_ip(source, &policy(5, 10), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn cidr_filter_ignores_other_addresses() {
        let source = Timeline::new(vec![(0, vec!["172.17.0.1"]), (2_000, vec!["172.17.0.1", "10.1.2.3"])]);
        let mut p = policy(5, 60);
        p.allowed = Some("10.0.0.0/8".parse().unwrap());
        let outcome = wait_for_ip(source, &p, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.address(), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_discards_partial_address() {
        let source = Timeline::new(vec![(0, vec!["10.0.0.5"]), (1_000, vec!["10.0.0.6"]), (2_000, vec!["10.0.0.7"])]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            trigger.cancel();
        });
        let mut p = policy(5, 60);
        p.settle_timeout = Duration::from_secs(30);
        let err = wait_for_ip(source, &p, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_after_timeout() {
        let source = Timeline::new(vec![(0, vec![])]);
        let watched = source.clone();
        let _ = wait_for_ip(source, &policy(5, 10), &CancellationToken::new()).await;
        let polls = *watched.polls.lock().unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*watched.polls.lock().unwrap(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_abort() {
        let err = wait_for_ip(Arc::new(Failing), &policy(5, 60), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::ConnectionError);
    }
}
