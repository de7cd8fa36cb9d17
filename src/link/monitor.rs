//! Link-health monitor
//!
//! Periodically retries a failed link while consumers are registered. The
//! tick interval is drawn once per monitor from `[min, max]` so replicas do
//! not retry in lockstep. After `max_attempts` consecutive failures the
//! monitor stops for good.

use super::linker::CredentialLinker;
use crate::config::LinkSection;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MAX_LINK_ATTEMPTS_WARNING: &str =
    "Maximum failed link attempts. Restart or redeploy to re-establish the connection.";

#[derive(Debug, Clone, PartialEq)]
pub struct LinkRetryPolicy {
    pub max_attempts: u32,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl Default for LinkRetryPolicy {
    fn default() -> Self {
        Self::from_config(&LinkSection::default())
    }
}

impl LinkRetryPolicy {
    pub fn from_config(config: &LinkSection) -> Self {
        Self {
            max_attempts: config.max_attempts,
            min_interval: Duration::from_secs(config.monitor_min_secs),
            max_interval: Duration::from_secs(config.monitor_max_secs),
        }
    }

    /// Uniform draw from `[min_interval, max_interval]`
    pub fn pick_interval(&self) -> Duration {
        let min = self.min_interval.as_millis() as u64;
        let max = self.max_interval.as_millis() as u64;
        if max <= min {
            return self.min_interval;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCheck {
    Skip,
    Relink,
}

/// Pure retry bookkeeping
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    policy: LinkRetryPolicy,
    attempts: u32,
    stopped: bool,
}

impl LinkMonitor {
    pub fn new(policy: LinkRetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            stopped: false,
        }
    }

    pub fn policy(&self) -> &LinkRetryPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Decide what this tick does
    pub fn check(&self, has_consumers: bool, linked: bool, link_failed: bool) -> LinkCheck {
        if self.stopped || !has_consumers || (linked && !link_failed) {
            return LinkCheck::Skip;
        }
        if link_failed {
            LinkCheck::Relink
        } else {
            LinkCheck::Skip
        }
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    /// Returns true exactly once, when the attempt cap is reached
    pub fn record_failure(&mut self) -> bool {
        if self.stopped || self.attempts < self.policy.max_attempts {
            return false;
        }
        self.stopped = true;
        true
    }
}

/// What the monitor watches
#[async_trait]
pub trait MonitoredLink: Send + Sync + 'static {
    async fn has_consumers(&self) -> bool;

    fn linker(&self) -> &CredentialLinker;

    /// Called after a successful relink
    async fn relinked(&self);
}

/// Run the monitor until the attempt cap is reached
pub async fn run_link_monitor<T: MonitoredLink>(target: T, mut monitor: LinkMonitor) {
    let period = monitor.policy().pick_interval();
    info!(interval_ms = period.as_millis() as u64, "Link monitor started");
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        ticker.tick().await;
        let linker = target.linker();
        let check = monitor.check(
            target.has_consumers().await,
            linker.is_linked().await,
            linker.link_failed().await,
        );
        if check == LinkCheck::Skip {
            continue;
        }

        monitor.begin_attempt();
        match linker.link().await {
            Ok(_) => {
                monitor.record_success();
                target.relinked().await;
            }
            Err(e) => {
                debug!(attempt = monitor.attempts(), "Relink failed: {}", e);
                if monitor.record_failure() {
                    warn!("{}", MAX_LINK_ATTEMPTS_WARNING);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> LinkRetryPolicy {
        LinkRetryPolicy {
            max_attempts,
            min_interval: Duration::from_secs(55),
            max_interval: Duration::from_secs(65),
        }
    }

    #[test]
    fn test_interval_within_bounds() {
        let policy = LinkRetryPolicy::default();
        for _ in 0..100 {
            let interval = policy.pick_interval();
            assert!(interval >= Duration::from_secs(55));
            assert!(interval <= Duration::from_secs(65));
        }
    }

    #[test]
    fn test_check_decisions() {
        let monitor = LinkMonitor::new(policy(5));
        assert_eq!(monitor.check(false, false, true), LinkCheck::Skip);
        assert_eq!(monitor.check(true, true, false), LinkCheck::Skip);
        assert_eq!(monitor.check(true, false, false), LinkCheck::Skip);
        assert_eq!(monitor.check(true, false, true), LinkCheck::Relink);
    }

    #[test]
    fn test_stops_exactly_once_at_cap() {
        let mut monitor = LinkMonitor::new(policy(5));
        let mut terminal = 0;
        for _ in 0..5 {
            monitor.begin_attempt();
            if monitor.record_failure() {
                terminal += 1;
            }
        }
        assert_eq!(terminal, 1);
        assert!(monitor.is_stopped());
        assert_eq!(monitor.check(true, false, true), LinkCheck::Skip);
        assert!(!monitor.record_failure());
    }

    #[test]
    fn test_success_resets_counter() {
        let mut monitor = LinkMonitor::new(policy(5));
        for _ in 0..4 {
            monitor.begin_attempt();
            assert!(!monitor.record_failure());
        }
        monitor.begin_attempt();
        monitor.record_success();
        assert_eq!(monitor.attempts(), 0);

        for _ in 0..4 {
            monitor.begin_attempt();
            assert!(!monitor.record_failure());
        }
        assert!(!monitor.is_stopped());
    }
}
