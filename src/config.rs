use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Timing and queueing knobs for the offer protocol.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a worker has to answer an offer
    pub acceptance_window: Duration,
    /// Repeat interval for offer alerts while the offer is pending
    pub alert_interval: Duration,
    /// Period of the safety sweep over pending jobs
    pub sweep_interval: Duration,
    /// Capacity of the dispatch event queue. Events dropped on overflow are
    /// picked up by the next sweep.
    pub event_buffer: usize,
    /// Completed jobs older than this are dropped from the archive on sweep
    pub archive_retention: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            acceptance_window: Duration::from_secs(300),
            alert_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            event_buffer: 1024,
            archive_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl DispatchConfig {
    pub fn with_acceptance_window(mut self, window: Duration) -> Self {
        self.acceptance_window = window;
        self
    }

    pub fn with_alert_interval(mut self, interval: Duration) -> Self {
        self.alert_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Durable incident log settings.
#[derive(Debug, Clone)]
pub struct IncidentConfig {
    /// Append-only JSON lines file. `None` keeps incidents in memory only.
    pub log_path: Option<PathBuf>,
    /// Write attempts per incident before it is parked for replay
    pub max_attempts: u32,
    /// First retry delay; doubled on each attempt
    pub base_backoff: Duration,
    /// Upper bound for a single retry delay
    pub max_backoff: Duration,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl IncidentConfig {
    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub dispatch: DispatchConfig,
    pub incidents: IncidentConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            dispatch: DispatchConfig::default(),
            incidents: IncidentConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_incident_log(mut self, path: PathBuf) -> Self {
        self.incidents.log_path = Some(path);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_config_default() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.acceptance_window, Duration::from_secs(300));
        assert_eq!(cfg.alert_interval, Duration::from_secs(10));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
        assert_eq!(cfg.event_buffer, 1024);
    }

    #[test]
    fn dispatch_config_builders() {
        let cfg = DispatchConfig::default()
            .with_acceptance_window(Duration::from_secs(60))
            .with_alert_interval(Duration::from_secs(2))
            .with_sweep_interval(Duration::from_millis(500));
        assert_eq!(cfg.acceptance_window, Duration::from_secs(60));
        assert_eq!(cfg.alert_interval, Duration::from_secs(2));
        assert_eq!(cfg.sweep_interval, Duration::from_millis(500));
    }

    #[test]
    fn incident_backoff_doubles_and_caps() {
        let cfg = IncidentConfig::default();
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_for(4), Duration::from_millis(800));
        assert_eq!(cfg.backoff_for(10), Duration::from_secs(5));
        assert_eq!(cfg.backoff_for(64), Duration::from_secs(5));
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8080");
        assert!(cfg.incidents.log_path.is_none());
        assert_eq!(cfg.incidents.max_attempts, 5);
    }

    #[test]
    fn node_config_with_incident_log() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = NodeConfig::new(addr).with_incident_log(PathBuf::from("/var/log/incidents.jsonl"));
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(
            cfg.incidents.log_path.as_deref(),
            Some(std::path::Path::new("/var/log/incidents.jsonl"))
        );
    }
}
