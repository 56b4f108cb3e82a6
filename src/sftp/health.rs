//! SFTP session health probe
//!
//! A trivial bounded round-trip against a held sub-channel. The session
//! manager runs it for every live session on each sweep.

use std::time::{Duration, Instant};

use tracing::debug;

use super::channel::SftpChannel;
use super::error::SftpError;

/// Probe bound
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory listed by the probe
const PROBE_PATH: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy { latency: Duration },
    Failed(SftpError),
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HealthProbe {
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn check(&self, channel: &dyn SftpChannel) -> ProbeOutcome {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, channel.read_dir(PROBE_PATH)).await {
            Ok(Ok(_)) => {
                let latency = started.elapsed();
                debug!("SFTP probe ok in {:?}", latency);
                ProbeOutcome::Healthy { latency }
            }
            Ok(Err(e)) => ProbeOutcome::Failed(e),
            Err(_) => ProbeOutcome::TimedOut,
        }
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    #[tokio::test]
    async fn test_healthy() {
        let channel = MockChannel::new();
        assert!(HealthProbe::default().check(&channel).await.is_healthy());
    }

    #[tokio::test]
    async fn test_failure() {
        let channel = MockChannel::new();
        channel.set_failure(Some(SftpError::ChannelError("eof".into())));
        assert_eq!(
            HealthProbe::default().check(&channel).await,
            ProbeOutcome::Failed(SftpError::ChannelError("eof".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let channel = MockChannel::new();
        channel.set_hang(true);
        assert_eq!(
            HealthProbe::default().check(&channel).await,
            ProbeOutcome::TimedOut
        );
    }
}
