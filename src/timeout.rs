//! Hierarchical deadlines: call, connect, read, write, ping.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result, TimeoutStage};

/// The per-stage timeout configuration a call runs under.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TimeoutConfig {
    /// Spans everything from enqueue to body closure. `None` disables it.
    pub(crate) call: Option<Duration>,
    /// Applies to each TCP connect attempt.
    pub(crate) connect: Option<Duration>,
    /// Applies per socket read.
    pub(crate) read: Option<Duration>,
    /// Applies per socket write.
    pub(crate) write: Option<Duration>,
    /// WebSocket (and optionally HTTP/2) keepalive cadence. `None` disables
    /// pings.
    pub(crate) ping: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> TimeoutConfig {
        TimeoutConfig {
            call: None,
            connect: Some(Duration::from_secs(10)),
            read: Some(Duration::from_secs(10)),
            write: Some(Duration::from_secs(10)),
            ping: None,
        }
    }
}

/// Runs `future` under an optional deadline, mapping expiry to the
/// stage-appropriate timeout error.
pub(crate) async fn timed<T, F>(
    stage: TimeoutStage,
    timeout: Option<Duration>,
    future: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(duration) => match tokio::time::timeout(duration, future).await {
            Ok(result) => result,
            Err(_) => Err(Error::new_timeout(stage)),
        },
        None => future.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expiry_maps_to_stage() {
        let err = timed(TimeoutStage::Read, Some(Duration::from_millis(5)), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.timeout_stage(), Some(TimeoutStage::Read));
    }

    #[tokio::test]
    async fn none_means_unbounded() {
        let value = timed(TimeoutStage::Call, None, async { Ok(17) })
            .await
            .unwrap();
        assert_eq!(value, 17);
    }
}
