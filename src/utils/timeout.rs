//! Timeout constants and helpers shared by the transport and connection layers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default timeout for a socket connect attempt
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Version negotiation plus authentication must finish within this window
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between keepalive pings while connected
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Silence from the relay longer than this is treated as a dead connection
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(45);

/// Graceful shutdown window before the stream is destroyed
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run `fut`, mapping an elapsed deadline to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Wall-clock unix milliseconds, or 0 if the clock is before the epoch.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
