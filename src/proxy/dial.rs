//! TCP dialing with bounded retries and exponential backoff.
//!
//! Used by the connection path and by health probes; both paths therefore
//! share one worst-case dial budget of
//! `retry_attempts × retry_backoff_max`.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Config;
use crate::error::Error;

/// Backoff before attempt `attempt + 1`, after `attempt` failures.
///
/// Doubles from `base`, carries up to 10% jitter, and never exceeds `max`.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay_ms = base_ms.saturating_mul(exponent).min(max_ms);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms.saturating_add(jitter).min(max_ms))
}

/// Dial `addr`, retrying up to `config.retry_attempts` times.
///
/// Backoff is slept only between attempts, never before the first or after
/// the last. Exhausting every attempt yields [`Error::AllAttemptsFailed`]
/// carrying the final I/O error.
pub async fn dial_with_backoff(addr: SocketAddr, config: &Config) -> Result<TcpStream, Error> {
    let attempts = config.retry_attempts;
    let mut last = None;

    for attempt in 1..=attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(addr = %addr, attempt, error = %err, "Dial attempt failed");
                last = Some(err);
            }
        }
        if attempt < attempts {
            let delay = backoff_delay(
                attempt,
                config.retry_backoff_interval,
                config.retry_backoff_max,
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(Error::AllAttemptsFailed {
        addr,
        attempts,
        last: last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "zero dial attempts configured")
        }),
    })
}
