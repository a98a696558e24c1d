//! Waiting discipline for eventually consistent volume backends.
//!
//! A mutating call against a cloud volume API returns before the change is
//! visible in the backend's enumeration. Callers poll the enumeration at a
//! fixed short interval until the expected steady-state status holds, with
//! a deadline; hitting the deadline yields a [`VolumeError::Timeout`]
//! carrying both the expected and the last-observed status.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::{BlockDeviceVolume, VolumeError};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Status reported for a volume that the enumeration does not list at all.
pub const STATUS_ABSENT: &str = "absent";
pub const STATUS_AVAILABLE: &str = "available";
pub const STATUS_IN_USE: &str = "in-use";

/// Poll `observe` every [`POLL_INTERVAL`] until it reports `expected`,
/// returning the observed volume (None when waiting for `absent`).
pub async fn wait_for_status<F, Fut>(
    volume_id: &str,
    expected: &str,
    deadline: Duration,
    mut observe: F,
) -> Result<Option<BlockDeviceVolume>, VolumeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(Option<BlockDeviceVolume>, String), VolumeError>>,
{
    let started = Instant::now();
    let mut last_observed = STATUS_ABSENT.to_string();
    loop {
        let (volume, status) = observe().await?;
        if status == expected {
            return Ok(volume);
        }
        last_observed = status;

        let waited = started.elapsed();
        if waited >= deadline {
            return Err(VolumeError::Timeout {
                volume_id: volume_id.to_string(),
                expected: expected.to_string(),
                last_observed,
                waited,
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
