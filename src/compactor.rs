use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError};
use crate::observability::WAL_COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once at least `threshold` events were appended since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        match compact_if_due(&engine, threshold).await {
            Ok(true) => {
                metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            }
            Ok(false) => {}
            Err(e) => {
                metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
                warn!("WAL compaction failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSnapshot, StaticConfigSource};
    use crate::engine::FixedClock;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fieldbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let config = Arc::new(StaticConfigSource::new(ConfigSnapshot::with_timezone("UTC")));
        let engine = Engine::new(test_wal_path("threshold.wal"), Arc::new(NotifyHub::new()), config)
            .unwrap()
            .with_clock(Arc::new(FixedClock::new(0)));

        let booking = engine
            .create_booking(NewBooking {
                owner_id: Ulid::new(),
                resource_id: None,
                window: WindowInput::Absolute { start: 10 * HOUR_MS, end: None, duration_minutes: None },
                metadata: BookingMetadata::default(),
            })
            .await
            .unwrap();
        engine.set_status(booking.id, BookingStatus::Scheduled).await.unwrap();

        assert!(!compact_if_due(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 2);
        assert!(compact_if_due(&engine, 2).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.get_booking(booking.id).await.unwrap().status, BookingStatus::Scheduled);
    }
}
