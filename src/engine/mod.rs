pub mod conflict;
mod error;
mod mutations;
mod queries;
pub mod search;
pub mod store;
pub mod tiers;
pub mod timezone;

pub use conflict::{BufferPolicy, Candidate, Rules};
pub use error::{EngineError, Rejection, RejectionDetail, RuleId};
pub use search::{NotFoundReason, Slot, SuggestRequest, Suggestion};
pub use tiers::{TierInfo, TierPreference};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

use crate::config::{ConfigSource, SchedulerConfig};
use crate::model::*;
use crate::notify::{BookingEvent, NotifyHub};
use crate::wal::Wal;

use store::Calendar;

/// Source of "now". Injected so rule evaluation is reproducible.
pub trait Clock: Send + Sync {
    fn now(&self) -> Ms;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Ms {
        conflict::now_ms()
    }
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(now: Ms) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: Ms) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Ms {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Each wakeup drains every queued append and commits them with
/// a single fsync before answering their senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes don't leak into
    // the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

pub struct Engine {
    /// The single system-wide calendar. Writers hold it exclusively from
    /// conflict evaluation through WAL commit.
    pub(super) calendar: RwLock<Calendar>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the background writer. Must be
    /// called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: Arc<dyn ConfigSource>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut calendar = Calendar::new();
        for event in &events {
            calendar.apply(event);
        }
        info!("replayed {} events, {} bookings", events.len(), calendar.len());

        Ok(Self {
            calendar: RwLock::new(calendar),
            wal_tx,
            notify,
            config,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Fresh configuration for one request.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, EngineError> {
        let snapshot = self
            .config
            .snapshot()
            .map_err(|e| EngineError::ConfigurationUnavailable(e.to_string()))?;
        SchedulerConfig::resolve(&snapshot).map_err(|e| EngineError::ConfigurationUnavailable(e.to_string()))
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply to the locked calendar, then publish.
    pub(super) async fn persist_and_apply(
        &self,
        calendar: &mut Calendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        calendar.apply(event);
        let published = match event {
            Event::BookingCreated { booking } => calendar.get(&booking.id).cloned().map(BookingEvent::Created),
            Event::BookingStatusChanged { id, .. } => calendar.get(id).cloned().map(BookingEvent::Updated),
            Event::BookingDeleted { id } => calendar.get(id).cloned().map(BookingEvent::Deleted),
        };
        if let Some(e) = published {
            self.notify.publish(e);
        }
        Ok(())
    }
}
