use chrono_tz::Tz;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_against_existing, evaluate, lookup_window, validate_span, Candidate, Rules};
use super::timezone::{local_to_utc, local_year, parse_calendar_date};
use super::{Engine, EngineError, WalCommand};

fn validate_metadata(meta: &BookingMetadata) -> Result<(), EngineError> {
    if meta.title.as_ref().is_some_and(|t| t.len() > MAX_TITLE_LEN) {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if meta.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

fn minutes_between(start: Ms, end: Ms) -> Result<u32, EngineError> {
    if end <= start {
        return Err(EngineError::Validation {
            field: "end",
            reason: "must be after start".into(),
        });
    }
    let length = end
        .checked_sub(start)
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    if length % MINUTE_MS != 0 {
        return Err(EngineError::Validation {
            field: "end",
            reason: "window must be a whole number of minutes".into(),
        });
    }
    u32::try_from(length / MINUTE_MS).map_err(|_| EngineError::LimitExceeded("window too long"))
}

/// Canonical `(start, duration_minutes)` for either input shape.
pub(crate) fn resolve_window(window: &WindowInput, tz: Tz) -> Result<(Ms, u32), EngineError> {
    match window {
        WindowInput::Absolute { start, end, duration_minutes } => match (end, duration_minutes) {
            (Some(_), Some(_)) => Err(EngineError::Validation {
                field: "end",
                reason: "give either end or duration_minutes, not both".into(),
            }),
            (Some(end), None) => Ok((*start, minutes_between(*start, *end)?)),
            (None, Some(0)) => Err(EngineError::Validation {
                field: "duration_minutes",
                reason: "must be positive".into(),
            }),
            (None, Some(minutes)) => Ok((*start, *minutes)),
            (None, None) => Ok((*start, DEFAULT_BOOKING_DURATION_MINUTES)),
        },
        WindowInput::Local { date, start_minute, end_minute } => {
            let date = parse_calendar_date(date)?;
            let start = local_to_utc(date, *start_minute, tz)?;
            match end_minute {
                Some(m) => {
                    let end = local_to_utc(date, *m, tz)?;
                    Ok((start, minutes_between(start, end)?))
                }
                None => Ok((start, DEFAULT_BOOKING_DURATION_MINUTES)),
            }
        }
    }
}

impl Engine {
    /// Validate, evaluate every rule against the shared calendar, then commit.
    /// The calendar write lock is held from the conflict read through the WAL
    /// commit, so two accepted bookings can never violate each other.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        validate_metadata(&req.metadata)?;
        let cfg = self.scheduler_config()?;
        let (start, duration_minutes) = resolve_window(&req.window, cfg.timezone)?;
        let end = start
            .checked_add(duration_minutes as Ms * MINUTE_MS)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        let span = Span::new(start, end);
        validate_span(&span)?;
        let rules = Rules::from(&cfg);
        let candidate = Candidate { span, owner_id: Some(req.owner_id) };

        let mut calendar = self.calendar.write().await;
        if calendar.len() >= MAX_BOOKINGS {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        let existing: Vec<Booking> = calendar
            .active_overlapping(&lookup_window(&span, &rules.buffer_policy))
            .cloned()
            .collect();
        let now = self.now();
        if let Err(rejection) = evaluate(&candidate, &existing, &rules, now) {
            metrics::counter!(observability::REJECTIONS_TOTAL, "rule" => rejection.rule.as_str())
                .increment(1);
            debug!("booking for {} rejected: {rejection}", req.owner_id);
            return Err(rejection.into());
        }

        let year = local_year(now, cfg.timezone)
            .ok_or_else(|| EngineError::InvalidTime(format!("{now} has no local year")))?;
        let booking = Booking {
            id: Ulid::new(),
            request_number: calendar.next_request_number(year),
            owner_id: req.owner_id,
            resource_id: req.resource_id,
            start,
            duration_minutes,
            status: BookingStatus::Submitted,
            priority: req.metadata.priority.unwrap_or_default(),
            urgency: req.metadata.urgency.unwrap_or_default(),
            title: req.metadata.title,
            notes: req.metadata.notes,
            deleted: false,
            created_at: now,
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(&mut calendar, &event).await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!("created {} ({}) for {}", booking.request_number, booking.id, booking.owner_id);
        Ok(booking)
    }

    /// Moving a final booking back to an active status re-checks overlap and
    /// buffers against everything else on the calendar.
    pub async fn set_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
        let cfg = self.scheduler_config()?;
        let mut calendar = self.calendar.write().await;
        let current = match calendar.get(&id) {
            Some(b) if !b.deleted => b.clone(),
            _ => return Err(EngineError::NotFound(id)),
        };
        if current.status == status {
            return Ok(current);
        }
        if current.status.is_final() && !status.is_final() {
            let span = current.span();
            let others: Vec<Booking> = calendar
                .active_overlapping(&lookup_window(&span, &cfg.buffer_policy))
                .filter(|b| b.id != id)
                .cloned()
                .collect();
            let candidate = Candidate { span, owner_id: Some(current.owner_id) };
            if let Err(rejection) = check_against_existing(&candidate, &others, &cfg.buffer_policy) {
                metrics::counter!(observability::REJECTIONS_TOTAL, "rule" => rejection.rule.as_str())
                    .increment(1);
                return Err(rejection.into());
            }
        }

        self.persist_and_apply(&mut calendar, &Event::BookingStatusChanged { id, status })
            .await?;
        info!("{} {} -> {}", current.request_number, current.status.as_str(), status.as_str());
        calendar.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Soft delete: the record stays for history but stops blocking.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut calendar = self.calendar.write().await;
        match calendar.get(&id) {
            Some(b) if !b.deleted => {}
            _ => return Err(EngineError::NotFound(id)),
        }
        self.persist_and_apply(&mut calendar, &Event::BookingDeleted { id }).await?;
        let booking = calendar.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        info!("deleted {} ({id})", booking.request_number);
        Ok(booking)
    }

    /// Rewrite the WAL as one `BookingCreated` per booking. Writers are held
    /// off until the compacted file is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let calendar = self.calendar.read().await;
        let events = calendar.snapshot_events();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(calendar);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEW_YORK: Tz = chrono_tz::America::New_York;

    #[test]
    fn absolute_window_defaults_to_one_hour() {
        let w = WindowInput::Absolute { start: 0, end: None, duration_minutes: None };
        assert_eq!(resolve_window(&w, NEW_YORK).unwrap(), (0, 60));
    }

    #[test]
    fn absolute_window_end_becomes_duration() {
        let w = WindowInput::Absolute { start: 0, end: Some(90 * MINUTE_MS), duration_minutes: None };
        assert_eq!(resolve_window(&w, NEW_YORK).unwrap(), (0, 90));
    }

    #[test]
    fn absolute_window_rejects_ambiguous_or_empty_shapes() {
        let both = WindowInput::Absolute { start: 0, end: Some(HOUR_MS), duration_minutes: Some(60) };
        assert!(matches!(resolve_window(&both, NEW_YORK), Err(EngineError::Validation { .. })));
        let inverted = WindowInput::Absolute { start: HOUR_MS, end: Some(0), duration_minutes: None };
        assert!(matches!(resolve_window(&inverted, NEW_YORK), Err(EngineError::Validation { .. })));
        let zero = WindowInput::Absolute { start: 0, end: None, duration_minutes: Some(0) };
        assert!(matches!(resolve_window(&zero, NEW_YORK), Err(EngineError::Validation { .. })));
    }

    #[test]
    fn extreme_instants_are_limits_not_panics() {
        let w = WindowInput::Absolute { start: Ms::MIN, end: Some(Ms::MAX), duration_minutes: None };
        assert!(matches!(resolve_window(&w, NEW_YORK), Err(EngineError::LimitExceeded(_))));
        let w = WindowInput::Absolute { start: -HOUR_MS, end: Some(Ms::MAX - 1), duration_minutes: None };
        assert!(matches!(resolve_window(&w, NEW_YORK), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn local_window_uses_business_timezone() {
        let w = WindowInput::Local { date: "2025-11-03".into(), start_minute: 9 * 60, end_minute: Some(11 * 60) };
        let (start, minutes) = resolve_window(&w, NEW_YORK).unwrap();
        // 09:00 EST = 14:00Z
        assert_eq!(start, crate::engine::timezone::parse_instant("2025-11-03T14:00:00Z").unwrap());
        assert_eq!(minutes, 120);
    }

    #[test]
    fn local_window_inside_dst_gap_is_rejected() {
        let w = WindowInput::Local { date: "2025-03-09".into(), start_minute: 2 * 60 + 30, end_minute: None };
        assert!(matches!(resolve_window(&w, NEW_YORK), Err(EngineError::InvalidTime(_))));
    }

    #[test]
    fn oversized_metadata_rejected() {
        let meta = BookingMetadata { title: Some("x".repeat(MAX_TITLE_LEN + 1)), ..Default::default() };
        assert!(matches!(validate_metadata(&meta), Err(EngineError::LimitExceeded(_))));
        assert!(validate_metadata(&BookingMetadata::default()).is_ok());
    }
}
