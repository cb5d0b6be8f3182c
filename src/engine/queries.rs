use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::timezone::{business_day_range_utc, parse_calendar_date};
use super::tiers::TierInfo;
use super::{Engine, EngineError};

impl Engine {
    /// Blocking bookings whose real window intersects `window`, system-wide.
    pub async fn active_bookings_in(&self, window: Span) -> Result<Vec<Booking>, EngineError> {
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let guard = self.calendar.read().await;
        Ok(guard.active_overlapping(&window).cloned().collect())
    }

    /// Bookings occupying the business-local `date`, each flagged with whether
    /// it belongs to `caller`.
    pub async fn list_day(
        &self,
        date: &str,
        caller: Option<Ulid>,
    ) -> Result<Vec<DayBooking>, EngineError> {
        let date = parse_calendar_date(date)?;
        let cfg = self.scheduler_config()?;
        let day = business_day_range_utc(date, cfg.timezone)?;
        let bookings = self.active_bookings_in(day).await?;
        Ok(bookings
            .into_iter()
            .map(|booking| DayBooking {
                start: booking.start,
                end: booking.end(),
                is_own: caller == Some(booking.owner_id),
                booking,
            })
            .collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let guard = self.calendar.read().await;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn find_by_request_number(&self, request_number: &str) -> Option<Booking> {
        let guard = self.calendar.read().await;
        guard.find_by_request_number(request_number).cloned()
    }

    pub fn resolve_tier(&self, at: Ms) -> Result<TierInfo, EngineError> {
        let cfg = self.scheduler_config()?;
        Ok(cfg.rate_table.resolve(at, cfg.timezone))
    }
}
