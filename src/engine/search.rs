use chrono::Days;
use chrono_tz::Tz;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_against_existing, check_duration, BufferPolicy, Candidate};
use super::tiers::{RateTable, TierInfo, TierPreference};
use super::timezone::{business_day_range_utc, parse_calendar_date};
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq)]
pub struct SuggestRequest {
    /// Business-local `YYYY-MM-DD` where the search starts.
    pub date: String,
    /// Defaults to the configured default duration.
    pub duration_hours: Option<f64>,
    pub tier: TierPreference,
    /// Lets the self-exempt buffer policy skip the requester's own bookings.
    pub requester: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub span: Span,
    pub tier: TierInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    NoSlot { duration_minutes: u32 },
    NoSlotAtTier { duration_minutes: u32, tier: TierPreference },
}

impl std::fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hours = |m: u32| m as f64 / 60.0;
        match self {
            NotFoundReason::NoSlot { duration_minutes } => write!(
                f,
                "no available slot of {} hours in the next {MAX_DAYS_TO_SEARCH} days",
                hours(*duration_minutes)
            ),
            NotFoundReason::NoSlotAtTier { duration_minutes, tier } => write!(
                f,
                "no available slot of {} hours at tier {} in the next {MAX_DAYS_TO_SEARCH} days",
                hours(*duration_minutes),
                tier.as_str()
            ),
        }
    }
}

/// Exhausting the horizon is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Suggestion {
    Found(Slot),
    NotFound(NotFoundReason),
}

/// Whole or half hours in `[1, 6]`.
pub fn slot_duration_ms(hours: f64) -> Result<Ms, EngineError> {
    if !hours.is_finite() {
        return Err(EngineError::Validation {
            field: "duration_hours",
            reason: format!("{hours} is not a number of hours"),
        });
    }
    let ms = (hours * HOUR_MS as f64).round() as Ms;
    check_duration(ms)?;
    if (hours * 2.0).fract() != 0.0 {
        return Err(EngineError::Validation {
            field: "duration_hours",
            reason: format!("{hours} is not a multiple of 0.5"),
        });
    }
    Ok(ms)
}

/// Per-day search inputs that stay fixed across the horizon.
pub struct DaySearch<'a> {
    pub duration_ms: Ms,
    pub not_before: Ms,
    pub policy: &'a BufferPolicy,
    pub requester: Option<Ulid>,
    pub tier: TierPreference,
    pub rate_table: &'a RateTable,
    pub timezone: Tz,
}

impl DaySearch<'_> {
    /// First grid point of `day` that fits, is far enough ahead, clears every
    /// overlap/buffer rule against `existing` and matches the tier preference.
    pub fn first_slot(&self, day: Span, existing: &[Booking]) -> Option<Slot> {
        let mut g = day.start;
        while g + self.duration_ms <= day.end {
            if g >= self.not_before {
                let candidate = Candidate {
                    span: Span::new(g, g + self.duration_ms),
                    owner_id: self.requester,
                };
                if check_against_existing(&candidate, existing, self.policy).is_ok() {
                    let tier = self.rate_table.resolve(g, self.timezone);
                    if self.tier.matches(&tier) {
                        return Some(Slot { span: candidate.span, tier });
                    }
                }
            }
            g += SLOT_GRID_MS;
        }
        None
    }
}

impl Engine {
    /// Walk up to `MAX_DAYS_TO_SEARCH` business days from `req.date` and
    /// return the chronologically first acceptable slot.
    pub async fn suggest(&self, req: &SuggestRequest) -> Result<Suggestion, EngineError> {
        let start_date = parse_calendar_date(&req.date)?;
        let cfg = self.scheduler_config()?;
        let duration_ms = match req.duration_hours {
            Some(h) => slot_duration_ms(h)?,
            None => slot_duration_ms(cfg.default_duration_ms as f64 / HOUR_MS as f64)?,
        };
        let search = DaySearch {
            duration_ms,
            not_before: self.now() + SUGGESTION_LOOKAHEAD_MS,
            policy: &cfg.buffer_policy,
            requester: req.requester,
            tier: req.tier,
            rate_table: &cfg.rate_table,
            timezone: cfg.timezone,
        };
        let max = cfg.buffer_policy.max_buffers();

        for offset in 0..MAX_DAYS_TO_SEARCH {
            let Some(date) = start_date.checked_add_days(Days::new(offset as u64)) else {
                break;
            };
            let day = business_day_range_utc(date, cfg.timezone)?;
            if day.end <= search.not_before {
                continue;
            }
            // Neighbouring days' bookings can still violate a buffer here.
            let window = Span::new(day.start - max.after, day.end + max.before);
            let existing = self.active_bookings_in(window).await?;
            if let Some(slot) = search.first_slot(day, &existing) {
                debug!("suggested {date} slot after {offset} days, tier {}", slot.tier.name);
                metrics::counter!(crate::observability::SUGGESTIONS_TOTAL, "outcome" => "found")
                    .increment(1);
                return Ok(Suggestion::Found(slot));
            }
        }

        metrics::counter!(crate::observability::SUGGESTIONS_TOTAL, "outcome" => "not_found").increment(1);
        let duration_minutes = (duration_ms / MINUTE_MS) as u32;
        Ok(Suggestion::NotFound(match req.tier {
            TierPreference::Any => NotFoundReason::NoSlot { duration_minutes },
            tier => NotFoundReason::NoSlotAtTier { duration_minutes, tier },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::RuleId;
    use chrono::Weekday;

    use crate::engine::tiers::RateTier;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;

    fn booking(owner: Ulid, start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            request_number: String::new(),
            owner_id: owner,
            resource_id: None,
            start,
            duration_minutes: ((end - start) / M) as u32,
            status: BookingStatus::Scheduled,
            priority: Priority::Normal,
            urgency: Urgency::Routine,
            title: None,
            notes: None,
            deleted: false,
            created_at: 0,
        }
    }

    fn rejected_rule(r: Result<Ms, EngineError>) -> Option<RuleId> {
        match r {
            Err(EngineError::Rejected(rej)) => Some(rej.rule),
            _ => None,
        }
    }

    #[test]
    fn durations_must_be_half_hours_within_bounds() {
        assert_eq!(slot_duration_ms(1.0).unwrap(), H);
        assert_eq!(slot_duration_ms(1.5).unwrap(), 90 * M);
        assert_eq!(slot_duration_ms(6.0).unwrap(), 6 * H);
        assert_eq!(rejected_rule(slot_duration_ms(0.5)), Some(RuleId::DurationTooShort));
        assert_eq!(rejected_rule(slot_duration_ms(7.0)), Some(RuleId::DurationTooLong));
        assert!(matches!(slot_duration_ms(1.25), Err(EngineError::Validation { .. })));
        assert!(matches!(slot_duration_ms(f64::NAN), Err(EngineError::Validation { .. })));
    }

    #[test]
    fn first_slot_skips_blocked_grid_points() {
        let policy = BufferPolicy::AsymmetricSelfExempt { before: 2 * H, after: H };
        let table = RateTable::default();
        let search = DaySearch {
            duration_ms: H,
            not_before: 0,
            policy: &policy,
            requester: None,
            tier: TierPreference::Any,
            rate_table: &table,
            timezone: chrono_tz::UTC,
        };
        let day = Span::new(0, 24 * H);
        // 02:00–03:00 booked: needs end <= 00:00 before it, start >= 04:00 after.
        let existing = vec![booking(Ulid::new(), 2 * H, 3 * H)];
        let slot = search.first_slot(day, &existing).unwrap();
        assert_eq!(slot.span, Span::new(4 * H, 5 * H));
        assert_eq!(slot.tier.level, 0);
    }

    #[test]
    fn first_slot_respects_day_end_and_lookahead() {
        let policy = BufferPolicy::AsymmetricSelfExempt { before: 0, after: 0 };
        let table = RateTable::default();
        let search = DaySearch {
            duration_ms: 2 * H,
            not_before: 22 * H + 30 * M,
            policy: &policy,
            requester: None,
            tier: TierPreference::Any,
            rate_table: &table,
            timezone: chrono_tz::UTC,
        };
        // Only 22:30 and later qualify; 22:30 + 2h runs past midnight.
        assert!(search.first_slot(Span::new(0, 24 * H), &[]).is_none());
    }

    #[test]
    fn tier_preference_filters_grid_points() {
        let policy = BufferPolicy::AsymmetricSelfExempt { before: 0, after: 0 };
        // 1970-01-01 was a Thursday.
        let table = RateTable::new(vec![RateTier {
            name: "Emergency".into(),
            level: 2,
            day_of_week: Weekday::Thu,
            start_minute: 20 * 60,
            end_minute: 24 * 60,
            multiplier: 2.0,
            color: None,
        }])
        .unwrap();
        let mut search = DaySearch {
            duration_ms: H,
            not_before: 0,
            policy: &policy,
            requester: None,
            tier: TierPreference::Emergency,
            rate_table: &table,
            timezone: chrono_tz::UTC,
        };
        let day = Span::new(0, 24 * H);
        let slot = search.first_slot(day, &[]).unwrap();
        assert_eq!(slot.span.start, 20 * H);
        assert_eq!(slot.tier.name, "Emergency");

        search.tier = TierPreference::Premium;
        assert!(search.first_slot(day, &[]).is_none());
    }

    #[test]
    fn not_found_messages_name_the_tier() {
        let plain = NotFoundReason::NoSlot { duration_minutes: 120 };
        let tiered = NotFoundReason::NoSlotAtTier { duration_minutes: 90, tier: TierPreference::Premium };
        assert_eq!(plain.to_string(), "no available slot of 2 hours in the next 30 days");
        assert_eq!(tiered.to_string(), "no available slot of 1.5 hours at tier premium in the next 30 days");
    }
}
