use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::limits::*;
use crate::model::*;

use super::error::{Rejection, RejectionDetail, RuleId};
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// How much idle time an existing booking demands around a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Buffers {
    pub before: Ms,
    pub after: Ms,
}

/// Buffer strategy, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// One fixed buffer before and after every booking, whoever owns it.
    SymmetricUniversal { buffer: Ms },
    /// Separate before/after buffers, waived against the candidate owner's
    /// own bookings. Overlap with them is still a conflict.
    AsymmetricSelfExempt { before: Ms, after: Ms },
}

impl BufferPolicy {
    pub fn buffers_against(&self, existing_owner: Ulid, candidate_owner: Option<Ulid>) -> Buffers {
        match *self {
            BufferPolicy::SymmetricUniversal { buffer } => Buffers { before: buffer, after: buffer },
            BufferPolicy::AsymmetricSelfExempt { .. } if candidate_owner == Some(existing_owner) => {
                Buffers::default()
            }
            BufferPolicy::AsymmetricSelfExempt { before, after } => Buffers { before, after },
        }
    }

    /// Largest buffers the policy can demand; sizes repository lookups.
    pub fn max_buffers(&self) -> Buffers {
        match *self {
            BufferPolicy::SymmetricUniversal { buffer } => Buffers { before: buffer, after: buffer },
            BufferPolicy::AsymmetricSelfExempt { before, after } => Buffers { before, after },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BufferPolicy::SymmetricUniversal { .. } => "symmetric_universal",
            BufferPolicy::AsymmetricSelfExempt { .. } => "asymmetric_self_exempt",
        }
    }
}

/// A proposed window. `owner_id` is `None` for anonymous suggestion searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub span: Span,
    pub owner_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rules {
    pub minimum_advance_ms: Ms,
    pub buffer_policy: BufferPolicy,
}

impl From<&SchedulerConfig> for Rules {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            minimum_advance_ms: cfg.minimum_advance_ms,
            buffer_policy: cfg.buffer_policy,
        }
    }
}

/// Everything that can reject `span`: bookings ending within `after` before
/// it or starting within `before` after it.
pub fn lookup_window(span: &Span, policy: &BufferPolicy) -> Span {
    let max = policy.max_buffers();
    Span::new(span.start - max.after, span.end + max.before)
}

pub fn check_duration(duration_ms: Ms) -> Result<(), Rejection> {
    let detail = RejectionDetail::DurationBounds {
        actual_ms: duration_ms,
        min_ms: MIN_BOOKING_DURATION_MS,
        max_ms: MAX_BOOKING_DURATION_MS,
    };
    if duration_ms < MIN_BOOKING_DURATION_MS {
        return Err(Rejection { rule: RuleId::DurationTooShort, detail });
    }
    if duration_ms > MAX_BOOKING_DURATION_MS {
        return Err(Rejection { rule: RuleId::DurationTooLong, detail });
    }
    Ok(())
}

/// Overlap and buffer rules only. `existing` should be in start order so the
/// earliest conflict is reported; non-blocking entries are ignored.
pub fn check_against_existing(
    candidate: &Candidate,
    existing: &[Booking],
    policy: &BufferPolicy,
) -> Result<(), Rejection> {
    let span = candidate.span;
    for b in existing.iter().filter(|b| b.is_blocking()) {
        let theirs = b.span();
        if span.overlaps(&theirs) {
            return Err(Rejection {
                rule: RuleId::Overlap,
                detail: RejectionDetail::ConflictingWindow { booking_id: b.id, span: theirs },
            });
        }
        let buffers = policy.buffers_against(b.owner_id, candidate.owner_id);
        if span.start >= theirs.end && span.start < theirs.end + buffers.after {
            return Err(Rejection {
                rule: RuleId::BufferAfter,
                detail: RejectionDetail::EarliestStart(theirs.end + buffers.after),
            });
        }
        if span.end > theirs.start - buffers.before && span.end <= theirs.start {
            return Err(Rejection {
                rule: RuleId::BufferBefore,
                detail: RejectionDetail::LatestEnd(theirs.start - buffers.before),
            });
        }
    }
    Ok(())
}

/// Full rule chain, first violation wins: minimum advance, duration, then
/// overlap / buffer-after / buffer-before per existing booking.
pub fn evaluate(
    candidate: &Candidate,
    existing: &[Booking],
    rules: &Rules,
    now: Ms,
) -> Result<(), Rejection> {
    let earliest = now + rules.minimum_advance_ms;
    if candidate.span.start < earliest {
        return Err(Rejection {
            rule: RuleId::MinimumAdvance,
            detail: RejectionDetail::EarliestStart(earliest),
        });
    }
    check_duration(candidate.span.duration_ms())?;
    check_against_existing(candidate, existing, &rules.buffer_policy)
}
