use ulid::Ulid;

use crate::engine::timezone::format_utc;
use crate::model::{Ms, Span};

/// Which scheduling rule rejected a candidate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleId {
    MinimumAdvance,
    DurationTooShort,
    DurationTooLong,
    Overlap,
    BufferAfter,
    BufferBefore,
}

impl RuleId {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleId::MinimumAdvance => "MinimumAdvance",
            RuleId::DurationTooShort => "DurationTooShort",
            RuleId::DurationTooLong => "DurationTooLong",
            RuleId::Overlap => "Overlap",
            RuleId::BufferAfter => "BufferAfter",
            RuleId::BufferBefore => "BufferBefore",
        }
    }
}

/// What the caller can do about a rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionDetail {
    EarliestStart(Ms),
    LatestEnd(Ms),
    ConflictingWindow { booking_id: Ulid, span: Span },
    DurationBounds { actual_ms: Ms, min_ms: Ms, max_ms: Ms },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub rule: RuleId,
    pub detail: RejectionDetail,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: ", self.rule.as_str())?;
        match &self.detail {
            RejectionDetail::EarliestStart(t) => {
                write!(f, "earliest acceptable start is {}", format_utc(*t))
            }
            RejectionDetail::LatestEnd(t) => {
                write!(f, "latest acceptable end is {}", format_utc(*t))
            }
            RejectionDetail::ConflictingWindow { booking_id, span } => write!(
                f,
                "overlaps booking {booking_id} [{}, {})",
                format_utc(span.start),
                format_utc(span.end)
            ),
            RejectionDetail::DurationBounds { actual_ms, min_ms, max_ms } => write!(
                f,
                "duration {} min outside [{}, {}] min",
                actual_ms / 60_000,
                min_ms / 60_000,
                max_ms / 60_000
            ),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    InvalidDateFormat(String),
    InvalidTime(String),
    Validation { field: &'static str, reason: String },
    Rejected(Rejection),
    ConfigurationUnavailable(String),
    NotFound(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDateFormat(s) => {
                write!(f, "invalid date format: {s} (expected YYYY-MM-DD)")
            }
            EngineError::InvalidTime(s) => write!(f, "invalid time: {s}"),
            EngineError::Validation { field, reason } => write!(f, "invalid {field}: {reason}"),
            EngineError::Rejected(r) => write!(f, "rejected by {r}"),
            EngineError::ConfigurationUnavailable(s) => {
                write!(f, "scheduler configuration unavailable: {s}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::Rejected(r)
    }
}
