use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). Every stored instant uses this type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// A booking with no explicit end lasts this long.
pub const DEFAULT_BOOKING_DURATION_MINUTES: u32 = 60;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Submitted,
    Scheduled,
    InProgress,
    OnHold,
    Completed,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    /// Final bookings no longer occupy the calendar.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Submitted => "submitted",
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::OnHold => "on_hold",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "submitted" | "pending" => Some(BookingStatus::Submitted),
            "scheduled" => Some(BookingStatus::Scheduled),
            "in_progress" => Some(BookingStatus::InProgress),
            "on_hold" => Some(BookingStatus::OnHold),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "rejected" => Some(BookingStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" | "medium" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urgency {
    #[default]
    Routine,
    Urgent,
    Emergency,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Routine => "routine",
            Urgency::Urgent => "urgent",
            Urgency::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "routine" => Some(Urgency::Routine),
            "urgent" => Some(Urgency::Urgent),
            "emergency" => Some(Urgency::Emergency),
            _ => None,
        }
    }
}

/// A claimed window on the shared calendar ("service request").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub request_number: String,
    pub owner_id: Ulid,
    /// `None` = unassigned.
    pub resource_id: Option<Ulid>,
    pub start: Ms,
    pub duration_minutes: u32,
    pub status: BookingStatus,
    pub priority: Priority,
    pub urgency: Urgency,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub deleted: bool,
    pub created_at: Ms,
}

impl Booking {
    pub fn end(&self) -> Ms {
        self.start + self.duration_minutes as Ms * MINUTE_MS
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }

    /// Still consumes calendar space.
    pub fn is_blocking(&self) -> bool {
        !self.deleted && !self.status.is_final()
    }
}

/// Caller-supplied window in one of the two accepted shapes. Converted to the
/// canonical `start + duration` form by the engine at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowInput {
    /// Absolute start; at most one of `end` / `duration_minutes`.
    Absolute {
        start: Ms,
        end: Option<Ms>,
        duration_minutes: Option<u32>,
    },
    /// Business-local date and minute-of-day bounds.
    Local {
        date: String,
        start_minute: u16,
        end_minute: Option<u16>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingMetadata {
    pub title: Option<String>,
    pub notes: Option<String>,
    pub priority: Option<Priority>,
    pub urgency: Option<Urgency>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub owner_id: Ulid,
    pub resource_id: Option<Ulid>,
    pub window: WindowInput,
    pub metadata: BookingMetadata,
}

/// WAL record format. `BookingCreated` carries the full record so a
/// compacted log is just one `BookingCreated` per booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated { booking: Booking },
    BookingStatusChanged { id: Ulid, status: BookingStatus },
    BookingDeleted { id: Ulid },
}

// ── Query result types ───────────────────────────────────────────

/// A booking as listed for one business day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayBooking {
    pub booking: Booking,
    pub start: Ms,
    pub end: Ms,
    /// The booking belongs to the caller.
    pub is_own: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(start: Ms, minutes: u32) -> Booking {
        Booking {
            id: Ulid::new(),
            request_number: "SR-2025-000001".into(),
            owner_id: Ulid::new(),
            resource_id: None,
            start,
            duration_minutes: minutes,
            status: BookingStatus::Submitted,
            priority: Priority::default(),
            urgency: Urgency::default(),
            title: None,
            notes: None,
            deleted: false,
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn booking_end_is_derived_from_duration() {
        let b = sample(10 * HOUR_MS, 90);
        assert_eq!(b.end(), 11 * HOUR_MS + 30 * MINUTE_MS);
        assert_eq!(b.span(), Span::new(10 * HOUR_MS, 11 * HOUR_MS + 30 * MINUTE_MS));
    }

    #[test]
    fn final_and_deleted_bookings_do_not_block() {
        let mut b = sample(0, 60);
        assert!(b.is_blocking());
        for status in [BookingStatus::Completed, BookingStatus::Cancelled, BookingStatus::Rejected] {
            b.status = status;
            assert!(!b.is_blocking(), "{status:?} should not block");
        }
        b.status = BookingStatus::OnHold;
        assert!(b.is_blocking());
        b.deleted = true;
        assert!(!b.is_blocking());
    }

    #[test]
    fn status_names_parse_back() {
        for status in [
            BookingStatus::Submitted,
            BookingStatus::Scheduled,
            BookingStatus::InProgress,
            BookingStatus::OnHold,
            BookingStatus::Completed,
            BookingStatus::Cancelled,
            BookingStatus::Rejected,
        ] {
            assert_eq!(BookingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BookingStatus::parse("Pending"), Some(BookingStatus::Submitted));
        assert_eq!(BookingStatus::parse("archived"), None);
    }

    #[test]
    fn metadata_defaults() {
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Urgency::default(), Urgency::Routine);
        assert_eq!(Priority::parse("HIGH"), Some(Priority::High));
        assert_eq!(Urgency::parse("emergency"), Some(Urgency::Emergency));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated { booking: sample(1_000, 120) };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
