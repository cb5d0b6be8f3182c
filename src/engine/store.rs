use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// The shared booking calendar. One calendar for the whole system: conflicts
/// are checked across every resource and owner.
#[derive(Debug, Default)]
pub struct Calendar {
    /// All bookings including final and deleted ones, sorted by `start`.
    bookings: Vec<Booking>,
    /// Highest request sequence issued per year.
    sequences: HashMap<i32, u32>,
}

pub const REQUEST_PREFIX: &str = "SR";

pub fn format_request_number(year: i32, sequence: u32) -> String {
    format!("{REQUEST_PREFIX}-{year}-{sequence:06}")
}

/// `SR-2025-000042` → `(2025, 42)`.
pub fn parse_request_number(s: &str) -> Option<(i32, u32)> {
    let mut parts = s.splitn(3, '-');
    if parts.next()? != REQUEST_PREFIX {
        return None;
    }
    let year = parts.next()?.parse().ok()?;
    let seq = parts.next()?.parse().ok()?;
    Some((year, seq))
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    /// Insert maintaining sort order by start.
    pub fn insert(&mut self, booking: Booking) {
        if let Some((year, seq)) = parse_request_number(&booking.request_number) {
            let entry = self.sequences.entry(year).or_insert(0);
            *entry = (*entry).max(seq);
        }
        let pos = self
            .bookings
            .binary_search_by_key(&booking.start, |b| b.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    pub fn find_by_request_number(&self, request_number: &str) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.request_number == request_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter()
    }

    /// Next request number for `year`. Not reserved until the booking carrying
    /// it is inserted; callers hold the write lock in between.
    pub fn next_request_number(&self, year: i32) -> String {
        let seq = self.sequences.get(&year).copied().unwrap_or(0) + 1;
        format_request_number(year, seq)
    }

    /// Blocking bookings whose real window overlaps `query`, in start order.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.is_blocking() && b.end() > query.start)
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => self.insert(booking.clone()),
            Event::BookingStatusChanged { id, status } => {
                if let Some(b) = self.get_mut(id) {
                    b.status = *status;
                }
            }
            Event::BookingDeleted { id } => {
                if let Some(b) = self.get_mut(id) {
                    b.deleted = true;
                }
            }
        }
    }

    /// Minimal event list that recreates this calendar.
    pub fn snapshot_events(&self) -> Vec<Event> {
        self.bookings
            .iter()
            .map(|b| Event::BookingCreated { booking: b.clone() })
            .collect()
    }
}
