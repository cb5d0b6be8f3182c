use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// A single booking record is far below this; anything larger is a torn or
/// corrupt length prefix.
const MAX_FRAME_LEN: usize = 1 << 20;

fn compact_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

/// `[u32 len][bincode Event][u32 crc32]`, little endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// `Ok(None)` at a clean end of file or at the first torn/corrupt frame.
/// Otherwise the event and the frame's length on disk.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
        match reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }

    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok().map(|event| (event, len as u64 + 8)))
}

/// Append-only booking log. Owned by the engine's writer task; writes are
/// buffered and made durable in batches by [`Wal::flush_sync`].
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Not durable until the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `events` to the side file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact frame from the start of the log. A torn or corrupt tail
    /// (crash mid-write) ends the replay and is cut off the file, so later
    /// appends land directly after the last intact frame.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut consumed = 0u64;
        while let Some((event, frame_len)) = read_frame(&mut reader)? {
            consumed += frame_len;
            events.push(event);
        }
        if consumed < total {
            warn!("{}: truncating {} trailing bytes", path.display(), total - consumed);
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(consumed)?;
            file.sync_all()?;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fieldbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(start: Ms) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                request_number: "SR-2025-000001".into(),
                owner_id: Ulid::new(),
                resource_id: None,
                start,
                duration_minutes: 60,
                status: BookingStatus::Submitted,
                priority: Priority::Normal,
                urgency: Urgency::Routine,
                title: Some("Leaking tap".into()),
                notes: None,
                deleted: false,
                created_at: 0,
            },
        }
    }

    #[test]
    fn appended_events_replay_in_order() {
        let path = tmp_path("replay_order.wal");
        let first = created(HOUR_MS);
        let Event::BookingCreated { booking } = &first else { unreachable!() };
        let events = vec![
            first.clone(),
            Event::BookingStatusChanged { id: booking.id, status: BookingStatus::Scheduled },
            Event::BookingDeleted { id: booking.id },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let path = tmp_path("torn_tail.wal");
        let event = created(0);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn appends_after_torn_tail_survive_next_replay() {
        let path = tmp_path("torn_then_append.wal");
        let first = created(0);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        drop(f);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        let second = created(HOUR_MS);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn missing_file_replays_empty() {
        assert!(Wal::replay(&tmp_path("missing.wal")).unwrap().is_empty());
    }

    #[test]
    fn crc_mismatch_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&created(0)).unwrap();
        let mut f = File::create(&path).unwrap();
        f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&payload).unwrap();
        f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn absurd_length_prefix_stops_replay() {
        let path = tmp_path("huge_len.wal");
        let mut f = File::create(&path).unwrap();
        f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compaction_shrinks_log_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let keep = created(0);
        let Event::BookingCreated { booking } = &keep else { unreachable!() };
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&keep).unwrap();
        for _ in 0..10 {
            wal.append(&Event::BookingStatusChanged { id: booking.id, status: BookingStatus::OnHold })
                .unwrap();
            wal.append(&Event::BookingStatusChanged { id: booking.id, status: BookingStatus::Submitted })
                .unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        assert_eq!(wal.appends_since_compact(), 21);

        Wal::write_compact_file(&path, std::slice::from_ref(&keep)).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let later = created(5 * HOUR_MS);
        wal.append(&later).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, later]);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| created(i * HOUR_MS)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
