use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame overhead around each payload: length prefix + CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Larger length prefixes are treated as corruption.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of scanning a WAL file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
    /// Bytes after the intact prefix (torn or corrupt frames).
    pub discarded_bytes: u64,
}

/// Append-only log of reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`.
/// A torn or corrupt tail is cut off at recovery, so later appends never
/// land behind unreadable bytes.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay `path`, truncate anything past the last intact frame, and open
    /// it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        if replay.discarded_bytes > 0 {
            tracing::warn!(
                "WAL {}: discarding {} trailing bytes after offset {}",
                path.display(),
                replay.discarded_bytes,
                replay.valid_len
            );
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(replay.valid_len)?;
        }
        let wal = Self::open(path)?;
        Ok((wal, replay.events))
    }

    /// Open (or create) the WAL file at `path` without replaying it.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single event and fsync. Tests only; the store batches with
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Not durable until `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `events`: write a temp file, fsync, rename
    /// over the live file, reopen.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact frame from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        while let Some((event, len)) = read_frame(&mut reader, replay.valid_len)? {
            replay.valid_len += FRAME_OVERHEAD + len;
            replay.events.push(event);
        }
        replay.discarded_bytes = total_len.saturating_sub(replay.valid_len);
        Ok(replay)
    }
}

/// Read one frame and its payload length; `None` on clean EOF, a truncated
/// frame, or a bad CRC. A frame that passes its CRC but does not decode is an
/// error: the bytes are intact, so cutting the log there would lose data.
fn read_frame(reader: &mut impl Read, offset: u64) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    let event = bincode::deserialize::<Event>(&payload).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("undecodable WAL frame at offset {offset}: {e}"),
        )
    })?;
    Ok(Some((event, len as u64)))
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::keys::{sanitize_identity, ReservationKey};
    use crate::model::Reservation;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservo_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn key(table: &str) -> ReservationKey {
        ReservationKey::from_parts(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(), "1:00 PM", table)
    }

    fn created(table: &str) -> Event {
        let key = key(table);
        Event::ReservationCreated {
            record: Reservation {
                booked_by: sanitize_identity("a.b@x.com"),
                name: "Ada".into(),
                contact: "5551234567".into(),
                guests: 2,
                table_number: key.table.clone(),
                date: key.date,
                slot: key.slot.clone(),
            },
            key,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            created("table1"),
            Event::ReservationDeleted { key: key("table1") },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert_eq!(replay.discarded_bytes, 0);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn replay_stops_at_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&created("table1")).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(replay.discarded_bytes > 0);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn intact_but_undecodable_frame_fails_recovery_without_truncating() {
        let path = tmp_path("undecodable.wal");
        {
            let garbage = [0xFFu8; 4];
            let mut f = File::create(&path).unwrap();
            f.write_all(&(garbage.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&garbage).unwrap();
            f.write_all(&crc32fast::hash(&garbage).to_le_bytes()).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created("table1")).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();

        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(Wal::recover(&path).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), len);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("torn_tail.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created("table1")).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap(); // half a frame
        }

        let (mut wal, events) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![created("table1")]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        // Without the truncation this append would be unreachable on replay.
        wal.append(&created("table2")).unwrap();
        drop(wal);
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![created("table1"), created("table2")]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&created("table1")).unwrap();
                wal.append(&Event::ReservationDeleted { key: key("table1") }).unwrap();
            }
            wal.append(&created("table2")).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&[created("table2")]).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&created("table1")).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![created("table2"), created("table1")]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = ["table1", "table2"].iter().map(|t| created(t)).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 2);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().events, events);
        let _ = fs::remove_file(&path);
    }
}
