use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next entry. `None` once the log ends or stops making sense.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only write-ahead log of catalog and reservation events.
///
/// Entry format: `[u32 LE: len][bincode: Event][u32 LE: crc32 of payload]`.
/// A torn or corrupt tail (crash mid-write) ends replay at the last good entry.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful `flush_sync`.
    durable_len: u64,
    /// Appends buffered since the last successful `flush_sync`.
    unflushed: u64,
    /// A failed rollback left bytes past `durable_len`.
    dirty_tail: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            unflushed: 0,
            dirty_tail: false,
        })
    }

    /// Append and fsync one event. Production goes through the group-commit
    /// writer (`append_buffered` + `flush_sync`).
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.dirty_tail {
            self.rollback()?;
        }
        encode_event(&mut self.writer, event)?;
        self.unflushed += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.durable_len = file.metadata()?.len();
        self.appends_since_compact += self.unflushed;
        self.unflushed = 0;
        Ok(())
    }

    /// Discard everything appended since the last successful `flush_sync`,
    /// including bytes a failed flush may already have pushed to the file.
    /// Until this succeeds, further appends retry it first.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.dirty_tail = true;
        self.unflushed = 0;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // `into_parts` drops the buffered bytes without writing them.
        let (_, _discarded) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.dirty_tail = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a snapshot to `<wal>.tmp` and fsync it. Slow; the WAL stays
    /// writable while this runs.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unflushed = 0;
        self.dirty_tail = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Replay every intact entry. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = decode_next(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BusinessSettings, StaffMember};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn business() -> Event {
        Event::BusinessSaved(BusinessSettings::new(Ulid::new()))
    }

    fn staff(business_id: Ulid, name: &str) -> Event {
        Event::StaffSaved(StaffMember {
            id: Ulid::new(),
            business_id,
            name: name.into(),
            active: true,
        })
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![business(), staff(Ulid::new(), "Mia")];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = business();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_rejects_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        {
            let payload = bincode::serialize(&business()).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_replaces_history() {
        let path = tmp_path("compaction.wal");
        let biz = Ulid::new();
        let snapshot = vec![Event::BusinessSaved(BusinessSettings::new(biz))];
        {
            let mut wal = Wal::open(&path).unwrap();
            for i in 0..20 {
                wal.append(&staff(biz, &format!("churn-{i}"))).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 20);
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);

            let after = staff(biz, "Noor");
            wal.append(&after).unwrap();
            let replayed = Wal::replay(&path).unwrap();
            assert_eq!(replayed.len(), 2);
            assert_eq!(replayed[0], snapshot[0]);
            assert_eq!(replayed[1], after);
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_drops_unacknowledged_batch() {
        let path = tmp_path("rollback.wal");
        let kept = business();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();

        wal.append_buffered(&business()).unwrap();
        wal.append_buffered(&business()).unwrap();
        // Part of the batch reaches the file, then a torn write follows.
        wal.writer.flush().unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0]).unwrap();
        }
        wal.rollback().unwrap();
        assert_eq!(wal.appends_since_compact(), 1);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone()]);

        let after = staff(Ulid::new(), "Noor");
        wal.append(&after).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_after_reopen_keeps_existing_log() {
        let path = tmp_path("rollback_reopen.wal");
        let first = business();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&business()).unwrap();
        wal.rollback().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..4).map(|_| business()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
