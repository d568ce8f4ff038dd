use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Frames for one caller's events. Nothing is produced unless every event
/// encodes.
pub fn encode_events(events: &[Event]) -> io::Result<Vec<u8>> {
    let mut frames = Vec::new();
    for event in events {
        encode_event(&mut frames, event)?;
    }
    Ok(frames)
}

/// Events recovered from a log plus the length of its valid prefix.
struct Recovered {
    events: Vec<Event>,
    valid_len: u64,
    file_len: u64,
}

/// Append-only write-ahead log of booking events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated or corrupt tail (crash mid-write) is dropped on replay and
///   cut off by `recover` before new appends land behind it.
/// - A failed group write is rolled back to the last synced length, so the
///   file only ever holds events whose writers were told they succeeded.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Length of the file after the last successful sync.
    synced_len: u64,
    appends_since_compact: u64,
    /// Set when a rollback itself failed; every later append is refused.
    poisoned: bool,
    #[cfg(test)]
    fail_next_write_after: Option<usize>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            synced_len,
            appends_since_compact: 0,
            poisoned: false,
            #[cfg(test)]
            fail_next_write_after: None,
        })
    }

    /// Replay `path`, cut off any torn tail, and open it for appends.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let recovered = read_log(path)?;
        if recovered.valid_len < recovered.file_len {
            warn!(
                "{}: truncating {} unreadable tail bytes after {} events",
                path.display(),
                recovered.file_len - recovered.valid_len,
                recovered.events.len()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(recovered.valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, recovered.events))
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        let frames = encode_events(std::slice::from_ref(event))?;
        self.append_frames(&frames, 1)
    }

    /// Write pre-encoded frames for `count` events and fsync them. On failure
    /// the file is truncated back to its last synced length.
    pub fn append_frames(&mut self, frames: &[u8], count: u64) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL refused appends after a failed rollback"));
        }
        match self.write_synced(frames) {
            Ok(()) => {
                self.synced_len += frames.len() as u64;
                self.appends_since_compact += count;
                Ok(())
            }
            Err(e) => {
                self.roll_back();
                Err(e)
            }
        }
    }

    fn write_synced(&mut self, frames: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        {
            if let Some(n) = self.fail_next_write_after.take() {
                self.file.write_all(&frames[..n.min(frames.len())])?;
                return Err(io::Error::other("injected write failure"));
            }
        }
        self.file.write_all(frames)?;
        self.file.sync_all()
    }

    fn roll_back(&mut self) {
        match self.file.set_len(self.synced_len).and_then(|()| self.file.sync_all()) {
            Ok(()) => warn!(
                "{}: rolled back failed write to {} bytes",
                self.path.display(),
                self.synced_len
            ),
            Err(e) => {
                error!("{}: rollback failed, refusing further appends: {e}", self.path.display());
                self.poisoned = true;
            }
        }
    }

    /// Make the next write put only `n` bytes on disk and then fail.
    #[cfg(test)]
    pub fn fail_next_write_after(&mut self, n: usize) {
        self.fail_next_write_after = Some(n);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the WAL and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.file = file;
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay all valid events. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let recovered = read_log(path)?;
        if recovered.valid_len < recovered.file_len {
            warn!(
                "{}: ignoring {} unreadable tail bytes",
                path.display(),
                recovered.file_len - recovered.valid_len
            );
        }
        Ok(recovered.events)
    }
}

fn read_log(path: &Path) -> io::Result<Recovered> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Recovered {
                events: Vec::new(),
                valid_len: 0,
                file_len: 0,
            });
        }
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        // A length running past the end of the file is a torn frame.
        if valid_len + 8 + len as u64 > file_len {
            break;
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }

        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        valid_len += 8 + len as u64;
    }

    Ok(Recovered {
        events,
        valid_len,
        file_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AvailabilityWindow, Service, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(id: Ulid) -> Event {
        Event::ServiceCreated {
            service: Service {
                id,
                name: Some("Checkup".into()),
                session_minutes: 15,
                active: true,
            },
        }
    }

    fn window_added(service_id: Ulid) -> Event {
        Event::WindowAdded {
            window: AvailabilityWindow {
                id: Ulid::new(),
                service_id,
                span: Span::new(1_000, 2_000),
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let sid = Ulid::new();
        let events = vec![created(sid), window_added(sid)];

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
    fn replay_drops_truncated_tail() {
        let path = tmp_path("truncation.wal");
        let event = created(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let event = Event::ServiceDeleted { id: Ulid::new() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let sid = Ulid::new();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(sid)).unwrap();
            for _ in 0..10 {
                let added = window_added(sid);
                let Event::WindowAdded { window } = &added else { unreachable!() };
                let removed = Event::WindowRemoved { id: window.id, service_id: sid };
                wal.append(&added).unwrap();
                wal.append(&removed).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let next = window_added(sid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&[created(sid)]).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&next).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![created(sid), next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn grouped_frames_count_every_event() {
        let path = tmp_path("grouped_frames.wal");
        let events: Vec<Event> = (0..5).map(|_| created(Ulid::new())).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            let frames = encode_events(&events).unwrap();
            wal.append_frames(&frames, events.len() as u64).unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn failed_write_is_rolled_back() {
        let path = tmp_path("rollback.wal");
        let kept = created(Ulid::new());
        let lost = created(Ulid::new());
        let next = created(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            let synced = fs::metadata(&path).unwrap().len();

            wal.fail_next_write_after(7);
            assert!(wal.append(&lost).is_err());
            assert_eq!(fs::metadata(&path).unwrap().len(), synced);
            assert_eq!(wal.appends_since_compact(), 1);

            wal.append(&next).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover.wal");
        let first = created(Ulid::new());
        let second = created(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 11]).unwrap();
        }

        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&second).unwrap();
        }

        // Without the cut, `second` would sit behind garbage and be lost.
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }
}
