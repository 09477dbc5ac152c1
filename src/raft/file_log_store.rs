use super::log_store::{InMemoryLogEntryStore, LogEntryStore};
use super::{EntryPayload, LogEntry, TermIndex};
use crate::error::{Error, Result};
use bincode::config;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOG_MAGIC: u32 = 0x524C_4F47; // "RLOG"
const LOG_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 8;
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
const LOG_SUFFIX: &str = ".log";
const BOUNDARY_FILE: &str = "log.boundary";

struct ActiveSegment {
    first_index: u64,
    entries: u64,
    writer: BufWriter<File>,
}

struct Segments {
    /// First index of every segment file
    files: BTreeMap<u64, PathBuf>,
    active: Option<ActiveSegment>,
}

/// Replicated log persisted in segment files of checksummed frames.
///
/// Every file holds up to `entries_per_segment` entries and is named after its
/// first index. Entries are also kept in memory for reads. Compaction removes
/// whole files only.
pub struct FileLogEntryStore {
    dir: PathBuf,
    entries_per_segment: u64,
    memory: InMemoryLogEntryStore,
    segments: Mutex<Segments>,
}

impl FileLogEntryStore {
    /// Opens the log in `dir`, recovering all complete frames. A torn or corrupted
    /// tail is truncated.
    pub fn open(dir: impl AsRef<Path>, entries_per_segment: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let boundary = read_boundary(&dir.join(BOUNDARY_FILE))?;
        let memory = InMemoryLogEntryStore::new();
        memory.reset(boundary)?;

        let mut files = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(first) = segment_index(&path) {
                files.insert(first, path);
            }
        }

        let mut recovered = 0usize;
        let mut truncated = false;
        let mut obsolete = Vec::new();
        for (first, path) in &files {
            if truncated {
                obsolete.push(*first);
                continue;
            }
            let (entries, valid_len, complete) = read_segment(path)?;
            for entry in entries {
                if entry.index <= boundary.index {
                    continue;
                }
                if let Err(e) = memory.append(std::slice::from_ref(&entry)) {
                    warn!("{}: stopping log recovery: {}", path.display(), e);
                    truncated = true;
                    break;
                }
                recovered += 1;
            }
            if !complete {
                truncated = true;
                if valid_len < HEADER_SIZE {
                    warn!("{}: removing segment without header", path.display());
                    obsolete.push(*first);
                } else {
                    warn!("{}: truncating torn tail at {}", path.display(), valid_len);
                    OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
                }
            }
        }
        for first in obsolete {
            if let Some(path) = files.remove(&first) {
                fs::remove_file(path)?;
            }
        }

        // segments entirely below the boundary are leftovers of an interrupted compaction
        let stale: Vec<u64> = files
            .keys()
            .zip(files.keys().skip(1))
            .filter(|(_, next)| **next <= boundary.index + 1)
            .map(|(first, _)| *first)
            .collect();
        for first in stale {
            if let Some(path) = files.remove(&first) {
                fs::remove_file(path)?;
            }
        }

        info!(
            "opened raft log in {}: {} entries recovered, last {}",
            dir.display(),
            recovered,
            memory.last_log()
        );
        Ok(Self {
            dir,
            entries_per_segment: entries_per_segment.max(1),
            memory,
            segments: Mutex::new(Segments {
                files,
                active: None,
            }),
        })
    }

    fn segment_path(&self, first_index: u64) -> PathBuf {
        self.dir.join(format!("{:020}{}", first_index, LOG_SUFFIX))
    }

    fn write_entries(&self, segments: &mut Segments, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            let needs_roll = match &segments.active {
                Some(active) => active.entries >= self.entries_per_segment,
                None => true,
            };
            if needs_roll {
                self.roll(segments, entry.index)?;
            }
            if let Some(active) = segments.active.as_mut() {
                write_frame(&mut active.writer, entry)?;
                active.entries += 1;
            }
        }
        if let Some(active) = segments.active.as_mut() {
            active.writer.flush()?;
            active.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Continues the last segment file when it has room, starts a new one otherwise.
    fn roll(&self, segments: &mut Segments, next_index: u64) -> Result<()> {
        if let Some(mut active) = segments.active.take() {
            active.writer.flush()?;
        }
        if let Some((first, path)) = segments.files.iter().next_back() {
            let used = next_index.saturating_sub(*first);
            if *first < next_index && used < self.entries_per_segment {
                let file = OpenOptions::new().append(true).open(path)?;
                segments.active = Some(ActiveSegment {
                    first_index: *first,
                    entries: used,
                    writer: BufWriter::new(file),
                });
                return Ok(());
            }
        }
        let path = self.segment_path(next_index);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&LOG_MAGIC.to_le_bytes())?;
        writer.write_all(&LOG_VERSION.to_le_bytes())?;
        debug!("created raft log segment {}", path.display());
        segments.files.insert(next_index, path);
        segments.active = Some(ActiveSegment {
            first_index: next_index,
            entries: 0,
            writer,
        });
        Ok(())
    }

    fn write_boundary(&self, boundary: TermIndex) -> Result<()> {
        let path = self.dir.join(BOUNDARY_FILE);
        let temp = self.dir.join(format!("{}.temp", BOUNDARY_FILE));
        let data = bincode::encode_to_vec(boundary, config::standard())?;
        {
            let mut file = File::create(&temp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(temp, path)?;
        Ok(())
    }
}

impl LogEntryStore for FileLogEntryStore {
    fn boundary(&self) -> TermIndex {
        self.memory.boundary()
    }

    fn last_log_index(&self) -> u64 {
        self.memory.last_log_index()
    }

    fn last_log(&self) -> TermIndex {
        self.memory.last_log()
    }

    fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        self.memory.entry(index)
    }

    fn term_at(&self, index: u64) -> Result<Option<u64>> {
        self.memory.term_at(index)
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut segments = self.segments.lock();
        self.memory.append(entries)?;
        self.write_entries(&mut segments, entries)
    }

    fn create_entry(&self, term: u64, payload: EntryPayload) -> Result<LogEntry> {
        let mut segments = self.segments.lock();
        let entry = self.memory.create_entry(term, payload)?;
        self.write_entries(&mut segments, std::slice::from_ref(&entry))?;
        Ok(entry)
    }

    fn delete_from(&self, index: u64) -> Result<()> {
        let mut segments = self.segments.lock();
        segments.active = None;
        self.memory.delete_from(index)?;

        let removed: Vec<u64> = segments.files.range(index..).map(|(k, _)| *k).collect();
        for first in removed {
            if let Some(path) = segments.files.remove(&first) {
                fs::remove_file(path)?;
            }
        }
        // rewrite the segment that now ends before `index`
        if let Some((first, path)) = segments.files.iter().next_back().map(|(k, v)| (*k, v.clone())) {
            let kept: Vec<LogEntry> = self
                .memory
                .entries_from(first)
                .into_iter()
                .filter(|e| e.index < index)
                .collect();
            let temp = path.with_extension("temp");
            {
                let mut writer = BufWriter::new(File::create(&temp)?);
                writer.write_all(&LOG_MAGIC.to_le_bytes())?;
                writer.write_all(&LOG_VERSION.to_le_bytes())?;
                for entry in &kept {
                    write_frame(&mut writer, entry)?;
                }
                writer.flush()?;
                writer.get_ref().sync_data()?;
            }
            fs::rename(temp, &path)?;
        }
        Ok(())
    }

    fn compact_to(&self, index: u64) -> Result<()> {
        let mut segments = self.segments.lock();
        let active_first = segments.active.as_ref().map(|a| a.first_index);
        let firsts: Vec<u64> = segments.files.keys().copied().collect();
        let mut compacted_to = None;
        for (first, next_first) in firsts.iter().zip(firsts.iter().skip(1)) {
            let last_in_segment = next_first - 1;
            if last_in_segment > index || Some(*first) == active_first {
                break;
            }
            compacted_to = Some((*first, last_in_segment));
        }
        let Some((_, last)) = compacted_to else {
            return Ok(());
        };
        let Some(term) = self.memory.term_at(last)? else {
            return Ok(());
        };
        let boundary = TermIndex::new(term, last);
        self.write_boundary(boundary)?;
        self.memory.compact_to(last)?;

        let removed: Vec<u64> = segments.files.range(..=last).map(|(k, _)| *k).collect();
        for first in removed {
            if let Some(path) = segments.files.remove(&first) {
                fs::remove_file(path)?;
            }
        }
        debug!("compacted raft log in {} to {}", self.dir.display(), boundary);
        Ok(())
    }

    fn reset(&self, boundary: TermIndex) -> Result<()> {
        let mut segments = self.segments.lock();
        segments.active = None;
        self.write_boundary(boundary)?;
        for (_, path) in std::mem::take(&mut segments.files) {
            fs::remove_file(path)?;
        }
        self.memory.reset(boundary)
    }
}

fn segment_index(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(LOG_SUFFIX)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn read_boundary(path: &Path) -> Result<TermIndex> {
    match fs::read(path) {
        Ok(data) => {
            let (boundary, _): (TermIndex, usize) =
                bincode::decode_from_slice(&data, config::standard())?;
            Ok(boundary)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(TermIndex::default()),
        Err(e) => Err(e.into()),
    }
}

/// Frame layout: length u32, crc32 u32, bincode entry.
fn write_frame(writer: &mut impl Write, entry: &LogEntry) -> Result<()> {
    let data = bincode::encode_to_vec(entry, config::standard())?;
    let checksum = crc32fast::hash(&data);
    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(&data)?;
    Ok(())
}

/// Reads all intact frames. Returns the entries, the length of the valid
/// prefix and whether the whole file was valid.
fn read_segment(path: &Path) -> Result<(Vec<LogEntry>, u64, bool)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut header = [0u8; HEADER_SIZE as usize];
    if reader.read_exact(&mut header).is_err() {
        return Ok((Vec::new(), 0, false));
    }
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != LOG_MAGIC {
        return Err(Error::InvalidSegment {
            segment: segment_index(path).unwrap_or_default(),
            reason: "invalid raft log magic".to_string(),
        });
    }

    let mut entries = Vec::new();
    let mut valid_len = HEADER_SIZE;
    while valid_len < file_len {
        let mut frame_header = [0u8; 8];
        if reader.read_exact(&mut frame_header).is_err() {
            break;
        }
        let len = u32::from_le_bytes([frame_header[0], frame_header[1], frame_header[2], frame_header[3]])
            as usize;
        let checksum =
            u32::from_le_bytes([frame_header[4], frame_header[5], frame_header[6], frame_header[7]]);
        if len > MAX_FRAME_SIZE {
            break;
        }
        let mut data = vec![0u8; len];
        if reader.read_exact(&mut data).is_err() || crc32fast::hash(&data) != checksum {
            break;
        }
        match bincode::decode_from_slice::<LogEntry, _>(&data, config::standard()) {
            Ok((entry, _)) => entries.push(entry),
            Err(_) => break,
        }
        valid_len += 8 + len as u64;
    }
    Ok((entries, valid_len, valid_len == file_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn payload(i: u64) -> EntryPayload {
        EntryPayload::Serialized {
            entry_type: "test".to_string(),
            data: i.to_be_bytes().to_vec(),
        }
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileLogEntryStore::open(dir.path(), 4).unwrap();
            for i in 0..10 {
                store.create_entry(1, payload(i)).unwrap();
            }
        }
        let store = FileLogEntryStore::open(dir.path(), 4).unwrap();
        assert_eq!(store.last_log(), TermIndex::new(1, 10));
        assert_eq!(store.entry(7).unwrap().unwrap().payload, payload(6));
        assert_eq!(store.create_entry(2, EntryPayload::Noop).unwrap().index, 11);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileLogEntryStore::open(dir.path(), 100).unwrap();
            for i in 0..3 {
                store.create_entry(1, payload(i)).unwrap();
            }
        }
        let path = dir.path().join(format!("{:020}{}", 1, LOG_SUFFIX));
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

        let store = FileLogEntryStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.last_log_index(), 2);
        assert_eq!(store.create_entry(1, payload(9)).unwrap().index, 3);
        drop(store);

        let store = FileLogEntryStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.last_log_index(), 3);
        assert_eq!(store.entry(3).unwrap().unwrap().payload, payload(9));
    }

    #[test]
    fn test_compaction_removes_whole_segments() {
        let dir = TempDir::new().unwrap();
        let store = FileLogEntryStore::open(dir.path(), 4).unwrap();
        for i in 0..10 {
            store.create_entry(1, payload(i)).unwrap();
        }
        store.compact_to(6).unwrap();
        assert_eq!(store.first_log_index(), 5);
        assert_eq!(store.term_at(4).unwrap(), Some(1));
        drop(store);

        let store = FileLogEntryStore::open(dir.path(), 4).unwrap();
        assert_eq!(store.first_log_index(), 5);
        assert_eq!(store.last_log_index(), 10);
    }

    #[test]
    fn test_delete_from_rewrites_segment() {
        let dir = TempDir::new().unwrap();
        let store = FileLogEntryStore::open(dir.path(), 4).unwrap();
        for i in 0..10 {
            store.create_entry(1, payload(i)).unwrap();
        }
        store.delete_from(6).unwrap();
        store.create_entry(2, EntryPayload::Noop).unwrap();
        drop(store);

        let store = FileLogEntryStore::open(dir.path(), 4).unwrap();
        assert_eq!(store.last_log(), TermIndex::new(2, 6));
        assert_eq!(store.entry(5).unwrap().unwrap().term, 1);
    }
}
