//! The file-backed write-ahead log of one replication group.
//!
//! Layout: `<wal-root>/<partId>/` holds segment files named by the index
//! of their first entry (`%016x.wal`). Each frame is
//! `len(u32 LE) || hash(u64 LE) || prost-encoded LogEntry`, where the hash
//! is the 64-bit fxhash of the payload. Replay stops at the first torn or
//! corrupt frame and truncates the file there, so a crash mid-append
//! loses at most the unacknowledged tail.
//!
//! The full live suffix of the log is also kept in memory; the group
//! serves reads (terms, replication batches) from memory and touches the
//! files only to append, truncate, and replay at open.

use super::{LogIndex, Term};
use byteorder::{ByteOrder, LittleEndian};
use proto_storage::raft::LogEntry;
use prost::Message;
use std::collections::VecDeque;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

const SEGMENT_BYTES_MAX: u64 = 64 << 20;
const FRAME_HEADER_LEN: usize = 4 + 8;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("wal i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("appended entry {got} does not follow last index {last}")]
    Gap { last: LogIndex, got: LogIndex },
}

pub type Result<T> = std::result::Result<T, WalError>;

struct Segment {
    first_index: LogIndex,
    path: PathBuf,
    file: std::fs::File,
    bytes: u64,
}

pub struct Wal {
    /// None runs the log purely in memory (`part_type=simple`, tests).
    dir: Option<PathBuf>,
    segments: Vec<Segment>,
    /// Live entries; `entries[0].index == first_index`.
    entries: VecDeque<LogEntry>,
    /// Index the next appended entry gets when the log is empty.
    next_index: LogIndex,
}

impl Wal {
    /// Open a log rooted at `dir`, replaying any existing segments.
    /// `start_index` seeds an empty log (1 for a fresh group, or
    /// `last_included + 1` after a snapshot install).
    pub fn open(dir: Option<&Path>, start_index: LogIndex) -> Result<Wal> {
        let mut wal = Wal {
            dir: dir.map(Path::to_path_buf),
            segments: Vec::new(),
            entries: VecDeque::new(),
            next_index: start_index,
        };
        let Some(dir) = dir else { return Ok(wal) };
        std::fs::create_dir_all(dir)?;

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "wal"))
            .collect();
        paths.sort();

        for path in paths {
            wal.replay_segment(&path)?;
        }
        if let Some(first) = wal.entries.front() {
            wal.next_index = first.index;
        }
        Ok(wal)
    }

    fn replay_segment(&mut self, path: &Path) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut at = 0usize;
        let mut good = 0usize;
        let mut first_index = None;
        while buf.len() - at >= FRAME_HEADER_LEN {
            let len = LittleEndian::read_u32(&buf[at..]) as usize;
            let hash = LittleEndian::read_u64(&buf[at + 4..]);
            let body_at = at + FRAME_HEADER_LEN;
            if buf.len() - body_at < len {
                break;
            }
            let body = &buf[body_at..body_at + len];
            if fxhash::hash64(body) != hash {
                break;
            }
            let Ok(entry) = LogEntry::decode(body) else {
                break;
            };
            first_index.get_or_insert(entry.index);
            self.entries.push_back(entry);
            at = body_at + len;
            good = at;
        }

        if good < buf.len() {
            tracing::warn!(
                path = %path.display(),
                dropped = buf.len() - good,
                "truncating torn wal tail"
            );
            file.set_len(good as u64)?;
        }
        file.seek(std::io::SeekFrom::End(0))?;

        self.segments.push(Segment {
            first_index: first_index.unwrap_or(self.next_index),
            path: path.to_path_buf(),
            file,
            bytes: good as u64,
        });
        Ok(())
    }

    pub fn first_index(&self) -> LogIndex {
        self.entries.front().map_or(self.next_index, |e| e.index)
    }

    /// Zero when the log holds no entries and starts at index one.
    pub fn last_index(&self) -> LogIndex {
        self.entries.back().map_or(self.next_index - 1, |e| e.index)
    }

    pub fn term_of(&self, index: LogIndex) -> Option<Term> {
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        let first = self.first_index();
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    /// Entries `[from, from + max)`, clamped to the live suffix.
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let first = self.first_index();
        if from < first {
            return Vec::new();
        }
        self.entries
            .iter()
            .skip((from - first) as usize)
            .take(max)
            .cloned()
            .collect()
    }

    /// Append entries, which must follow the current last index
    /// contiguously.
    pub fn append(&mut self, batch: &[LogEntry]) -> Result<()> {
        for entry in batch {
            let want = self.last_index() + 1;
            if entry.index != want {
                return Err(WalError::Gap {
                    last: want - 1,
                    got: entry.index,
                });
            }
            self.write_frame(entry)?;
            self.entries.push_back(entry.clone());
        }
        if let Some(segment) = self.segments.last_mut() {
            segment.file.sync_data()?;
        }
        Ok(())
    }

    fn write_frame(&mut self, entry: &LogEntry) -> Result<()> {
        if self.dir.is_none() {
            return Ok(());
        }
        let rotate = match self.segments.last() {
            None => true,
            Some(segment) => segment.bytes >= SEGMENT_BYTES_MAX,
        };
        if rotate {
            self.rotate_segment(entry.index)?;
        }

        let body = entry.encode_to_vec();
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        let mut header = [0u8; FRAME_HEADER_LEN];
        LittleEndian::write_u32(&mut header[..4], body.len() as u32);
        LittleEndian::write_u64(&mut header[4..], fxhash::hash64(&body));
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&body);

        let segment = self.segments.last_mut().expect("rotate ensured a segment");
        segment.file.write_all(&frame)?;
        segment.bytes += frame.len() as u64;
        Ok(())
    }

    fn rotate_segment(&mut self, first_index: LogIndex) -> Result<()> {
        let dir = self.dir.as_ref().expect("caller checked durability");
        let path = dir.join(format!("{first_index:016x}.wal"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        self.segments.push(Segment {
            first_index,
            path,
            file,
            bytes: 0,
        });
        Ok(())
    }

    /// Drop the suffix `[index, ..]` after a consistency-check conflict.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        let first = self.first_index();
        if index > self.last_index() {
            return Ok(());
        }
        let keep = index.saturating_sub(first) as usize;
        self.entries.truncate(keep);
        if self.entries.is_empty() {
            self.next_index = first.min(index);
        }

        if self.dir.is_some() {
            // Drop whole segments past the cut, then rewrite the boundary
            // segment from the retained entries.
            while let Some(segment) = self.segments.last() {
                if segment.first_index >= index {
                    let path = self.segments.pop().expect("just peeked").path;
                    std::fs::remove_file(path)?;
                } else {
                    break;
                }
            }
            if let Some(segment) = self.segments.pop() {
                let retained: Vec<LogEntry> = self
                    .entries
                    .iter()
                    .skip((segment.first_index.saturating_sub(first)) as usize)
                    .cloned()
                    .collect();
                std::fs::remove_file(&segment.path)?;
                if !retained.is_empty() {
                    self.rotate_segment(segment.first_index)?;
                    for entry in &retained {
                        let body = entry.encode_to_vec();
                        let mut header = [0u8; FRAME_HEADER_LEN];
                        LittleEndian::write_u32(&mut header[..4], body.len() as u32);
                        LittleEndian::write_u64(&mut header[4..], fxhash::hash64(&body));
                        let segment = self.segments.last_mut().expect("just rotated");
                        segment.file.write_all(&header)?;
                        segment.file.write_all(&body)?;
                        segment.bytes += (FRAME_HEADER_LEN + body.len()) as u64;
                    }
                    let segment = self.segments.last_mut().expect("just rotated");
                    segment.file.sync_data()?;
                }
            }
        }
        Ok(())
    }

    /// Release entries below `new_start` after they are covered by a
    /// snapshot. Only whole segments are deleted; the boundary segment is
    /// retained until a later snapshot passes its end.
    pub fn truncate_prefix(&mut self, new_start: LogIndex) -> Result<()> {
        while self.segments.len() > 1 && self.segments[1].first_index <= new_start {
            let segment = self.segments.remove(0);
            std::fs::remove_file(&segment.path)?;

            let first = self.first_index();
            let drop_upto = self.segments[0].first_index;
            for _ in first..drop_upto {
                self.entries.pop_front();
            }
        }
        if self.dir.is_none() {
            while self
                .entries
                .front()
                .is_some_and(|entry| entry.index < new_start)
            {
                self.entries.pop_front();
            }
            if self.entries.is_empty() {
                self.next_index = new_start.max(self.next_index);
            }
        }
        Ok(())
    }

    /// Discard everything; the next entry gets `next_index`. Used when a
    /// snapshot replaces the whole log.
    pub fn reset(&mut self, next_index: LogIndex) -> Result<()> {
        self.entries.clear();
        self.next_index = next_index;
        for segment in self.segments.drain(..) {
            std::fs::remove_file(&segment.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proto_storage::raft::EntryKind;

    fn entry(term: Term, index: LogIndex, payload: &[u8]) -> LogEntry {
        LogEntry {
            term,
            index,
            kind: EntryKind::Data as i32,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut wal = Wal::open(Some(dir.path()), 1).unwrap();
        assert_eq!(wal.last_index(), 0);

        wal.append(&[entry(1, 1, b"a"), entry(1, 2, b"b")]).unwrap();
        wal.append(&[entry(2, 3, b"c")]).unwrap();

        assert_eq!(wal.first_index(), 1);
        assert_eq!(wal.last_index(), 3);
        assert_eq!(wal.term_of(3), Some(2));
        assert_eq!(wal.entry(2).unwrap().payload, b"b");

        let batch = wal.entries_from(2, 10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, 2);
    }

    #[test]
    fn test_gap_is_rejected() {
        let mut wal = Wal::open(None, 1).unwrap();
        wal.append(&[entry(1, 1, b"a")]).unwrap();
        let err = wal.append(&[entry(1, 5, b"x")]).unwrap_err();
        assert!(matches!(err, WalError::Gap { last: 1, got: 5 }));
    }

    #[test]
    fn test_reopen_replays() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut wal = Wal::open(Some(dir.path()), 1).unwrap();
            wal.append(&[entry(1, 1, b"a"), entry(1, 2, b"b"), entry(2, 3, b"c")])
                .unwrap();
        }
        let wal = Wal::open(Some(dir.path()), 1).unwrap();
        assert_eq!(wal.first_index(), 1);
        assert_eq!(wal.last_index(), 3);
        assert_eq!(wal.entry(3).unwrap().payload, b"c");
    }

    #[test]
    fn test_torn_tail_is_dropped_on_replay() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut wal = Wal::open(Some(dir.path()), 1).unwrap();
            wal.append(&[entry(1, 1, b"a"), entry(1, 2, b"b")]).unwrap();
        }
        // Tear the last frame.
        let path = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let wal = Wal::open(Some(dir.path()), 1).unwrap();
        assert_eq!(wal.last_index(), 1);
        assert_eq!(wal.entry(1).unwrap().payload, b"a");
    }

    #[test]
    fn test_truncate_from_conflict() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut wal = Wal::open(Some(dir.path()), 1).unwrap();
        wal.append(&[entry(1, 1, b"a"), entry(1, 2, b"b"), entry(1, 3, b"c")])
            .unwrap();

        wal.truncate_from(2).unwrap();
        assert_eq!(wal.last_index(), 1);

        // The truncated suffix is replaceable, and survives reopen.
        wal.append(&[entry(2, 2, b"b2")]).unwrap();
        drop(wal);

        let wal = Wal::open(Some(dir.path()), 1).unwrap();
        assert_eq!(wal.last_index(), 2);
        assert_eq!(wal.entry(2).unwrap().payload, b"b2");
        assert_eq!(wal.term_of(2), Some(2));
    }

    #[test]
    fn test_reset_for_snapshot_install() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut wal = Wal::open(Some(dir.path()), 1).unwrap();
        wal.append(&[entry(1, 1, b"a"), entry(1, 2, b"b")]).unwrap();

        wal.reset(11).unwrap();
        assert_eq!(wal.first_index(), 11);
        assert_eq!(wal.last_index(), 10);

        wal.append(&[entry(3, 11, b"k")]).unwrap();
        assert_eq!(wal.entry(11).unwrap().payload, b"k");
    }

    #[test]
    fn test_volatile_mode() {
        let mut wal = Wal::open(None, 1).unwrap();
        wal.append(&[entry(1, 1, b"a"), entry(1, 2, b"b")]).unwrap();
        wal.truncate_prefix(2).unwrap();
        assert_eq!(wal.first_index(), 2);
        assert_eq!(wal.last_index(), 2);
    }
}
