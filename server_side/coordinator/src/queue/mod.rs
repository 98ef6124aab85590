//! Durable FIFO of pending commands.
//!
//! Commands are appended to `queue.log`, one per line, and never rewritten.
//! `queue.idx` holds the line number of the next command and the number of
//! pending commands. Data is synced before the index is replaced, so the
//! persisted view is never ahead of what was acknowledged to the caller.
mod index;

use std::{
    fs::{create_dir_all, File, OpenOptions},
    io::{BufRead, BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, error, info, warn};

pub use index::QueueIndex;

pub const DEFAULT_CAPACITY: usize = 100;
/// Identical commands arriving closer together than this are retransmissions.
pub const REPEAT_WINDOW: Duration = Duration::from_millis(50);

pub struct CommandQueue {
    log_path: PathBuf,
    index_path: PathBuf,
    log: File,
    // Byte offset of every line still referenced by the index, from line 0.
    offsets: Vec<u64>,
    end: u64,
    index: QueueIndex,
    capacity: usize,
    last_enqueued: Option<(String, Instant)>,
}

fn scan_lines(log: &File) -> anyhow::Result<(Vec<u64>, u64)> {
    let mut reader = BufReader::new(log);
    reader.seek(SeekFrom::Start(0))?;
    let mut offsets = Vec::new();
    let mut position = 0u64;
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let read = reader.read_until(b'\n', &mut buffer)?;
        if read == 0 || buffer.last() != Some(&b'\n') {
            // A trailing fragment without a newline is a torn write.
            break;
        }
        offsets.push(position);
        position += read as u64;
    }
    Ok((offsets, position))
}

impl CommandQueue {
    pub fn open(log_path: PathBuf, index_path: PathBuf, capacity: usize) -> anyhow::Result<CommandQueue> {
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .with_context(|| format!("opening queue log {:?}", log_path))?;
        let (mut offsets, complete_len) = scan_lines(&log)?;
        let mut index = QueueIndex::load(&index_path)?.unwrap_or_default();
        if index.head > offsets.len() {
            warn!("queue index points past the log ({:?} with {} lines); starting empty", index, offsets.len());
            index = QueueIndex::default();
        } else if index.checked_tail().map_or(true, |tail| tail > offsets.len()) {
            warn!("queue index claims {} entries but only {} are logged", index.size, offsets.len() - index.head);
            index.size = offsets.len() - index.head;
        }
        // Lines written after the last index update were never acknowledged.
        let mut end = offsets.get(index.tail()).copied().unwrap_or(complete_len);
        offsets.truncate(index.tail());
        if index.size == 0 {
            offsets.clear();
            end = 0;
            index = QueueIndex::default();
        }
        if log.metadata()?.len() != end {
            log.set_len(end)?;
        }
        index.store(&index_path)?;
        if index.size > 0 {
            info!("resuming queue with {} pending commands", index.size);
        }
        Ok(CommandQueue {
            log_path,
            index_path,
            log,
            offsets,
            end,
            index,
            capacity,
            last_enqueued: None,
        })
    }
    pub fn open_in(folder: &Path, capacity: usize) -> anyhow::Result<CommandQueue> {
        CommandQueue::open(folder.join("queue.log"), folder.join("queue.idx"), capacity)
    }

    pub fn len(&self) -> usize {
        self.index.size
    }
    pub fn is_empty(&self) -> bool {
        self.index.size == 0
    }
    pub fn is_full(&self) -> bool {
        self.index.size >= self.capacity
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn index(&self) -> QueueIndex {
        self.index
    }

    /// Adds a command submitted from outside, dropping a retransmission of the
    /// previous command within [`REPEAT_WINDOW`].
    pub fn enqueue(&mut self, text: &str, now: Instant) -> bool {
        if let Some((last, at)) = &self.last_enqueued {
            if last == text && now.saturating_duration_since(*at) < REPEAT_WINDOW {
                info!("ignoring repeated command {:?}", text);
                return true;
            }
        }
        let accepted = self.append(text);
        if accepted {
            self.last_enqueued = Some((text.to_string(), now));
        }
        accepted
    }

    /// Adds a command without the repeat check.
    pub fn append(&mut self, text: &str) -> bool {
        if text.is_empty() || text.contains('\n') {
            warn!("refusing to queue {:?}: commands must be a single non-empty line", text);
            return false;
        }
        if self.is_full() {
            warn!("queue full ({} entries); dropping {:?}", self.capacity, text);
            return false;
        }
        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        let written = (&self.log)
            .write_all(&line)
            .and_then(|()| self.log.sync_data());
        if let Err(e) = written {
            error!("failed to append {:?} to {:?}: {}", text, self.log_path, e);
            self.restore_log_length();
            return false;
        }
        let updated = QueueIndex { head: self.index.head, size: self.index.size + 1 };
        if let Err(e) = updated.store(&self.index_path) {
            error!("failed to record queue index: {:#}", e);
            self.restore_log_length();
            return false;
        }
        self.offsets.push(self.end);
        self.end += line.len() as u64;
        self.index = updated;
        debug!("queued {:?} ({} pending)", text, self.index.size);
        true
    }

    fn restore_log_length(&mut self) {
        if let Err(e) = self.log.set_len(self.end) {
            error!("failed to roll back {:?}: {}", self.log_path, e);
        }
    }

    fn read_line_at(&self, offset: u64) -> anyhow::Result<String> {
        let mut reader = BufReader::new(&self.log);
        reader.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        Ok(line.trim_end_matches(&['\n', '\r'][..]).to_string())
    }

    pub fn dequeue(&mut self) -> Option<String> {
        if self.index.size == 0 {
            return None;
        }
        let offset = *self.offsets.get(self.index.head)?;
        let text = match self.read_line_at(offset) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to read queue entry {}: {:#}", self.index.head, e);
                return None;
            }
        };
        let advanced = QueueIndex { head: self.index.head + 1, size: self.index.size - 1 };
        if advanced.size == 0 {
            // Drained: compact back to an empty log.
            if let Err(e) = self.reset_files() {
                error!("failed to compact queue: {:#}", e);
            }
        } else {
            self.index = advanced;
            if let Err(e) = self.index.store(&self.index_path) {
                error!("failed to record queue index: {:#}", e);
            }
        }
        Some(text)
    }

    fn reset_files(&mut self) -> anyhow::Result<()> {
        self.offsets.clear();
        self.end = 0;
        self.index = QueueIndex::default();
        self.index.store(&self.index_path)?;
        self.log.set_len(0)?;
        Ok(())
    }

    pub fn clear(&mut self) {
        let dropped = self.index.size;
        self.last_enqueued = None;
        match self.reset_files() {
            Ok(()) if dropped > 0 => info!("cleared {} queued commands", dropped),
            Ok(()) => (),
            Err(e) => error!("failed to clear queue files: {:#}", e),
        }
    }

    /// Rebuilds the in-memory view from the files on disk.
    pub fn reload(&mut self) -> anyhow::Result<()> {
        let reloaded = CommandQueue::open(self.log_path.clone(), self.index_path.clone(), self.capacity)?;
        *self = reloaded;
        Ok(())
    }
}
