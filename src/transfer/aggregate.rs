//! Server-side chunk aggregation
//!
//! Each uploaded chunk is written to a part file next to its target. When
//! the last chunk arrives the parts are concatenated in order into a
//! temporary file that then replaces the target. All work for one
//! (username, target) pair is serialized by a per-key lock. A failed chunk
//! discards every part of its upload.

use crate::error::{FilegateError, IoResultExt, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Position of an incoming chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingChunk {
    /// Zero-based index
    pub index: u64,
    /// Total number of chunks, 1 for unchunked uploads
    pub count: u64,
}

impl IncomingChunk {
    /// An unchunked upload
    pub fn single() -> Self {
        Self { index: 0, count: 1 }
    }

    fn is_last(&self) -> bool {
        self.index + 1 == self.count
    }
}

/// Outcome of storing a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Part stored, more chunks expected
    Stored,
    /// Target written with its final length
    Completed(u64),
}

/// Parts received so far for one (username, target) pair
#[derive(Debug)]
struct Pending {
    touched: Instant,
    parts: BTreeSet<u64>,
}

impl Default for Pending {
    fn default() -> Self {
        Self {
            touched: Instant::now(),
            parts: BTreeSet::new(),
        }
    }
}

type Key = (String, PathBuf);
type Slot = Arc<Mutex<Pending>>;

/// In-flight chunk state shared by all request handlers
///
/// Uploads that stop arriving are forgotten after an idle period: their
/// part files are deleted and their slot is dropped. The sweep runs
/// opportunistically from [`ChunkAggregator::store`] and can be forced with
/// [`ChunkAggregator::sweep_idle`].
#[derive(Debug)]
pub struct ChunkAggregator {
    slots: Mutex<HashMap<Key, Slot>>,
    idle_ttl: Duration,
    last_sweep: Mutex<Instant>,
}

impl Default for ChunkAggregator {
    fn default() -> Self {
        Self::with_idle_ttl(Self::DEFAULT_IDLE_TTL)
    }
}

impl ChunkAggregator {
    /// Idle period after which an unfinished upload is discarded
    pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60 * 60);

    /// Create an aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an aggregator discarding uploads idle for `idle_ttl`
    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle_ttl,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Store a chunk for `target` on behalf of `username`
    pub fn store(
        &self,
        username: &str,
        target: &Path,
        chunk: IncomingChunk,
        content: &mut dyn Read,
    ) -> Result<ChunkOutcome> {
        if chunk.count == 0 || chunk.index >= chunk.count {
            return Err(FilegateError::invalid(format!(
                "chunk index {} out of range (count {})",
                chunk.index, chunk.count
            )));
        }
        self.sweep_if_due();

        let key = (username.to_string(), target.to_path_buf());
        let slot = self.slot(&key)?;
        let outcome = {
            let mut pending = slot
                .lock()
                .map_err(|_| FilegateError::protocol("chunk lock poisoned"))?;

            let outcome = store_locked(username, target, chunk, content, &mut pending);
            pending.touched = Instant::now();
            if outcome.is_err() {
                discard_parts(username, target, &mut pending);
            }
            outcome
        };

        if !matches!(outcome, Ok(ChunkOutcome::Stored)) {
            self.release(&key, &slot);
        }
        outcome
    }

    /// Number of targets with chunks in flight
    pub fn in_flight(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    /// Discard uploads that have not received a chunk for `ttl`
    ///
    /// Uploads with a request in progress are left alone. Returns the number
    /// of uploads discarded.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let expired: Vec<(Key, Slot)> = match self.slots.lock() {
            Ok(mut slots) => {
                let keys: Vec<Key> = slots
                    .iter()
                    .filter(|(_, slot)| Arc::strong_count(slot) == 1)
                    .filter(|(_, slot)| {
                        slot.try_lock()
                            .map(|pending| pending.touched.elapsed() >= ttl)
                            .unwrap_or(false)
                    })
                    .map(|(key, _)| key.clone())
                    .collect();
                keys.into_iter()
                    .filter_map(|key| slots.remove_entry(&key))
                    .collect()
            }
            Err(_) => return 0,
        };

        for ((username, target), slot) in &expired {
            if let Ok(mut pending) = slot.lock() {
                debug!(
                    "Discarding {} idle parts of {} for '{}'",
                    pending.parts.len(),
                    target.display(),
                    username
                );
                discard_parts(username, target, &mut pending);
            }
        }
        expired.len()
    }

    fn sweep_if_due(&self) {
        let interval = self.idle_ttl.min(Duration::from_secs(60));
        let due = match self.last_sweep.lock() {
            Ok(mut last) if last.elapsed() >= interval => {
                *last = Instant::now();
                true
            }
            _ => false,
        };
        if due {
            let swept = self.sweep_idle(self.idle_ttl);
            if swept > 0 {
                info!("Discarded {} abandoned uploads", swept);
            }
        }
    }

    fn slot(&self, key: &Key) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| FilegateError::protocol("chunk table poisoned"))?;
        Ok(slots.entry(key.clone()).or_default().clone())
    }

    fn release(&self, key: &Key, slot: &Slot) {
        if let Ok(mut slots) = self.slots.lock() {
            // Another request may already be waiting on this slot
            if Arc::strong_count(slot) <= 2 {
                slots.remove(key);
            }
        }
    }
}

fn store_locked(
    username: &str,
    target: &Path,
    chunk: IncomingChunk,
    content: &mut dyn Read,
    pending: &mut Pending,
) -> Result<ChunkOutcome> {
    if chunk.count == 1 {
        let length = write_atomically(target, |out| Ok(io::copy(content, out)?))?;
        return Ok(ChunkOutcome::Completed(length));
    }

    let part = part_path(username, target, chunk.index)?;
    if let Some(dir) = part.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_path(dir)?;
    }
    pending.parts.insert(chunk.index);
    let mut file = File::create(&part).with_path(&part)?;
    let written = io::copy(content, &mut file).with_path(&part)?;
    file.sync_data().with_path(&part)?;
    debug!(
        "Stored chunk {}/{} of {} ({} bytes)",
        chunk.index + 1,
        chunk.count,
        target.display(),
        written
    );

    if !chunk.is_last() {
        return Ok(ChunkOutcome::Stored);
    }
    let length = assemble(username, target, chunk.count)?;
    pending.parts.clear();
    info!("Assembled {} from {} chunks ({} bytes)", target.display(), chunk.count, length);
    Ok(ChunkOutcome::Completed(length))
}

fn discard_parts(username: &str, target: &Path, pending: &mut Pending) {
    for index in std::mem::take(&mut pending.parts) {
        if let Ok(part) = part_path(username, target, index) {
            let _ = std::fs::remove_file(part);
        }
    }
}

fn part_path(username: &str, target: &Path, index: u64) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| FilegateError::invalid("upload target has no file name"))?;
    let user = hex::encode(Sha256::digest(username.as_bytes()));
    let part = format!(".{}.{}.{}.part", name.to_string_lossy(), &user[..8], index);
    Ok(target.with_file_name(part))
}

fn assemble(username: &str, target: &Path, count: u64) -> Result<u64> {
    let parts = (0..count)
        .map(|index| part_path(username, target, index))
        .collect::<Result<Vec<_>>>()?;

    if let Some(missing) = parts.iter().find(|part| !part.exists()) {
        return Err(FilegateError::io(
            missing,
            io::Error::new(io::ErrorKind::Other, "missing chunk part"),
        ));
    }

    let length = write_atomically(target, |out| {
        let mut total = 0;
        for part in &parts {
            let mut input = File::open(part).with_path(part)?;
            total += io::copy(&mut input, out).with_path(part)?;
        }
        Ok(total)
    })?;

    for part in &parts {
        let _ = std::fs::remove_file(part);
    }
    Ok(length)
}

fn write_atomically<F>(target: &Path, fill: F) -> Result<u64>
where
    F: FnOnce(&mut dyn Write) -> Result<u64>,
{
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).with_path(dir)?;

    let temp = tempfile::NamedTempFile::new_in(dir).with_path(dir)?;
    let length = {
        let mut out = BufWriter::new(temp.as_file());
        let length = fill(&mut out)?;
        out.flush().with_path(target)?;
        length
    };
    temp.as_file().sync_all().with_path(target)?;
    temp.persist(target)
        .map_err(|e| FilegateError::io(target, e.error))?;
    Ok(length)
}
