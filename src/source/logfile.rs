use crate::{
    envelope::{SourceRecord, TimestampKind},
    partition::{PartitionInfo, SourcePartition},
    source::{
        AdapterSession, AssignmentListener, RecordBatch, SourceAdapter, SourceError,
        SourceResult, SubscriptionTarget,
    },
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// File extension of the partition log files in a watched directory.
const LOG_EXTENSION: &str = "log";

/// Name of the sidecar file holding the committed offsets of the directory.
const OFFSETS_FILE: &str = "offsets.json";

/// How long the tail reader sleeps between scans while waiting for new records.
const TAIL_SLICE: Duration = Duration::from_millis(100);

/// One record in a binary partition log: a u32 big-endian length prefix followed by this
/// structure in bincode framing. The record's offset is its ordinal index in the file.
#[derive(Debug, Deserialize, Serialize)]
pub struct LogRecord {
    /// Opaque key bytes, if the record has a key.
    pub key: Option<Vec<u8>>,
    /// Opaque value bytes, if the record has a value.
    pub value: Option<Vec<u8>>,
    /// Epoch milliseconds the record was appended at, when recorded by the writer.
    pub timestamp: Option<i64>,
}

/// Appends one record to a partition log file, creating the file if needed.
pub fn append_record(path: impl AsRef<Path>, record: &LogRecord) -> std::io::Result<()> {
    let payload = bincode::serialize(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    file.write_all(&(payload.len() as u32).to_be_bytes())?;
    file.write_all(&payload)
}

/// Read state of one tailed partition log.
struct PartitionTail {
    /// Path of the log file.
    path: PathBuf,
    /// Byte position of the next unread record.
    byte_pos: u64,
    /// Ordinal offset of the next unread record.
    next_offset: i64,
    /// False until the reader has been positioned by a committed offset or an explicit seek.
    /// Unpositioned partitions surface as [`SourceError::NoOffsetForPartitions`] on poll.
    positioned: bool,
}

/// Source adapter that tails binary partition logs in a directory. Each partition is one
/// append-only file named `{topic}-{partition}.log`; committed offsets persist in a JSON
/// sidecar next to the logs. Assignment is static: every matching file present at subscribe
/// time is assigned, and the listener fires once.
pub struct LogFileSourceAdapter {
    /// Directory holding the partition logs.
    directory: PathBuf,
    /// Tailed partitions keyed by identity.
    tails: Mutex<HashMap<SourcePartition, PartitionTail>>,
    /// Committed offsets, mirrored to the sidecar file.
    committed: Mutex<HashMap<SourcePartition, i64>>,
    /// Partitions currently paused.
    paused: RwLock<HashSet<SourcePartition>>,
    /// Listener installed at subscribe time.
    listener: RwLock<Option<Arc<dyn AssignmentListener>>>,
    /// Maximum number of records returned by a single poll.
    max_poll_records: usize,
    /// Set to interrupt an in-progress or subsequent poll.
    wakeup: AtomicBool,
    /// Set once the adapter has been closed.
    closed: AtomicBool,
}

impl LogFileSourceAdapter {
    /// Creates a new adapter tailing the given directory.
    pub fn new(directory: impl Into<PathBuf>, max_poll_records: usize) -> Self {
        Self {
            directory: directory.into(),
            tails: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            paused: RwLock::new(HashSet::new()),
            listener: RwLock::new(None),
            max_poll_records,
            wakeup: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the path of the committed-offsets sidecar.
    fn offsets_path(&self) -> PathBuf {
        self.directory.join(OFFSETS_FILE)
    }

    /// Loads the committed offsets from the sidecar, tolerating a missing file.
    fn load_offsets(&self) -> SourceResult<HashMap<SourcePartition, i64>> {
        let raw = match std::fs::read_to_string(self.offsets_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(SourceError::Transient(e.to_string())),
        };

        let by_name: HashMap<String, i64> =
            serde_json::from_str(&raw).map_err(|e| SourceError::Transient(e.to_string()))?;

        let mut offsets = HashMap::with_capacity(by_name.len());

        for (name, offset) in by_name {
            match parse_partition_name(&name) {
                Some(partition) => {
                    offsets.insert(partition, offset);
                }
                None => {
                    tracing::warn!("ignoring malformed offsets entry {}", name);
                }
            }
        }

        Ok(offsets)
    }

    /// Writes the committed offsets to the sidecar.
    fn store_offsets(&self, offsets: &HashMap<SourcePartition, i64>) -> SourceResult<()> {
        let by_name: HashMap<String, i64> = offsets
            .iter()
            .map(|(partition, offset)| (partition.to_string(), *offset))
            .collect();

        let raw = serde_json::to_string_pretty(&by_name)
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        std::fs::write(self.offsets_path(), raw)
            .map_err(|e| SourceError::Transient(e.to_string()))
    }

    /// Records newly committed offsets both in memory and in the sidecar.
    fn apply_commit(&self, offsets: &HashMap<SourcePartition, i64>) -> SourceResult<()> {
        let merged = {
            let mut committed = self.committed.lock();
            committed.extend(offsets.clone());
            committed.clone()
        };

        self.store_offsets(&merged)
    }

    /// Positions a tail at the given record offset by walking the file from its start.
    fn position_tail(tail: &mut PartitionTail, offset: i64) -> SourceResult<()> {
        let mut file = match File::open(&tail.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tail.byte_pos = 0;
                tail.next_offset = 0;
                tail.positioned = true;
                return Ok(());
            }
            Err(e) => return Err(SourceError::Transient(e.to_string())),
        };

        let mut byte_pos = 0u64;
        let mut next_offset = 0i64;

        while next_offset < offset {
            match read_frame(&mut file, byte_pos)? {
                Some((_, frame_end)) => {
                    byte_pos = frame_end;
                    next_offset += 1;
                }
                None => break,
            }
        }

        tail.byte_pos = byte_pos;
        tail.next_offset = next_offset;
        tail.positioned = true;

        Ok(())
    }

    /// Reads the records available for one tail, up to the given budget.
    fn drain_tail(
        partition: &SourcePartition,
        tail: &mut PartitionTail,
        budget: usize,
        batch: &mut RecordBatch,
    ) -> SourceResult<()> {
        if budget == 0 {
            return Ok(());
        }

        let mut file = match File::open(&tail.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SourceError::Transient(e.to_string())),
        };

        let mut taken = 0usize;

        while taken < budget {
            match read_frame(&mut file, tail.byte_pos)? {
                Some((record, frame_end)) => {
                    let (timestamp, timestamp_kind) = match record.timestamp {
                        Some(ts) => (Some(ts), TimestampKind::LogAppend),
                        None => (None, TimestampKind::None),
                    };

                    batch.push(SourceRecord {
                        key: record.key,
                        value: record.value,
                        headers: HashMap::new(),
                        topic: String::from(partition.topic()),
                        partition: partition.partition(),
                        offset: tail.next_offset,
                        timestamp,
                        timestamp_kind,
                    });

                    tail.byte_pos = frame_end;
                    tail.next_offset += 1;
                    taken += 1;
                }
                None => break,
            }
        }

        Ok(())
    }
}

/// Rebalance-scoped session for the logfile adapter's one-shot assignment callback.
struct LogFileSession<'a> {
    adapter: &'a LogFileSourceAdapter,
}

impl AdapterSession for LogFileSession<'_> {
    /// Pauses consumption of the given partitions.
    fn pause(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        self.adapter
            .paused
            .write()
            .extend(partitions.iter().cloned());
        Ok(())
    }
    /// Synchronously commits the given offsets to the sidecar.
    fn commit_sync(&self, offsets: &HashMap<SourcePartition, i64>) -> SourceResult<()> {
        self.adapter.apply_commit(offsets)
    }
    /// Returns the committed offset for the given partition, if one exists.
    fn committed(&self, partition: &SourcePartition) -> SourceResult<Option<i64>> {
        Ok(self.adapter.committed.lock().get(partition).copied())
    }
}

impl SourceAdapter for LogFileSourceAdapter {
    /// Discovers the partition logs matching the target, loads the committed offsets from the
    /// sidecar, and fires the one-shot assignment callback.
    fn subscribe(
        &self,
        target: &SubscriptionTarget,
        listener: Arc<dyn AssignmentListener>,
    ) -> SourceResult<()> {
        {
            let mut installed = self.listener.write();

            if installed.is_some() {
                return Err(SourceError::Transient(String::from(
                    "adapter is already subscribed",
                )));
            }

            *installed = Some(Arc::clone(&listener));
        }

        let matcher: Box<dyn Fn(&str) -> bool> = match target {
            SubscriptionTarget::Topics(topics) => {
                let topics = topics.clone();
                Box::new(move |topic: &str| topics.iter().any(|t| t == topic))
            }
            SubscriptionTarget::Pattern(pattern) => {
                let regex = regex::Regex::new(pattern)
                    .map_err(|e| SourceError::Transient(e.to_string()))?;
                Box::new(move |topic: &str| regex.is_match(topic))
            }
        };

        let committed = self.load_offsets()?;

        let entries = std::fs::read_dir(&self.directory)
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        let mut tails = self.tails.lock();
        let mut assigned = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| SourceError::Transient(e.to_string()))?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }

            let Some(partition) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(parse_partition_name)
            else {
                tracing::warn!("ignoring log file with malformed name: {}", path.display());
                continue;
            };

            if !matcher(partition.topic()) {
                continue;
            }

            let mut tail = PartitionTail {
                path,
                byte_pos: 0,
                next_offset: 0,
                positioned: false,
            };

            if let Some(offset) = committed.get(&partition) {
                Self::position_tail(&mut tail, *offset)?;
            }

            assigned.push(partition.clone());
            tails.insert(partition, tail);
        }

        drop(tails);

        assigned.sort();

        tracing::info!(
            "tailing {} partition logs under {}",
            assigned.len(),
            self.directory.display()
        );

        *self.committed.lock() = committed;

        listener.on_assigned(&LogFileSession { adapter: self }, &assigned);

        Ok(())
    }
    /// Polls for newly appended records across the unpaused partitions, blocking up to
    /// `timeout`. Partitions that were never positioned surface as a missing-offset error so
    /// the caller can seek them explicitly.
    fn poll(&self, timeout: Duration) -> SourceResult<RecordBatch> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }

        let unpositioned: HashSet<SourcePartition> = self
            .tails
            .lock()
            .iter()
            .filter(|(_, tail)| !tail.positioned)
            .map(|(partition, _)| partition.clone())
            .collect();

        if !unpositioned.is_empty() {
            return Err(SourceError::NoOffsetForPartitions(unpositioned));
        }

        let deadline = Instant::now() + timeout;

        loop {
            if self.wakeup.swap(false, Ordering::SeqCst) {
                return Err(SourceError::WakeupTriggered);
            }

            let mut batch = RecordBatch::new();

            {
                let paused = self.paused.read().clone();
                let mut tails = self.tails.lock();

                for (partition, tail) in tails.iter_mut() {
                    if paused.contains(partition) {
                        continue;
                    }

                    let budget = self.max_poll_records - batch.len();

                    Self::drain_tail(partition, tail, budget, &mut batch)?;

                    if batch.len() >= self.max_poll_records {
                        break;
                    }
                }
            }

            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();

            if now >= deadline {
                return Ok(batch);
            }

            std::thread::sleep(TAIL_SLICE.min(deadline - now));
        }
    }
    /// Returns the partitions currently assigned.
    fn assignment(&self) -> SourceResult<HashSet<SourcePartition>> {
        Ok(self.tails.lock().keys().cloned().collect())
    }
    /// Returns the partitions currently paused.
    fn paused(&self) -> SourceResult<HashSet<SourcePartition>> {
        Ok(self.paused.read().clone())
    }
    /// Pauses consumption of the given partitions.
    fn pause(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        self.paused.write().extend(partitions.iter().cloned());
        Ok(())
    }
    /// Resumes consumption of the given partitions.
    fn resume(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        self.paused.write().retain(|p| !partitions.contains(p));
        Ok(())
    }
    /// Positions the given partition so the next poll reads from `offset`.
    fn seek(&self, partition: &SourcePartition, offset: i64) -> SourceResult<()> {
        let mut tails = self.tails.lock();

        let tail = tails
            .get_mut(partition)
            .ok_or_else(|| SourceError::Transient(format!("unknown partition {}", partition)))?;

        Self::position_tail(tail, offset)
    }
    /// Positions the given partitions at the start of their logs.
    fn seek_to_beginning(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        for partition in partitions {
            self.seek(partition, 0)?;
        }

        Ok(())
    }
    /// Positions the given partitions past the last record of their logs.
    fn seek_to_end(&self, partitions: &HashSet<SourcePartition>) -> SourceResult<()> {
        for partition in partitions {
            self.seek(partition, i64::MAX)?;
        }

        Ok(())
    }
    /// Returns the committed offset for the given partition, if one exists.
    fn committed(&self, partition: &SourcePartition) -> SourceResult<Option<i64>> {
        Ok(self.committed.lock().get(partition).copied())
    }
    /// Synchronously commits the given offsets to the sidecar.
    fn commit_sync(&self, offsets: Option<&HashMap<SourcePartition, i64>>) -> SourceResult<()> {
        match offsets {
            Some(offsets) if !offsets.is_empty() => self.apply_commit(offsets),
            _ => Ok(()),
        }
    }
    /// Returns the partitions of the given topic present in the directory.
    fn partitions_for(&self, topic: &str) -> SourceResult<Vec<PartitionInfo>> {
        Ok(self
            .tails
            .lock()
            .keys()
            .filter(|p| p.topic() == topic)
            .map(|p| PartitionInfo {
                topic: String::from(p.topic()),
                partition: p.partition(),
            })
            .collect())
    }
    /// Interrupts an in-progress or subsequent poll. Safe to call from any thread.
    fn wakeup(&self) {
        self.wakeup.store(true, Ordering::SeqCst);
    }
    /// Marks the adapter closed. Idempotent.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(
                "closing logfile source adapter for {}",
                self.directory.display()
            );
        }
    }
}

/// Parses a `{topic}-{partition}` name, taking the partition from the right so topics may
/// contain dashes.
fn parse_partition_name(name: &str) -> Option<SourcePartition> {
    let (topic, partition) = name.rsplit_once('-')?;

    if topic.is_empty() {
        return None;
    }

    partition
        .parse::<i32>()
        .ok()
        .map(|number| SourcePartition::new(topic, number))
}

/// Reads one length-prefixed frame at the given byte position. Returns the decoded record and
/// the position one past the frame, or [`None`] when the file ends before a whole frame,
/// which also covers a partially flushed append.
fn read_frame(file: &mut File, byte_pos: u64) -> SourceResult<Option<(LogRecord, u64)>> {
    file.seek(SeekFrom::Start(byte_pos))
        .map_err(|e| SourceError::Transient(e.to_string()))?;

    let mut len_buf = [0u8; 4];

    match file.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SourceError::Transient(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];

    match file.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SourceError::Transient(e.to_string())),
    }

    let record =
        bincode::deserialize(&payload).map_err(|e| SourceError::Transient(e.to_string()))?;

    Ok(Some((record, byte_pos + 4 + len as u64)))
}
