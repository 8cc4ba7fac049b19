use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use blake3::Hasher;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use relay_spec::{Command, CommandId, Timestamp};

use crate::{CommandQueue, MemoryQueue, QueueError, QueueRecord, QueueState};

const DEFAULT_COMPACT_EVERY: usize = 1024;
const CHECKSUM_DOMAIN: &[u8] = b"relay-queue:wal:v1";
const STATE_DOMAIN: &[u8] = b"relay-queue:state:v1";
const WAL_FILE: &str = "commands.wal";
const SEGMENTS_FILE: &str = "segments.bin";
const META_FILE: &str = "meta.json";
const FRAME_HEADER: usize = 4 + 32;

/// Summary of the folded queue kept in `meta.json`.
///
/// `digest` is the XOR of one BLAKE3 hash per command, so a mutation updates it
/// by rehashing only the command it touches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct QueueMetadata {
    commands: usize,
    next_id: CommandId,
    digest: [u8; 32],
}

impl QueueMetadata {
    fn from_state(state: &QueueState) -> Self {
        let mut digest = [0u8; 32];
        for cmd in state.commands() {
            xor_into(&mut digest, &command_digest(cmd));
        }
        Self {
            commands: state.len(),
            next_id: state.next_id(),
            digest,
        }
    }
}

fn command_digest(cmd: &Command) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(STATE_DOMAIN);
    hasher.update(&cmd.id.to_be_bytes());
    hasher.update(&cmd.submitted_at.to_be_bytes());
    for field in [
        cmd.agent.as_str(),
        cmd.action.as_str(),
        cmd.payload.as_str(),
        cmd.signature.as_str(),
    ] {
        hasher.update(&(field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update(&[u8::from(cmd.is_pending()), u8::from(cmd.claimed)]);
    match &cmd.result {
        Some(result) => {
            hasher.update(&[1]);
            hasher.update(&(result.len() as u64).to_be_bytes());
            hasher.update(result.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    *hasher.finalize().as_bytes()
}

fn xor_into(acc: &mut [u8; 32], other: &[u8; 32]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

/// Apply `record` and update `meta` from the one command it touches.
fn apply_tracked(queue: &mut QueueState, meta: &mut QueueMetadata, record: QueueRecord) {
    let id = record.command_id();
    if let Some(before) = queue.get(id) {
        xor_into(&mut meta.digest, &command_digest(before));
    }
    queue.apply(record);
    if let Some(after) = queue.get(id) {
        xor_into(&mut meta.digest, &command_digest(after));
    }
    meta.commands = queue.len();
    meta.next_id = queue.next_id();
}

#[derive(Debug)]
struct PersistentState {
    queue: QueueState,
    meta: QueueMetadata,
    wal_records: usize,
    wal_len: u64,
}

/// Disk-backed command queue.
///
/// Mutations are appended to a checksummed WAL and fsynced before they are
/// applied in memory; the fsync is the commit point. `meta.json` trails the WAL
/// and may lag it after a crash. Every `compact_every` WAL records the folded
/// state is rewritten into `segments.bin` and the WAL is truncated.
#[derive(Debug, Clone)]
pub struct PersistentQueue {
    state: Arc<RwLock<PersistentState>>,
    wal: Arc<Mutex<File>>,
    dir: PathBuf,
    meta_path: PathBuf,
    wal_path: PathBuf,
    segments_path: PathBuf,
    compact_every: usize,
}

fn read_metadata_file(path: &Path) -> Option<QueueMetadata> {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<QueueMetadata>(&bytes).ok())
}

/// Outcome of replaying the snapshot and WAL of a queue directory.
struct Replay {
    queue: QueueState,
    meta: QueueMetadata,
    wal_records: usize,
    wal_valid_len: u64,
    wal_file_len: u64,
    /// Whether `expected` matched the state at some point of the replay.
    reached: bool,
}

fn replay(dir: &Path, expected: Option<QueueMetadata>) -> Result<Replay, QueueError> {
    // WAL before snapshot: a compaction in between leaves a newer snapshot and
    // an older WAL, which replays to the same state.
    let wal = read_frames(&dir.join(WAL_FILE), TailPolicy::Discard)?;
    let segments = read_frames(&dir.join(SEGMENTS_FILE), TailPolicy::Reject)?;

    let mut queue = QueueState::from_records(segments.records);
    let mut meta = QueueMetadata::from_state(&queue);
    let mut reached = expected.map_or(true, |on_disk| on_disk == meta);
    let wal_records = wal.records.len();
    for record in wal.records {
        apply_tracked(&mut queue, &mut meta, record);
        reached |= expected == Some(meta);
    }
    Ok(Replay {
        queue,
        meta,
        wal_records,
        wal_valid_len: wal.valid_len,
        wal_file_len: wal.file_len,
        reached,
    })
}

impl PersistentQueue {
    /// Open (or create) a queue at `dir` with the default compaction interval.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, QueueError> {
        Self::open_with_compaction(dir, DEFAULT_COMPACT_EVERY)
    }

    /// Open (or create) a queue at `dir`, compacting every `compact_every` WAL records.
    ///
    /// An incomplete trailing WAL frame was never acknowledged and is cut off.
    /// A `meta.json` that lags the WAL is rewritten; one that matches no state
    /// reachable by replay is a fatal mismatch.
    pub fn open_with_compaction<P: AsRef<Path>>(
        dir: P,
        compact_every: usize,
    ) -> Result<Self, QueueError> {
        let dir = dir.as_ref();
        let compact_every = compact_every.max(1);
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create queue directory {}", dir.display()))?;
        let wal_path = dir.join(WAL_FILE);
        let segments_path = dir.join(SEGMENTS_FILE);
        let meta_path = dir.join(META_FILE);

        let on_disk = read_metadata_file(&meta_path);
        let replayed = replay(dir, on_disk)?;
        if !replayed.reached {
            return Err(anyhow::anyhow!(
                "queue metadata mismatch during recovery: {} matches no replayed state",
                meta_path.display()
            )
            .into());
        }

        let wal = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&wal_path)
            .with_context(|| format!("failed to open WAL {}", wal_path.display()))?;
        if replayed.wal_file_len > replayed.wal_valid_len {
            wal.set_len(replayed.wal_valid_len)
                .context("failed to cut incomplete wal tail")?;
            wal.sync_all().context("failed to sync trimmed wal")?;
            tracing::warn!(
                dropped_bytes = replayed.wal_file_len - replayed.wal_valid_len,
                "discarded incomplete trailing wal frame"
            );
        }
        tracing::info!(
            dir = %dir.display(),
            commands = replayed.queue.len(),
            pending = replayed.queue.pending_count(),
            wal_records = replayed.wal_records,
            "command queue recovered"
        );
        let store = Self {
            state: Arc::new(RwLock::new(PersistentState {
                queue: replayed.queue,
                meta: replayed.meta,
                wal_records: replayed.wal_records,
                wal_len: replayed.wal_valid_len,
            })),
            wal: Arc::new(Mutex::new(wal)),
            dir: dir.to_path_buf(),
            meta_path,
            wal_path,
            segments_path,
            compact_every,
        };
        if on_disk != Some(replayed.meta) {
            if on_disk.is_some() {
                tracing::info!("metadata lagged the wal; rewriting");
            }
            store.persist_metadata(&replayed.meta)?;
        }
        Ok(store)
    }

    /// Replay the queue at `dir` into memory without writing anything.
    ///
    /// Usable while a server owns the directory: an incomplete trailing WAL
    /// frame is skipped and `meta.json` is neither checked nor rewritten.
    pub fn read_snapshot<P: AsRef<Path>>(dir: P) -> Result<MemoryQueue, QueueError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(anyhow::anyhow!("queue directory {} does not exist", dir.display()).into());
        }
        let replayed = replay(dir, None)?;
        tracing::debug!(
            dir = %dir.display(),
            commands = replayed.queue.len(),
            wal_records = replayed.wal_records,
            "queue snapshot loaded"
        );
        Ok(MemoryQueue::from_state(replayed.queue))
    }

    /// Directory holding the queue files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn persist_metadata(&self, meta: &QueueMetadata) -> Result<(), QueueError> {
        let encoded = serde_json::to_vec(meta).context("failed to serialize queue metadata")?;
        write_atomically(&self.meta_path, &encoded)
    }

    /// Append and fsync one frame. A failed append is trimmed back off the file.
    fn write_wal(&self, state: &mut PersistentState, record: &QueueRecord) -> Result<(), QueueError> {
        let frame = encode_frame(record)?;
        let mut wal = self.wal.lock();
        let written = wal.write_all(&frame).and_then(|()| wal.sync_all());
        if let Err(err) = written {
            if let Err(trim) = wal.set_len(state.wal_len) {
                tracing::error!(error = %trim, "failed to trim partial wal frame");
            }
            return Err(anyhow::Error::new(err)
                .context("failed to append wal record")
                .into());
        }
        state.wal_len += frame.len() as u64;
        Ok(())
    }

    /// Durably apply one mutation. Once the WAL append succeeds the mutation is
    /// committed; metadata and compaction failures are logged, not returned.
    fn commit(&self, state: &mut PersistentState, record: QueueRecord) -> Result<(), QueueError> {
        self.write_wal(state, &record)?;
        apply_tracked(&mut state.queue, &mut state.meta, record);
        state.wal_records += 1;
        let trailing = if state.wal_records >= self.compact_every {
            self.compact(state)
        } else {
            self.persist_metadata(&state.meta)
        };
        if let Err(err) = trailing {
            tracing::error!(error = %err, "queue bookkeeping failed after commit; recovery rebuilds it from the wal");
        }
        Ok(())
    }

    fn compact(&self, state: &mut PersistentState) -> Result<(), QueueError> {
        // Metadata first: old snapshot plus WAL and new snapshot plus old WAL
        // both replay to it.
        self.persist_metadata(&state.meta)?;
        let mut snapshot = Vec::new();
        for cmd in state.queue.commands() {
            snapshot.extend(encode_frame(&QueueRecord::Enqueued {
                command: cmd.clone(),
            })?);
        }
        write_atomically(&self.segments_path, &snapshot)?;
        let mut wal = self.wal.lock();
        wal.set_len(0).context("failed to truncate wal")?;
        wal.seek(SeekFrom::End(0))
            .context("failed to reset wal cursor")?;
        wal.sync_all().context("failed to sync truncated wal")?;
        state.wal_records = 0;
        state.wal_len = 0;
        tracing::debug!(commands = state.queue.len(), "queue compacted into segments");
        Ok(())
    }
}

impl CommandQueue for PersistentQueue {
    fn enqueue(
        &self,
        agent: &str,
        action: &str,
        payload: &str,
        submitted_at: Timestamp,
        signature: &str,
    ) -> Result<CommandId, QueueError> {
        let span = tracing::info_span!(
            "queue_enqueue",
            agent,
            id = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        );
        let _guard = span.enter();
        let start = std::time::Instant::now();
        let mut state = self.state.write();
        let record = state
            .queue
            .plan_enqueue(agent, action, payload, submitted_at, signature);
        let id = record.command_id();
        let res = self.commit(&mut state, record);
        let elapsed = start.elapsed().as_millis() as u64;
        span.record("latency_ms", &elapsed);
        match res {
            Ok(()) => {
                span.record("id", &id);
                tracing::debug!("enqueue committed to wal");
                Ok(id)
            }
            Err(err) => {
                tracing::error!(error = %err, "enqueue failed");
                Err(err)
            }
        }
    }

    fn peek_next(&self, agent: &str) -> Result<Option<Command>, QueueError> {
        Ok(self.state.read().queue.head_pending(agent).cloned())
    }

    fn claim_next(&self, agent: &str) -> Result<Option<Command>, QueueError> {
        let mut state = self.state.write();
        let Some(record) = state.queue.plan_claim(agent) else {
            return Ok(None);
        };
        self.commit(&mut state, record)?;
        Ok(state.queue.head_pending(agent).cloned())
    }

    fn record_result(&self, id: CommandId, result: &str) -> Result<bool, QueueError> {
        let span = tracing::info_span!("queue_record_result", id, latency_ms = tracing::field::Empty);
        let _guard = span.enter();
        let start = std::time::Instant::now();
        let mut state = self.state.write();
        let Some(record) = state.queue.plan_resolve(id, result) else {
            tracing::debug!("no command with this id");
            return Ok(false);
        };
        self.commit(&mut state, record)?;
        let elapsed = start.elapsed().as_millis() as u64;
        span.record("latency_ms", &elapsed);
        Ok(true)
    }

    fn get(&self, id: CommandId) -> Option<Command> {
        self.state.read().queue.get(id).cloned()
    }

    fn read(&self, offset: usize, limit: usize) -> Vec<Command> {
        self.state.read().queue.read(offset, limit)
    }

    fn len(&self) -> usize {
        self.state.read().queue.len()
    }

    fn pending_count(&self) -> usize {
        self.state.read().queue.pending_count()
    }

    fn storage_usage_bytes(&self) -> Option<u64> {
        let size = |path: &Path| fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Some(size(&self.wal_path) + size(&self.segments_path) + size(&self.meta_path))
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file =
            File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to atomically replace {} -> {}",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

fn checksum(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(CHECKSUM_DOMAIN);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

fn encode_frame(record: &QueueRecord) -> Result<Vec<u8>, QueueError> {
    let bytes = serde_json::to_vec(record).context("failed to serialize queue record")?;
    let len = u32::try_from(bytes.len()).context("queue record too large")?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + bytes.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&checksum(&bytes));
    frame.extend_from_slice(&bytes);
    Ok(frame)
}

/// What to do with a frame cut short by the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailPolicy {
    /// Stop before it; the bytes belong to an unacknowledged append.
    Discard,
    /// Fail; the file is only ever replaced atomically.
    Reject,
}

struct Frames {
    records: Vec<QueueRecord>,
    /// Bytes covered by complete frames.
    valid_len: u64,
    file_len: u64,
}

fn read_frames(path: &Path, tail: TailPolicy) -> Result<Frames, QueueError> {
    if !path.exists() {
        return Ok(Frames {
            records: Vec::new(),
            valid_len: 0,
            file_len: 0,
        });
    }
    let mut file =
        File::open(path).with_context(|| format!("failed to open queue file {}", path.display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("failed to read queue file {}", path.display()))?;
    let mut cursor = 0usize;
    let mut items = Vec::new();
    while cursor < buf.len() {
        let frame = buf.get(cursor..cursor + FRAME_HEADER).and_then(|header| {
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let start = cursor + FRAME_HEADER;
            buf.get(start..start + len)
                .map(|payload| (&header[4..], payload))
        });
        let Some((stored, payload)) = frame else {
            match tail {
                TailPolicy::Discard => break,
                TailPolicy::Reject => {
                    return Err(anyhow::anyhow!("truncated record in {}", path.display()).into())
                }
            }
        };
        if checksum(payload).as_slice() != stored {
            return Err(anyhow::anyhow!("checksum mismatch in {}", path.display()).into());
        }
        let record: QueueRecord =
            serde_json::from_slice(payload).context("failed to decode queue record")?;
        items.push(record);
        cursor += FRAME_HEADER + payload.len();
    }
    Ok(Frames {
        records: items,
        valid_len: cursor as u64,
        file_len: buf.len() as u64,
    })
}
