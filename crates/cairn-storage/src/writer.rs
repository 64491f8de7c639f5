//! Single background writer with batched, fsync-amortized appends.
//!
//! All mutations funnel through one writer. The submitting thread does the
//! bookkeeping that must be serial — under the append lock it rolls the
//! active segment if needed, assigns the op's body offset from the
//! predicted file length, adjusts the target segment's refcount, registers
//! ADD bytes in the in-flight map, and enqueues the op — so queue order
//! equals file order and the caller gets the op's location back without
//! waiting for disk.
//!
//! The background thread drains the queue in batches of up to
//! `max_batch_size` value bytes, concatenates per-segment data and log
//! buffers, performs one append per touched file and at most one fsync per
//! touched file, then releases sync waiters and in-flight refcounts. A
//! caller that passed `sync = true` blocks on a waiter until its batch is
//! durable; `sync()` enqueues a barrier with the same semantics.
//!
//! A fatal I/O error marks the store dead: every queued waiter is failed
//! with the recorded reason and all subsequent calls fail fast.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use bytes::Bytes;
use cairn_types::{Fingerprint, OpKind, SegmentId};

use crate::StorageError;
use crate::op_record::OpRecord;
use crate::segment::{DATA_HEADER_BYTES, Segment, SegmentRegistry, VALUE_LEN_BYTES};

/// Default cap on value bytes drained into one batch (4 MiB).
pub const DEFAULT_MAX_BATCH_SIZE: usize = 4 * 1024 * 1024;

/// Completion slot a synchronous caller blocks on.
struct Waiter {
    state: Mutex<Option<Result<(), String>>>,
    cond: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, result: Result<(), String>) {
        let mut state = self.state.lock().expect("waiter lock poisoned");
        *state = Some(result);
        self.cond.notify_all();
    }

    fn wait(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("waiter lock poisoned");
        loop {
            match state.take() {
                Some(Ok(())) => return Ok(()),
                Some(Err(reason)) => return Err(StorageError::WriterFailed { reason }),
                None => {
                    state = self.cond.wait(state).expect("waiter lock poisoned");
                }
            }
        }
    }
}

/// Store-dead marker shared by the writer and every caller.
#[derive(Default)]
pub(crate) struct DeadFlag {
    dead: AtomicBool,
    reason: Mutex<String>,
}

impl DeadFlag {
    pub(crate) fn mark(&self, reason: &str) {
        *self.reason.lock().expect("dead flag lock poisoned") = reason.to_string();
        self.dead.store(true, Ordering::Release);
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn reason(&self) -> String {
        self.reason.lock().expect("dead flag lock poisoned").clone()
    }

    pub(crate) fn check(&self) -> Result<(), StorageError> {
        if self.is_dead() {
            return Err(StorageError::WriterFailed {
                reason: self.reason(),
            });
        }
        Ok(())
    }
}

/// Buffer of not-yet-durable ADD values, consulted by reads.
///
/// Each pending ADD holds one reference; the latest bytes win so a read
/// between two pending revisions of a key sees the newer one.
#[derive(Default)]
pub(crate) struct InflightMap {
    map: RwLock<HashMap<Fingerprint, InflightEntry>>,
}

struct InflightEntry {
    bytes: Bytes,
    refs: usize,
}

impl InflightMap {
    pub(crate) fn get(&self, key: &Fingerprint) -> Option<Bytes> {
        self.map
            .read()
            .expect("in-flight lock poisoned")
            .get(key)
            .map(|entry| entry.bytes.clone())
    }

    fn register(&self, key: Fingerprint, bytes: Bytes) {
        let mut map = self.map.write().expect("in-flight lock poisoned");
        let entry = map.entry(key).or_insert(InflightEntry {
            bytes: bytes.clone(),
            refs: 0,
        });
        entry.bytes = bytes;
        entry.refs += 1;
    }

    fn release(&self, key: &Fingerprint) {
        let mut map = self.map.write().expect("in-flight lock poisoned");
        if let Some(entry) = map.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.read().expect("in-flight lock poisoned").len()
    }
}

enum Command {
    Write(PendingOp),
    Sync(Arc<Waiter>),
    Shutdown,
}

struct PendingOp {
    record: OpRecord,
    /// ADD value bytes; `None` for DELs.
    value: Option<Bytes>,
    waiter: Option<Arc<Waiter>>,
}

/// Enqueue-side state guarded by the append lock.
struct AppendState {
    active: Arc<Segment>,
    /// Predicted data-file length (header included) once everything
    /// enqueued so far has been flushed.
    predicted_data_len: u64,
}

/// Handle to the background writer.
pub(crate) struct JournalWriter {
    tx: Sender<Command>,
    append: Mutex<AppendState>,
    inflight: Arc<InflightMap>,
    dead: Arc<DeadFlag>,
    registry: Arc<SegmentRegistry>,
    file_size: u64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JournalWriter {
    /// Spawns the writer thread over the given active segment.
    pub(crate) fn spawn(
        registry: Arc<SegmentRegistry>,
        active: Arc<Segment>,
        force: bool,
        file_size: u64,
        max_batch_size: usize,
    ) -> Result<Self, StorageError> {
        let (tx, rx) = channel();
        let inflight = Arc::new(InflightMap::default());
        let dead = Arc::new(DeadFlag::default());

        let task = WriterTask {
            rx,
            registry: registry.clone(),
            inflight: inflight.clone(),
            dead: dead.clone(),
            force,
            max_batch_size,
        };
        let handle = std::thread::Builder::new()
            .name("cairn-writer".to_string())
            .spawn(move || task.run())?;

        let predicted_data_len = active.data_len();
        Ok(Self {
            tx,
            append: Mutex::new(AppendState {
                active,
                predicted_data_len,
            }),
            inflight,
            dead,
            registry,
            file_size,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn dead_error(&self) -> StorageError {
        let reason = self.dead.reason();
        StorageError::WriterFailed {
            reason: if reason.is_empty() {
                "writer thread stopped".to_string()
            } else {
                reason
            },
        }
    }

    /// Enqueues an ADD and returns the record with its assigned location.
    ///
    /// With `sync`, blocks until the op (and everything enqueued before it)
    /// is durable.
    pub(crate) fn store(
        &self,
        key: Fingerprint,
        value: Bytes,
        sync: bool,
    ) -> Result<OpRecord, StorageError> {
        self.dead.check()?;
        let waiter = if sync { Some(Waiter::new()) } else { None };

        let record;
        {
            let mut state = self.append.lock().expect("writer lock poisoned");
            let frame_len = (VALUE_LEN_BYTES + value.len()) as u64;

            // Roll once the data file has filled to the size limit. The
            // last value pushes the file *past* the limit, so every
            // finalized segment satisfies `data_len >= file_size` — the
            // property that makes it deletable once its refcount drains.
            if state.predicted_data_len >= self.file_size {
                let next = self.registry.roll()?;
                state.predicted_data_len = next.data_len();
                state.active = next;
            }

            record = OpRecord::new(
                OpKind::Add,
                key,
                state.active.id(),
                state.predicted_data_len - DATA_HEADER_BYTES,
            );
            state.predicted_data_len += frame_len;
            state.active.increment();
            self.inflight.register(key, value.clone());
            self.tx
                .send(Command::Write(PendingOp {
                    record,
                    value: Some(value),
                    waiter: waiter.clone(),
                }))
                .map_err(|_| self.dead_error())?;
        }

        if let Some(waiter) = waiter {
            waiter.wait()?;
        }
        Ok(record)
    }

    /// Enqueues the DEL cancelling `target`.
    pub(crate) fn remove(&self, target: OpRecord, sync: bool) -> Result<(), StorageError> {
        self.dead.check()?;
        let waiter = if sync { Some(Waiter::new()) } else { None };
        let del = target.cancelling();

        {
            // The lock is held only to keep queue order identical to the
            // order refcount adjustments are observed in.
            let _state = self.append.lock().expect("writer lock poisoned");
            if let Some(segment) = self.registry.get(del.segment()) {
                segment.decrement();
            }
            self.tx
                .send(Command::Write(PendingOp {
                    record: del,
                    value: None,
                    waiter: waiter.clone(),
                }))
                .map_err(|_| self.dead_error())?;
        }

        if let Some(waiter) = waiter {
            waiter.wait()?;
        }
        Ok(())
    }

    /// Blocks until everything enqueued so far is durable.
    pub(crate) fn sync(&self) -> Result<(), StorageError> {
        self.dead.check()?;
        let waiter = Waiter::new();
        self.tx
            .send(Command::Sync(waiter.clone()))
            .map_err(|_| self.dead_error())?;
        waiter.wait()
    }

    /// Serves reads of not-yet-durable values.
    pub(crate) fn in_flight(&self, key: &Fingerprint) -> Option<Bytes> {
        self.inflight.get(key)
    }

    /// Flushes the remaining queue and joins the writer thread.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self
            .handle
            .lock()
            .expect("writer lock poisoned")
            .take()
        {
            if handle.join().is_err() {
                self.dead.mark("writer thread panicked");
                tracing::error!("writer thread panicked during shutdown");
            }
        }
    }
}

/// The background half of the writer.
struct WriterTask {
    rx: Receiver<Command>,
    registry: Arc<SegmentRegistry>,
    inflight: Arc<InflightMap>,
    dead: Arc<DeadFlag>,
    force: bool,
    max_batch_size: usize,
}

impl WriterTask {
    fn run(self) {
        loop {
            let first = match self.rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            };

            let mut batch: Vec<PendingOp> = Vec::new();
            let mut barriers: Vec<Arc<Waiter>> = Vec::new();
            let mut pending_bytes = 0usize;
            let mut shutdown = false;

            let mut next = Some(first);
            loop {
                match next.take() {
                    Some(Command::Write(op)) => {
                        pending_bytes += op.value.as_ref().map_or(0, Bytes::len);
                        batch.push(op);
                    }
                    Some(Command::Sync(waiter)) => barriers.push(waiter),
                    Some(Command::Shutdown) => {
                        shutdown = true;
                        break;
                    }
                    None => {}
                }
                if pending_bytes >= self.max_batch_size {
                    break;
                }
                match self.rx.try_recv() {
                    Ok(command) => next = Some(command),
                    Err(_) => break,
                }
            }

            let outcome = if self.dead.is_dead() {
                Err(self.dead.reason())
            } else {
                self.flush(&batch).map_err(|e| {
                    let reason = e.to_string();
                    self.dead.mark(&reason);
                    tracing::error!(error = %e, "writer flush failed; store is dead");
                    reason
                })
            };

            match &outcome {
                Ok(()) => {
                    for op in &batch {
                        if op.record.kind() == OpKind::Add {
                            self.inflight.release(&op.record.key());
                        }
                        if let Some(waiter) = &op.waiter {
                            waiter.complete(Ok(()));
                        }
                    }
                    for barrier in &barriers {
                        barrier.complete(Ok(()));
                    }
                }
                Err(reason) => {
                    // In-flight entries stay: reads must not fall through
                    // to disk positions that were never written.
                    for op in &batch {
                        if let Some(waiter) = &op.waiter {
                            waiter.complete(Err(reason.clone()));
                        }
                    }
                    for barrier in &barriers {
                        barrier.complete(Err(reason.clone()));
                    }
                }
            }

            if shutdown {
                break;
            }
        }
    }

    fn flush(&self, batch: &[PendingOp]) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        // Concatenate per-segment buffers in enqueue order so every frame
        // lands at its enqueue-time offset.
        let mut data_bufs: BTreeMap<SegmentId, Vec<u8>> = BTreeMap::new();
        let mut log_bufs: BTreeMap<SegmentId, Vec<u8>> = BTreeMap::new();
        let mut first_offsets: BTreeMap<SegmentId, u64> = BTreeMap::new();

        for op in batch {
            let id = op.record.segment();
            if let Some(value) = &op.value {
                let buf = data_bufs.entry(id).or_default();
                if buf.is_empty() {
                    first_offsets.insert(id, op.record.offset());
                }
                buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
                buf.extend_from_slice(value);
            }
            log_bufs
                .entry(id)
                .or_default()
                .extend_from_slice(&op.record.to_bytes());
        }

        let mut touched: BTreeMap<SegmentId, Arc<Segment>> = BTreeMap::new();

        for (id, buf) in &data_bufs {
            let Some(segment) = self.registry.get(*id) else {
                return Err(StorageError::WriterFailed {
                    reason: format!("segment {id} vanished with pending value writes"),
                });
            };
            let offset = segment.append_data(buf)?;
            debug_assert_eq!(
                Some(&offset),
                first_offsets.get(id),
                "append position drifted from enqueue-time prediction"
            );
            touched.insert(*id, segment);
        }

        for (id, buf) in &log_bufs {
            let segment = match touched.get(id) {
                Some(segment) => segment.clone(),
                None => match self.registry.get(*id) {
                    Some(segment) => segment,
                    None => {
                        // A DEL can target a segment that drained and was
                        // deleted while this op sat in the queue.
                        tracing::debug!(segment = %id, "skipping log append to deleted segment");
                        continue;
                    }
                },
            };
            segment.append_log(buf)?;
            touched.insert(*id, segment);
        }

        // One fsync per touched file; O_SYNC stores are already durable.
        if !self.force {
            for segment in touched.values() {
                segment.sync_data()?;
                segment.sync_log()?;
            }
        }
        Ok(())
    }
}
