//! The execution log store facade.

use super::backend::LogBackend;
use super::entry::LogEntry;
use super::memory::InMemoryLogBackend;
use super::query::{LogPage, LogQuery, LogSummary, SortOrder, SummaryScope};
use super::replay::{ReplayBuffer, ReplaySnapshot};
use super::tail::{spawn_tail, TailMode, TailSession, TerminalProbe, WatchRegistry};
use crate::config::LogStoreConfig;
use crate::degradation::DegradationManager;
use crate::errors::StorageError;
use crate::utils::Timestamp;
use chrono::SubsecRound;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Service name under which durable log calls are guarded.
pub const LOG_STORE_SERVICE: &str = "log_store";

/// Last id and timestamp handed out for one execution.
#[derive(Debug, Default)]
struct Sequencer {
    last_id: u64,
    last_timestamp: Option<Timestamp>,
}

impl Sequencer {
    fn observe(&mut self, id: u64, timestamp: Option<Timestamp>) {
        self.last_id = self.last_id.max(id);
        self.last_timestamp = self.last_timestamp.max(timestamp);
    }

    /// Assigns the next id and raises the timestamp to the last one handed
    /// out, so `(timestamp, id)` order is append order.
    fn stamp(&mut self, entry: &mut LogEntry) {
        self.last_id += 1;
        entry.id = self.last_id;
        // Durable rows keep microseconds; match them so both paths sort alike.
        let timestamp = entry.timestamp.trunc_subsecs(6);
        entry.timestamp = self.last_timestamp.map_or(timestamp, |last| last.max(timestamp));
        self.last_timestamp = Some(entry.timestamp);
    }
}

/// Append-only, per-execution structured log.
///
/// Every append is sequenced here and written to the in-memory ring first,
/// so it is visible to the next read whatever happens to the durable write.
/// Durable writes go through the circuit breaker; a failed or skipped write
/// is parked in a bounded replay buffer and retried ahead of the next
/// durable write or read. Reads prefer the durable backend and fall back to
/// memory while it is unreachable or has entries still waiting for replay.
///
/// With a durable backend, appends take turns so rows reach it in sequence
/// order, and the memory ring of a finished execution is released once
/// nothing of it waits for replay.
pub struct ExecutionLogStore {
    config: LogStoreConfig,
    memory: Arc<InMemoryLogBackend>,
    durable: Option<Arc<dyn LogBackend>>,
    breaker: Arc<DegradationManager>,
    sequences: DashMap<Uuid, Arc<Mutex<Sequencer>>>,
    finished: DashSet<Uuid>,
    replay: ReplayBuffer,
    replay_lock: tokio::sync::Mutex<()>,
    watches: Arc<WatchRegistry>,
}

impl fmt::Debug for ExecutionLogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLogStore")
            .field("config", &self.config)
            .field("durable", &self.durable.as_ref().map(|d| d.name()))
            .field("pending_replay", &self.replay.len())
            .field("awaiting_release", &self.finished.len())
            .field("active_watches", &self.watches.active_watches())
            .finish_non_exhaustive()
    }
}

impl ExecutionLogStore {
    /// Creates a memory-only store.
    #[must_use]
    pub fn new(config: LogStoreConfig, breaker: Arc<DegradationManager>) -> Self {
        Self {
            memory: Arc::new(InMemoryLogBackend::new(config.memory_capacity_per_execution)),
            replay: ReplayBuffer::new(config.replay_buffer_capacity),
            config,
            durable: None,
            breaker,
            sequences: DashMap::new(),
            finished: DashSet::new(),
            replay_lock: tokio::sync::Mutex::new(()),
            watches: Arc::new(WatchRegistry::new()),
        }
    }

    /// Adds a durable backend.
    #[must_use]
    pub fn with_durable(mut self, backend: Arc<dyn LogBackend>) -> Self {
        self.durable = Some(backend);
        self
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &LogStoreConfig {
        &self.config
    }

    /// The in-memory ring.
    #[must_use]
    pub fn memory(&self) -> &InMemoryLogBackend {
        &self.memory
    }

    /// Appends an entry and returns it with its sequence number assigned.
    ///
    /// The timestamp is truncated to microseconds and never falls behind
    /// the previous entry of the same execution. Never fails: the entry
    /// always lands in memory, and a durable failure parks it for replay.
    pub async fn append(&self, mut entry: LogEntry) -> LogEntry {
        let execution_id = entry.execution_id;
        let durable_turn = match &self.durable {
            Some(_) => Some(self.replay_lock.lock().await),
            None => None,
        };

        let sequencer = self.sequencer(execution_id).await;
        {
            let mut sequencer = sequencer.lock();
            sequencer.stamp(&mut entry);
            self.memory.push(entry.clone());
        }

        if let Some(durable) = &self.durable {
            self.write_durable_locked(durable.as_ref(), &entry).await;
        }
        drop(durable_turn);
        self.watches.notify(execution_id);
        entry
    }

    /// Answers a query from the durable backend, or from memory when the
    /// durable path is unavailable.
    pub async fn query(&self, query: &LogQuery) -> LogPage {
        let limit = query.effective_limit(self.config.default_page_size, self.config.max_page_size);
        if let Some(durable) = self.readable_durable().await {
            match self
                .breaker
                .call(LOG_STORE_SERVICE, || durable.query(query, limit))
                .await
            {
                Ok(page) => return page,
                Err(e) => debug!(error = %e, "durable log query failed, serving from memory"),
            }
        }
        self.memory.query_now(query, limit)
    }

    /// Aggregates counts, with the same read preference as [`Self::query`].
    pub async fn summary(&self, scope: &SummaryScope) -> LogSummary {
        if let Some(durable) = self.readable_durable().await {
            match self
                .breaker
                .call(LOG_STORE_SERVICE, || durable.summary(scope))
                .await
            {
                Ok(summary) => return summary,
                Err(e) => debug!(error = %e, "durable log summary failed, serving from memory"),
            }
        }
        self.memory.summary_now(scope)
    }

    /// Starts a tail. The session closes when dropped, after a `Once`
    /// batch, or once `probe` reports the execution terminal.
    pub fn tail(
        self: &Arc<Self>,
        query: LogQuery,
        mode: TailMode,
        probe: Arc<dyn TerminalProbe>,
    ) -> TailSession {
        spawn_tail(Arc::clone(self), query, mode, probe)
    }

    /// A streaming mode using the configured poll interval.
    #[must_use]
    pub fn stream_mode(&self) -> TailMode {
        TailMode::Stream {
            poll_interval: self.config.tail_poll_interval(),
        }
    }

    /// Wakes the tails of an execution that has just ended.
    ///
    /// With a durable backend, the execution's memory ring and sequencer are
    /// released now, or after the replay that writes its last parked entry.
    pub async fn mark_terminal(&self, execution_id: Uuid) {
        self.watches.mark_terminal(execution_id);
        if self.durable.is_none() {
            return;
        }
        let _lock = self.replay_lock.lock().await;
        if self.replay.has_execution(execution_id) {
            debug!(%execution_id, "memory log ring kept until replay completes");
            self.finished.insert(execution_id);
        } else {
            self.release(execution_id);
        }
    }

    /// Removes every entry of an execution from memory, the replay buffer
    /// and the durable backend.
    pub async fn delete_execution(&self, execution_id: Uuid) -> Result<u64, StorageError> {
        let mut removed = self.memory.remove(execution_id);
        self.replay.discard_execution(execution_id);
        self.sequences.remove(&execution_id);
        self.finished.remove(&execution_id);
        if let Some(durable) = &self.durable {
            removed = removed.max(durable.delete_execution(execution_id).await?);
        }
        Ok(removed)
    }

    /// Writes parked entries to the durable backend. Returns true when
    /// nothing is left waiting.
    pub async fn flush_pending(&self) -> bool {
        let Some(durable) = &self.durable else {
            return true;
        };
        let _lock = self.replay_lock.lock().await;
        self.flush_locked(durable.as_ref()).await
    }

    /// Counters of the replay buffer.
    #[must_use]
    pub fn replay_metrics(&self) -> ReplaySnapshot {
        self.replay.snapshot()
    }

    /// Executions with a live tail.
    #[must_use]
    pub fn active_watches(&self) -> usize {
        self.watches.active_watches()
    }

    pub(crate) fn watches(&self) -> &Arc<WatchRegistry> {
        &self.watches
    }

    async fn sequencer(&self, execution_id: Uuid) -> Arc<Mutex<Sequencer>> {
        if let Some(sequencer) = self.sequences.get(&execution_id) {
            return Arc::clone(sequencer.value());
        }

        let mut resumed = Sequencer::default();
        if let Some(last) = self.memory.last_entry_now(execution_id) {
            resumed.observe(last.id, Some(last.timestamp));
        }
        if let Some(durable) = &self.durable {
            let durable = durable.as_ref();
            let newest = self
                .breaker
                .call(LOG_STORE_SERVICE, || async move {
                    let last_id = durable.last_sequence(execution_id).await?;
                    let latest = LogQuery::new(execution_id).sort(SortOrder::Desc);
                    let page = durable.query(&latest, 1).await?;
                    Ok::<_, StorageError>((last_id, page.entries.into_iter().next()))
                })
                .await;
            match newest {
                Ok((last_id, latest)) => {
                    resumed.observe(last_id.unwrap_or(0), None);
                    if let Some(entry) = latest {
                        resumed.observe(entry.id, Some(entry.timestamp));
                    }
                }
                Err(e) => warn!(%execution_id, error = %e, "could not read durable log sequence"),
            }
        }

        Arc::clone(
            self.sequences
                .entry(execution_id)
                .or_insert_with(|| Arc::new(Mutex::new(resumed)))
                .value(),
        )
    }

    async fn write_durable_locked(&self, durable: &dyn LogBackend, entry: &LogEntry) {
        if !self.flush_locked(durable).await {
            self.replay.push(entry.clone());
            return;
        }
        let written = self
            .breaker
            .call(LOG_STORE_SERVICE, || async move {
                // A refusal is an answer from a healthy backend.
                match durable.append(entry).await {
                    Err(StorageError::Refused(reason)) => Ok(Some(reason)),
                    other => other.map(|()| None),
                }
            })
            .await;
        match written {
            Ok(None) => {}
            Ok(Some(reason)) => {
                self.replay.mark_lost(1);
                warn!(
                    execution_id = %entry.execution_id,
                    seq = entry.id,
                    %reason,
                    "durable log store refused entry"
                );
            }
            Err(e) => {
                warn!(
                    execution_id = %entry.execution_id,
                    seq = entry.id,
                    error = %e,
                    "durable log write failed, buffering for replay"
                );
                self.replay.push(entry.clone());
            }
        }
    }

    async fn flush_locked(&self, durable: &dyn LogBackend) -> bool {
        let pending = self.replay.take_all();
        if pending.is_empty() {
            return true;
        }
        match self
            .breaker
            .call(LOG_STORE_SERVICE, || durable.append_batch(&pending))
            .await
        {
            Ok(refused) => {
                let written = pending.len().saturating_sub(refused);
                self.replay.mark_replayed(written);
                if refused > 0 {
                    self.replay.mark_lost(refused);
                    warn!(refused, "durable log store refused replayed entries");
                }
                info!(replayed = written, "replayed buffered log entries");
                self.release_finished();
                true
            }
            Err(e) => {
                debug!(pending = pending.len(), error = %e, "log replay deferred");
                self.replay.restore(pending);
                false
            }
        }
    }

    /// Called with the replay lock held.
    fn release_finished(&self) {
        self.finished.retain(|&execution_id| {
            if self.replay.has_execution(execution_id) {
                return true;
            }
            self.release(execution_id);
            false
        });
    }

    fn release(&self, execution_id: Uuid) {
        let dropped = self.memory.remove(execution_id);
        self.sequences.remove(&execution_id);
        debug!(%execution_id, dropped, "released memory log ring");
    }

    async fn readable_durable(&self) -> Option<&dyn LogBackend> {
        let durable = self.durable.as_deref()?;
        self.flush_pending().await.then_some(durable)
    }
}
