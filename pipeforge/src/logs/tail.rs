//! Live tails over an execution's log.
//!
//! A tail registers a watch on its execution. Every append notifies the
//! watch; the tail task wakes, reads strictly past its cursor and forwards
//! the new batch. It also wakes on a poll interval, so a missed
//! notification delays delivery by at most one interval. On every wake the
//! task asks a [`TerminalProbe`] whether the execution has ended; once it
//! has, the task drains what is left and closes the session.

use super::entry::LogEntry;
use super::query::{LogQuery, SortOrder};
use super::store::ExecutionLogStore;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// How a tail delivers entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailMode {
    /// Deliver the current matching window as one batch, then close.
    Once,
    /// Keep delivering new matching entries until the caller drops the
    /// session or the execution reaches a terminal status.
    Stream {
        /// Upper bound on the time between two reads.
        poll_interval: Duration,
    },
}

/// Answers whether an execution has ended.
#[async_trait]
pub trait TerminalProbe: Send + Sync {
    /// Returns true once no further entries will be appended.
    async fn is_terminal(&self, execution_id: Uuid) -> bool;
}

/// A probe that never reports terminal; the tail runs until dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverTerminal;

#[async_trait]
impl TerminalProbe for NeverTerminal {
    async fn is_terminal(&self, _execution_id: Uuid) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct Watch {
    notify: Notify,
    subscribers: AtomicUsize,
    terminal: AtomicBool,
}

/// Live watch registrations keyed by execution.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    watches: DashMap<Uuid, Arc<Watch>>,
}

impl WatchRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber. The registration lasts until the guard drops.
    pub fn subscribe(self: &Arc<Self>, execution_id: Uuid) -> WatchGuard {
        let watch = {
            let entry = self.watches.entry(execution_id).or_default();
            entry.subscribers.fetch_add(1, Ordering::SeqCst);
            Arc::clone(entry.value())
        };
        WatchGuard {
            registry: Arc::clone(self),
            execution_id,
            watch,
        }
    }

    /// Wakes every tail of an execution.
    pub fn notify(&self, execution_id: Uuid) {
        if let Some(watch) = self.watches.get(&execution_id) {
            watch.notify.notify_waiters();
        }
    }

    /// Flags an execution as ended and wakes its tails.
    pub fn mark_terminal(&self, execution_id: Uuid) {
        if let Some(watch) = self.watches.get(&execution_id) {
            watch.terminal.store(true, Ordering::SeqCst);
            watch.notify.notify_waiters();
        }
    }

    /// Executions with at least one live subscriber.
    #[must_use]
    pub fn active_watches(&self) -> usize {
        self.watches.len()
    }

    /// Live subscribers of one execution.
    #[must_use]
    pub fn subscribers(&self, execution_id: Uuid) -> usize {
        self.watches
            .get(&execution_id)
            .map_or(0, |w| w.subscribers.load(Ordering::SeqCst))
    }
}

/// A watch registration. Dropping the last guard of an execution removes
/// its entry from the registry.
#[derive(Debug)]
pub struct WatchGuard {
    registry: Arc<WatchRegistry>,
    execution_id: Uuid,
    watch: Arc<Watch>,
}

impl WatchGuard {
    fn is_terminal(&self) -> bool {
        self.watch.terminal.load(Ordering::SeqCst)
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.watch.subscribers.fetch_sub(1, Ordering::SeqCst);
        self.registry
            .watches
            .remove_if(&self.execution_id, |_, w| w.subscribers.load(Ordering::SeqCst) == 0);
    }
}

/// A stream of log batches. Dropping it stops the tail and releases its
/// watch registration.
#[derive(Debug)]
pub struct TailSession {
    rx: mpsc::Receiver<Vec<LogEntry>>,
    task: JoinHandle<()>,
}

impl TailSession {
    /// Waits for the next batch. Returns `None` once the tail has closed.
    pub async fn next_batch(&mut self) -> Option<Vec<LogEntry>> {
        self.rx.recv().await
    }

    /// Collects every remaining batch into one vector.
    pub async fn collect_all(mut self) -> Vec<LogEntry> {
        let mut all = Vec::new();
        while let Some(batch) = self.rx.recv().await {
            all.extend(batch);
        }
        all
    }
}

impl Stream for TailSession {
    type Item = Vec<LogEntry>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TailSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) fn spawn_tail(
    store: Arc<ExecutionLogStore>,
    query: LogQuery,
    mode: TailMode,
    probe: Arc<dyn TerminalProbe>,
) -> TailSession {
    let (tx, rx) = mpsc::channel(16);
    let guard = match mode {
        TailMode::Once => None,
        TailMode::Stream { .. } => Some(store.watches().subscribe(query.execution_id)),
    };
    let task = tokio::spawn(run_tail(store, query, mode, probe, tx, guard));
    TailSession { rx, task }
}

async fn run_tail(
    store: Arc<ExecutionLogStore>,
    mut query: LogQuery,
    mode: TailMode,
    probe: Arc<dyn TerminalProbe>,
    tx: mpsc::Sender<Vec<LogEntry>>,
    guard: Option<WatchGuard>,
) {
    query.sort = SortOrder::Asc;
    query.offset = 0;

    let initial = store.query(&query).await;
    if let Some(last) = initial.entries.last() {
        query.after_id = Some(last.id);
    }
    let (poll_interval, guard) = match (mode, guard) {
        (TailMode::Stream { poll_interval }, Some(guard)) => (poll_interval, guard),
        _ => {
            let _ = tx.send(initial.entries).await;
            return;
        }
    };
    if !initial.entries.is_empty() && tx.send(initial.entries).await.is_err() {
        return;
    }

    let execution_id = query.execution_id;
    loop {
        let notified = guard.watch.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !drain(&store, &mut query, &tx).await {
            break;
        }
        if guard.is_terminal() || probe.is_terminal(execution_id).await {
            let _ = drain(&store, &mut query, &tx).await;
            debug!(%execution_id, "tail reached terminal execution");
            break;
        }

        tokio::select! {
            () = tx.closed() => break,
            () = &mut notified => {}
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
    drop(guard);
}

/// Forwards every entry past the cursor. Returns false if the receiver is gone.
async fn drain(store: &ExecutionLogStore, query: &mut LogQuery, tx: &mpsc::Sender<Vec<LogEntry>>) -> bool {
    loop {
        let page = store.query(query).await;
        let Some(last) = page.entries.last() else {
            return !tx.is_closed();
        };
        query.after_id = Some(last.id);
        let has_more = page.has_more;
        if tx.send(page.entries).await.is_err() {
            return false;
        }
        if !has_more {
            return true;
        }
    }
}
