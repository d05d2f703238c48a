//! In-process broker for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{BrokerError, BrokerResult};
use crate::queue::QueueSpec;
use crate::session::{BrokerConnector, BrokerSession, Delivery};

#[derive(Default)]
struct MemoryQueue {
    spec: Option<QueueSpec>,
    ready: VecDeque<Vec<u8>>,
    /// Delivery tag → (session id, body).
    unacked: HashMap<u64, (u64, Vec<u8>)>,
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, MemoryQueue>,
    next_tag: u64,
    next_session: u64,
    declarations: usize,
}

/// A broker held entirely in memory.
///
/// `Clone` shares the same queues, so a test can keep one handle while the
/// code under test connects through another.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
    reachable: Arc<AtomicBool>,
    fail_depth: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    open_sessions: Arc<AtomicUsize>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            notify: Arc::new(Notify::new()),
            reachable: Arc::new(AtomicBool::new(true)),
            fail_depth: Arc::new(AtomicBool::new(false)),
            connects: Arc::new(AtomicUsize::new(0)),
            open_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Successful connection attempts so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make depth checks fail on otherwise healthy sessions (or succeed again).
    pub fn set_fail_depth(&self, fail: bool) {
        self.fail_depth.store(fail, Ordering::SeqCst);
    }

    /// Sessions connected and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Enqueue a message directly, creating the queue if needed.
    pub fn push(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(body.into());
        self.notify.notify_waiters();
    }

    /// Ready messages on `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delivered but not yet acknowledged message count.
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.spec.is_some())
    }

    /// Successful declare calls so far.
    pub fn declarations(&self) -> usize {
        self.lock().declarations
    }

    fn session(&self) -> MemorySession {
        let id = {
            let mut state = self.lock();
            state.next_session += 1;
            state.next_session
        };
        MemorySession {
            id,
            broker: self.clone(),
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerSession>> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("memory broker unreachable".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.session()))
    }
}

struct MemorySession {
    id: u64,
    broker: MemoryBroker,
    open: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) && self.broker.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }

    fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.broker.lock();
        let tag = state.next_tag + 1;
        let q = state.queues.get_mut(queue)?;
        let body = q.ready.pop_front()?;
        q.unacked.insert(tag, (self.id, body.clone()));
        state.next_tag = tag;
        Some(Delivery { tag, body })
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let queue = state.queues.entry(spec.name.clone()).or_default();
        match &queue.spec {
            Some(existing) => {
                if let Some(reason) = existing.mismatch(spec) {
                    return Err(BrokerError::PreconditionFailed {
                        queue: spec.name.clone(),
                        reason,
                    });
                }
            }
            None => queue.spec = Some(spec.clone()),
        }
        state.declarations += 1;
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> BrokerResult<u32> {
        self.ensure_open()?;
        if self.broker.fail_depth.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel(format!("depth check on {queue} failed")));
        }
        Ok(self
            .broker
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u32)
            .unwrap_or(0))
    }

    async fn next_delivery(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
        loop {
            self.ensure_open()?;
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }
            notified.await;
        }
    }

    async fn ack(&self, tag: u64) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        for queue in state.queues.values_mut() {
            if queue.unacked.remove(&tag).is_some() {
                return Ok(());
            }
        }
        Err(BrokerError::Channel(format!("unknown delivery tag {tag}")))
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> BrokerResult<()> {
        self.ensure_open()?;
        self.broker.push(queue, body.to_vec());
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        // This session's unacked messages go back to the head of their queue.
        let mut state = self.broker.lock();
        for queue in state.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == self.id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some((_, body)) = queue.unacked.remove(&tag) {
                    queue.ready.push_front(body);
                }
            }
        }
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.broker.reachable.load(Ordering::SeqCst)
    }
}
