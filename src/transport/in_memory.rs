//! In-memory broker for tests and single-process deployments.
//!
//! Implements the same contract as the NATS transport:
//! - queue groups load-balance each message to exactly one member (round robin)
//! - streams capture every publish on a covered subject
//! - durable consumers keep their position across sessions; `ack` is
//!   terminal, `nak` puts the message back at the head of the consumer
//! - releasing a consumer hands its un-settled messages back for redelivery
//! - `shutdown()` makes the broker unreachable, to exercise failure paths
//!
//! ## Example
//!
//! ```
//! use sourced_messaging::transport::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! assert_eq!(broker.url(), "memory://broker");
//! assert!(broker.stream_names().is_empty());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::{Connector, Delivery, PullConsumer, QueueSubscription, Session};
use crate::config::ReconnectPolicy;
use crate::error::{BrokerError, Result};

const DEFAULT_URL: &str = "memory://broker";
const UNAVAILABLE: &str = "broker unavailable";

/// Shared in-memory broker. Clones are handles to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    online: AtomicBool,
    next_id: AtomicU64,
    state: Mutex<State>,
    /// Woken on every stored message and every nak/release.
    stored: Notify,
}

#[derive(Default)]
struct State {
    groups: Vec<QueueGroup>,
    streams: BTreeMap<String, StreamLog>,
    consumers: HashMap<(String, String), DurableState>,
}

struct QueueGroup {
    subject: String,
    queue: String,
    members: Vec<Member>,
    cursor: usize,
}

struct Member {
    id: u64,
    session: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct StreamLog {
    subjects: BTreeSet<String>,
    messages: Vec<StoredMessage>,
}

struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Bytes,
    deliveries: u32,
}

struct DurableState {
    filter: String,
    /// Index of the next never-delivered message in the stream log.
    cursor: usize,
    /// In-flight sequence -> consumer handle that pulled it.
    pending: BTreeMap<u64, u64>,
    redeliver: VecDeque<u64>,
    acked: BTreeSet<u64>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker reachable at `memory://broker`.
    pub fn new() -> Self {
        Self::with_url(DEFAULT_URL)
    }

    /// Create a broker reachable only at `url`.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                online: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                state: Mutex::new(State::default()),
                stored: Notify::new(),
            }),
        }
    }

    /// Address sessions must connect to.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Take the broker offline: connects, publishes, pulls, acks, and drains fail.
    pub fn shutdown(&self) {
        self.inner.online.store(false, Ordering::SeqCst);
        self.inner.stored.notify_waiters();
    }

    /// Bring the broker back online. Stored streams and consumers survive.
    pub fn restart(&self) {
        self.inner.online.store(true, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    /// Names of declared streams.
    pub fn stream_names(&self) -> Vec<String> {
        self.inner.state().streams.keys().cloned().collect()
    }

    /// Subjects captured by stream `name`.
    pub fn stream_subjects(&self, name: &str) -> Option<BTreeSet<String>> {
        self.inner
            .state()
            .streams
            .get(name)
            .map(|stream| stream.subjects.clone())
    }

    /// Number of messages stored in stream `name`.
    pub fn stream_len(&self, name: &str) -> usize {
        self.inner
            .state()
            .streams
            .get(name)
            .map(|stream| stream.messages.len())
            .unwrap_or(0)
    }

    /// How many times stream message `seq` has been handed to a consumer.
    pub fn delivery_count(&self, stream: &str, seq: u64) -> u32 {
        self.inner
            .state()
            .streams
            .get(stream)
            .and_then(|log| log.messages.get(seq.saturating_sub(1) as usize))
            .map(|message| message.deliveries)
            .unwrap_or(0)
    }

    /// Sequences acknowledged by durable consumer `durable` on `stream`.
    pub fn acked(&self, stream: &str, durable: &str) -> Vec<u64> {
        self.inner
            .state()
            .consumers
            .get(&(stream.to_string(), durable.to_string()))
            .map(|consumer| consumer.acked.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Messages pulled by `durable` but neither acked nor nak'd yet.
    pub fn in_flight(&self, stream: &str, durable: &str) -> usize {
        self.inner
            .state()
            .consumers
            .get(&(stream.to_string(), durable.to_string()))
            .map(|consumer| consumer.pending.len())
            .unwrap_or(0)
    }

    /// Current members of queue group `queue` on `subject`.
    pub fn queue_members(&self, subject: &str, queue: &str) -> usize {
        self.inner
            .state()
            .groups
            .iter()
            .find(|group| group.subject == subject && group.queue == queue)
            .map(|group| group.members.len())
            .unwrap_or(0)
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Store into covering streams and fan out to queue groups.
    /// Returns how many streams stored the message.
    fn route(&self, subject: &str, payload: Bytes) -> usize {
        let mut state = self.state();

        let mut stored = 0;
        for stream in state.streams.values_mut() {
            if stream.subjects.contains(subject) {
                let seq = stream.messages.len() as u64 + 1;
                stream.messages.push(StoredMessage {
                    seq,
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    deliveries: 0,
                });
                stored += 1;
            }
        }

        for group in state.groups.iter_mut().filter(|g| g.subject == subject) {
            while !group.members.is_empty() {
                let index = group.cursor % group.members.len();
                group.cursor = group.cursor.wrapping_add(1);
                if group.members[index].tx.send(payload.clone()).is_ok() {
                    break;
                }
                // Receiver is gone; drop the member and try the next one.
                group.members.remove(index);
            }
        }
        state.groups.retain(|group| !group.members.is_empty());
        drop(state);

        if stored > 0 {
            self.stored.notify_waiters();
        }
        stored
    }

    fn release_pending(&self, stream: &str, durable: &str, handle: u64) {
        let mut state = self.state();
        if let Some(consumer) = state
            .consumers
            .get_mut(&(stream.to_string(), durable.to_string()))
        {
            let returned: Vec<u64> = consumer
                .pending
                .iter()
                .filter(|(_, owner)| **owner == handle)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in returned {
                consumer.pending.remove(&seq);
                consumer.redeliver.push_back(seq);
            }
        }
        drop(state);
        self.stored.notify_waiters();
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, address: &str, _policy: &ReconnectPolicy) -> Result<Arc<dyn Session>> {
        if address != self.inner.url {
            return Err(BrokerError::Connection {
                address: address.to_string(),
                attempts: 1,
                reason: format!("no in-memory broker at {address}"),
            });
        }
        if !self.inner.is_online() {
            return Err(BrokerError::Connection {
                address: address.to_string(),
                attempts: 1,
                reason: UNAVAILABLE.to_string(),
            });
        }
        Ok(Arc::new(InMemorySession {
            id: self.inner.next_id(),
            broker: Arc::clone(&self.inner),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A session on an [`InMemoryBroker`].
pub struct InMemorySession {
    id: u64,
    broker: Arc<Inner>,
    closed: Arc<AtomicBool>,
}

impl InMemorySession {
    /// `NotConnected` once drained; `unavailable` while the broker is offline.
    fn check_open(&self, unavailable: impl FnOnce(String) -> BrokerError) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::NotConnected)
        } else if !self.broker.is_online() {
            Err(unavailable(UNAVAILABLE.to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.check_open(|reason| BrokerError::Publish {
            subject: subject.to_string(),
            reason,
        })?;
        self.broker.route(subject, payload);
        Ok(())
    }

    async fn publish_durable(&self, subject: &str, payload: Bytes) -> Result<()> {
        let stream_error = |reason: String| BrokerError::StreamPublish {
            subject: subject.to_string(),
            reason,
        };
        self.check_open(stream_error)?;

        let covered = self
            .broker
            .state()
            .streams
            .values()
            .any(|stream| stream.subjects.contains(subject));
        if !covered {
            return Err(stream_error("no stream covers subject".to_string()));
        }
        self.broker.route(subject, payload);
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
    ) -> Result<Box<dyn QueueSubscription>> {
        self.check_open(|reason| BrokerError::Subscribe {
            subject: subject.to_string(),
            reason,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let member = Member {
            id: self.broker.next_id(),
            session: self.id,
            tx,
        };
        let member_id = member.id;

        let mut state = self.broker.state();
        match state
            .groups
            .iter_mut()
            .find(|group| group.subject == subject && group.queue == queue)
        {
            Some(group) => group.members.push(member),
            None => state.groups.push(QueueGroup {
                subject: subject.to_string(),
                queue: queue.to_string(),
                members: vec![member],
                cursor: 0,
            }),
        }

        Ok(Box::new(InMemoryQueueSubscription {
            broker: Arc::clone(&self.broker),
            subject: subject.to_string(),
            queue: queue.to_string(),
            member: member_id,
            rx,
        }))
    }

    async fn declare_stream(&self, name: &str, subjects: &[String]) -> Result<()> {
        if subjects.is_empty() {
            return Err(BrokerError::EmptyTopicList);
        }
        self.check_open(|reason| BrokerError::StreamDeclare {
            name: name.to_string(),
            reason,
        })?;

        let wanted: BTreeSet<String> = subjects.iter().cloned().collect();
        let mut state = self.broker.state();

        if let Some(existing) = state.streams.get(name) {
            if existing.subjects == wanted {
                return Ok(());
            }
            return Err(BrokerError::StreamConflict {
                name: name.to_string(),
                reason: format!(
                    "existing subjects {:?}, requested {:?}",
                    existing.subjects, wanted
                ),
            });
        }

        for (other, stream) in &state.streams {
            if let Some(overlap) = stream.subjects.intersection(&wanted).next() {
                return Err(BrokerError::StreamConflict {
                    name: name.to_string(),
                    reason: format!("subject {overlap} already captured by stream {other}"),
                });
            }
        }

        state.streams.insert(
            name.to_string(),
            StreamLog {
                subjects: wanted,
                messages: Vec::new(),
            },
        );
        Ok(())
    }

    async fn pull_consumer(&self, subject: &str, durable: &str) -> Result<Box<dyn PullConsumer>> {
        self.check_open(|reason| BrokerError::Subscribe {
            subject: subject.to_string(),
            reason,
        })?;

        let mut state = self.broker.state();
        let stream = state
            .streams
            .iter()
            .find(|(_, log)| log.subjects.contains(subject))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| BrokerError::StreamNotFound(subject.to_string()))?;

        let consumer = state
            .consumers
            .entry((stream.clone(), durable.to_string()))
            .or_insert_with(|| DurableState {
                filter: subject.to_string(),
                cursor: 0,
                pending: BTreeMap::new(),
                redeliver: VecDeque::new(),
                acked: BTreeSet::new(),
            });
        if consumer.filter != subject {
            return Err(BrokerError::Subscribe {
                subject: subject.to_string(),
                reason: format!(
                    "durable {durable} already filters on {}",
                    consumer.filter
                ),
            });
        }

        Ok(Box::new(InMemoryPullConsumer {
            broker: Arc::clone(&self.broker),
            session_closed: Arc::clone(&self.closed),
            stream,
            durable: durable.to_string(),
            handle: self.broker.next_id(),
        }))
    }

    async fn drain(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let mut state = self.broker.state();
        for group in state.groups.iter_mut() {
            group.members.retain(|member| member.session != self.id);
        }
        state.groups.retain(|group| !group.members.is_empty());
        drop(state);
        self.broker.stored.notify_waiters();

        if !self.broker.is_online() {
            return Err(BrokerError::Disconnect(format!(
                "{UNAVAILABLE}: outstanding publishes could not be flushed"
            )));
        }
        Ok(())
    }
}

struct InMemoryQueueSubscription {
    broker: Arc<Inner>,
    subject: String,
    queue: String,
    member: u64,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl QueueSubscription for InMemoryQueueSubscription {
    async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.rx.close();
        let mut state = self.broker.state();
        if let Some(group) = state
            .groups
            .iter_mut()
            .find(|group| group.subject == self.subject && group.queue == self.queue)
        {
            group.members.retain(|member| member.id != self.member);
        }
        state.groups.retain(|group| !group.members.is_empty());
        drop(state);

        if !self.broker.is_online() {
            return Err(BrokerError::Subscribe {
                subject: self.subject.clone(),
                reason: format!("{UNAVAILABLE}: unsubscribe not confirmed"),
            });
        }
        Ok(())
    }
}

struct InMemoryPullConsumer {
    broker: Arc<Inner>,
    session_closed: Arc<AtomicBool>,
    stream: String,
    durable: String,
    handle: u64,
}

impl InMemoryPullConsumer {
    fn take_batch(&self, batch: usize) -> Result<Vec<Box<dyn Delivery>>> {
        if self.session_closed.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let fetch_error = |reason: String| BrokerError::Subscribe {
            subject: self.durable.clone(),
            reason,
        };
        if !self.broker.is_online() {
            return Err(fetch_error(UNAVAILABLE.to_string()));
        }

        let mut state = self.broker.state();
        let State {
            streams, consumers, ..
        } = &mut *state;
        let log = streams
            .get_mut(&self.stream)
            .ok_or_else(|| fetch_error(format!("stream {} no longer exists", self.stream)))?;
        let consumer = consumers
            .get_mut(&(self.stream.clone(), self.durable.clone()))
            .ok_or_else(|| fetch_error(format!("durable {} no longer exists", self.durable)))?;

        let mut seqs = Vec::with_capacity(batch);
        while seqs.len() < batch {
            match consumer.redeliver.pop_front() {
                Some(seq) => seqs.push(seq),
                None => break,
            }
        }
        while seqs.len() < batch && consumer.cursor < log.messages.len() {
            let message = &log.messages[consumer.cursor];
            consumer.cursor += 1;
            if message.subject == consumer.filter {
                seqs.push(message.seq);
            }
        }

        let mut deliveries: Vec<Box<dyn Delivery>> = Vec::with_capacity(seqs.len());
        for seq in seqs {
            consumer.pending.insert(seq, self.handle);
            let message = &mut log.messages[(seq - 1) as usize];
            message.deliveries += 1;
            deliveries.push(Box::new(InMemoryDelivery {
                broker: Arc::clone(&self.broker),
                stream: self.stream.clone(),
                durable: self.durable.clone(),
                seq,
                subject: message.subject.clone(),
                payload: message.payload.clone(),
            }));
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl PullConsumer for InMemoryPullConsumer {
    async fn fetch(&mut self, batch: usize, expires: Duration) -> Result<Vec<Box<dyn Delivery>>> {
        // Keep a hot nak/redeliver cycle from starving other tasks.
        tokio::task::yield_now().await;

        let deadline = Instant::now() + expires;
        loop {
            let stored = self.broker.stored.notified();
            tokio::pin!(stored);
            stored.as_mut().enable();

            let deliveries = self.take_batch(batch)?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, stored).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn release(&mut self) -> Result<()> {
        self.broker
            .release_pending(&self.stream, &self.durable, self.handle);
        Ok(())
    }
}

struct InMemoryDelivery {
    broker: Arc<Inner>,
    stream: String,
    durable: String,
    seq: u64,
    subject: String,
    payload: Bytes,
}

impl InMemoryDelivery {
    fn settle(&self, ack: bool) -> Result<()> {
        if !self.broker.is_online() {
            return Err(BrokerError::Subscribe {
                subject: self.subject.clone(),
                reason: format!("{UNAVAILABLE}: cannot settle message {}", self.seq),
            });
        }

        let mut state = self.broker.state();
        if let Some(consumer) = state
            .consumers
            .get_mut(&(self.stream.clone(), self.durable.clone()))
        {
            if consumer.pending.remove(&self.seq).is_some() {
                if ack {
                    consumer.acked.insert(self.seq);
                } else {
                    consumer.redeliver.push_back(self.seq);
                }
            }
        }
        drop(state);

        if !ack {
            self.broker.stored.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<()> {
        self.settle(true)
    }

    async fn nak(&self) -> Result<()> {
        self.settle(false)
    }
}
