use protocol::{CommandId, LiveStatus, StreamEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(Uuid);

impl std::fmt::Display for ViewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Placed on the command's ordered channel.
    Queued,
    /// Channel was full; the chunk is gone.
    Dropped,
    /// Nobody is watching this command.
    NoSubscribers,
    /// A terminal status was already published; late chunks are discarded.
    Closed,
    /// Status skipped the full channel and went straight to viewers.
    Bypassed,
}

#[derive(Debug, Clone, Copy)]
pub struct HubLimits {
    pub chunk_capacity: usize,
    pub viewer_capacity: usize,
}

impl Default for HubLimits {
    fn default() -> Self {
        Self {
            chunk_capacity: 100,
            viewer_capacity: 256,
        }
    }
}

struct Subscription {
    generation: u64,
    viewers: HashMap<ViewerId, mpsc::Sender<StreamEvent>>,
    chunks: mpsc::Sender<StreamEvent>,
    /// Set once a terminal status has been published.
    terminal: Arc<AtomicBool>,
    /// Set when a status had to bypass the channel; anything still queued
    /// would arrive after it and is discarded instead.
    bypassed: Arc<AtomicBool>,
    fan_out: JoinHandle<()>,
}

struct HubInner {
    subscriptions: RwLock<HashMap<CommandId, Subscription>>,
    limits: HubLimits,
    generations: AtomicU64,
}

impl HubInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<CommandId, Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CommandId, Subscription>> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-command fan-out of live output to dashboard viewers.
///
/// A subscription exists exactly while at least one viewer is registered.
/// Each has a bounded chunk channel drained by one fan-out task, so every
/// viewer sees chunks in publish order. Delivery never waits on a viewer: a
/// viewer whose queue is full or closed is dropped.
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

/// A registered viewer. Dropping it unregisters.
pub struct Viewer {
    hub: Weak<HubInner>,
    command_id: CommandId,
    id: ViewerId,
    events: mpsc::Receiver<StreamEvent>,
}

impl Viewer {
    pub fn id(&self) -> ViewerId {
        self.id
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// Next event, or `None` once the hub has dropped this viewer.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            unregister(&inner, self.command_id, self.id);
        }
    }
}

impl StreamHub {
    pub fn new(limits: HubLimits) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscriptions: RwLock::new(HashMap::new()),
                limits: HubLimits {
                    chunk_capacity: limits.chunk_capacity.max(1),
                    viewer_capacity: limits.viewer_capacity.max(1),
                },
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Adds a viewer, creating the subscription and its fan-out task if this
    /// is the first one. Must be called inside a tokio runtime.
    pub fn register(&self, command_id: CommandId) -> Viewer {
        let id = ViewerId(Uuid::new_v4());
        let (viewer_tx, viewer_rx) = mpsc::channel(self.inner.limits.viewer_capacity);
        let mut subscriptions = self.inner.write();
        let subscription = subscriptions
            .entry(command_id)
            .or_insert_with(|| self.open_subscription(command_id));
        subscription.viewers.insert(id, viewer_tx);
        let viewers = subscription.viewers.len();
        drop(subscriptions);
        tracing::debug!(
            event = "hub.register",
            command_id = %command_id,
            viewer = %id,
            viewers,
            "viewer registered"
        );
        Viewer {
            hub: Arc::downgrade(&self.inner),
            command_id,
            id,
            events: viewer_rx,
        }
    }

    fn open_subscription(&self, command_id: CommandId) -> Subscription {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let (chunks, chunk_rx) = mpsc::channel(self.inner.limits.chunk_capacity);
        let bypassed = Arc::new(AtomicBool::new(false));
        let fan_out = tokio::spawn(fan_out(
            Arc::downgrade(&self.inner),
            command_id,
            generation,
            chunk_rx,
            Arc::clone(&bypassed),
        ));
        tracing::debug!(
            event = "hub.subscription_opened",
            command_id = %command_id,
            generation,
            "subscription opened"
        );
        Subscription {
            generation,
            viewers: HashMap::new(),
            chunks,
            terminal: Arc::new(AtomicBool::new(false)),
            bypassed,
            fan_out,
        }
    }

    /// Removes a viewer; the last one out tears the subscription down.
    /// Unknown viewers are ignored.
    pub fn unregister(&self, command_id: CommandId, viewer: ViewerId) {
        unregister(&self.inner, command_id, viewer);
    }

    /// Non-blocking. A full channel drops the chunk.
    pub fn publish(&self, command_id: CommandId, chunk: impl Into<String>) -> PublishOutcome {
        let subscriptions = self.inner.read();
        let Some(subscription) = subscriptions.get(&command_id) else {
            return PublishOutcome::NoSubscribers;
        };
        if subscription.terminal.load(Ordering::Acquire) {
            return PublishOutcome::Closed;
        }
        match subscription
            .chunks
            .try_send(StreamEvent::chunk(command_id, chunk))
        {
            Ok(()) => PublishOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    event = "hub.chunk_dropped",
                    command_id = %command_id,
                    "chunk channel full, dropping chunk"
                );
                PublishOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => PublishOutcome::NoSubscribers,
        }
    }

    /// Status events follow already-queued chunks when the channel has room.
    /// A terminal status that finds the channel full goes straight to every
    /// viewer instead, and the backlog behind it is discarded; it is never
    /// dropped for a viewer that is keeping up.
    pub fn publish_status(
        &self,
        command_id: CommandId,
        status: LiveStatus,
        output: Option<String>,
    ) -> PublishOutcome {
        let event = StreamEvent::status(command_id, status, output);
        let mut failed = Vec::new();
        let outcome = {
            let subscriptions = self.inner.read();
            let Some(subscription) = subscriptions.get(&command_id) else {
                return PublishOutcome::NoSubscribers;
            };
            let already_terminal = if status.is_terminal() {
                subscription.terminal.swap(true, Ordering::AcqRel)
            } else {
                subscription.terminal.load(Ordering::Acquire)
            };
            if already_terminal {
                return PublishOutcome::Closed;
            }
            match subscription.chunks.try_send(event) {
                Ok(()) => PublishOutcome::Queued,
                // Progress statuses are informational and share the chunks' fate.
                Err(_) if !status.is_terminal() => PublishOutcome::Dropped,
                Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                    subscription.bypassed.store(true, Ordering::Release);
                    for (viewer, sender) in &subscription.viewers {
                        if sender.try_send(event.clone()).is_err() {
                            failed.push(*viewer);
                        }
                    }
                    PublishOutcome::Bypassed
                }
            }
        };
        for viewer in failed {
            drop_slow_viewer(&self.inner, command_id, viewer);
        }
        outcome
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.read().len()
    }

    pub fn viewer_count(&self, command_id: CommandId) -> usize {
        self.inner
            .read()
            .get(&command_id)
            .map_or(0, |subscription| subscription.viewers.len())
    }
}

fn unregister(inner: &HubInner, command_id: CommandId, viewer: ViewerId) {
    let mut subscriptions = inner.write();
    let Some(subscription) = subscriptions.get_mut(&command_id) else {
        return;
    };
    if subscription.viewers.remove(&viewer).is_none() {
        return;
    }
    tracing::debug!(
        event = "hub.unregister",
        command_id = %command_id,
        viewer = %viewer,
        remaining = subscription.viewers.len(),
        "viewer unregistered"
    );
    if !subscription.viewers.is_empty() {
        return;
    }
    // Removing the entry under the write lock makes this the only teardown.
    let removed = subscriptions.remove(&command_id);
    drop(subscriptions);
    if let Some(subscription) = removed {
        subscription.fan_out.abort();
        tracing::debug!(
            event = "hub.subscription_closed",
            command_id = %command_id,
            generation = subscription.generation,
            "subscription torn down"
        );
    }
}

fn drop_slow_viewer(inner: &HubInner, command_id: CommandId, viewer: ViewerId) {
    tracing::warn!(
        event = "hub.viewer_dropped",
        command_id = %command_id,
        viewer = %viewer,
        "viewer not keeping up, disconnecting"
    );
    unregister(inner, command_id, viewer);
}

async fn fan_out(
    hub: Weak<HubInner>,
    command_id: CommandId,
    generation: u64,
    mut events: mpsc::Receiver<StreamEvent>,
    bypassed: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        if bypassed.load(Ordering::Acquire) {
            continue;
        }
        let Some(inner) = hub.upgrade() else {
            break;
        };
        let mut failed = Vec::new();
        {
            let subscriptions = inner.read();
            let Some(subscription) = subscriptions
                .get(&command_id)
                .filter(|subscription| subscription.generation == generation)
            else {
                break;
            };
            for (viewer, sender) in &subscription.viewers {
                if sender.try_send(event.clone()).is_err() {
                    failed.push(*viewer);
                }
            }
        }
        for viewer in failed {
            drop_slow_viewer(&inner, command_id, viewer);
        }
    }
}
