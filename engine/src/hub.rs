//! Log broadcast hub
//!
//! Per deployment, an append-only transcript plus a set of live subscribers.
//! Publishing never waits on a subscriber: each one gets a bounded queue and
//! is disconnected (flagged as lagged) when the queue is full, after which it
//! can resubscribe from the next sequence it expected.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::models::deployment::DeploymentId;
use crate::models::log_event::{LogEvent, LogRecord};

/// Default per-subscriber queue bound
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LogEvent>,
    lagged: Arc<AtomicBool>,
}

#[derive(Default)]
struct Channel {
    events: Vec<LogEvent>,
    subscribers: Vec<Subscriber>,
    attached: usize,
    closed: bool,
}

struct HubInner {
    channels: Mutex<HashMap<DeploymentId, Channel>>,
    subscriber_buffer: usize,
    next_subscriber: AtomicU64,
}

impl HubInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<DeploymentId, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, deployment_id: &DeploymentId, subscriber_id: u64) {
        let mut channels = self.channels();
        let evict = match channels.get_mut(deployment_id) {
            Some(channel) => {
                channel.subscribers.retain(|s| s.id != subscriber_id);
                channel.attached = channel.attached.saturating_sub(1);
                channel.closed && channel.attached == 0
            }
            None => false,
        };
        if evict {
            channels.remove(deployment_id);
            debug!(deployment_id = %deployment_id, "log channel evicted");
        }
    }
}

/// In-memory fan-out of deployment log events
#[derive(Clone)]
pub struct LogHub {
    inner: Arc<HubInner>,
}

impl LogHub {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                subscriber_buffer: subscriber_buffer.max(1),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Create the channel for a deployment; a no-op if it already exists
    pub fn open(&self, deployment_id: &DeploymentId) {
        self.inner
            .channels()
            .entry(deployment_id.clone())
            .or_default();
    }

    pub fn contains(&self, deployment_id: &DeploymentId) -> bool {
        self.inner.channels().contains_key(deployment_id)
    }

    /// Append an event, assign its sequence number and fan it out
    pub fn publish(
        &self,
        deployment_id: &DeploymentId,
        record: LogRecord,
    ) -> Result<LogEvent, EngineError> {
        let mut channels = self.inner.channels();
        let channel = channels
            .get_mut(deployment_id)
            .ok_or_else(|| EngineError::NotFound(format!("log channel {}", deployment_id)))?;
        if channel.closed {
            return Err(EngineError::Internal(format!(
                "log channel {} is closed",
                deployment_id
            )));
        }

        let event = LogEvent {
            deployment_id: deployment_id.clone(),
            sequence: channel.events.len() as u64,
            timestamp: Utc::now(),
            source: record.source,
            text: record.text,
            marker: record.marker,
        };
        channel.events.push(event.clone());

        channel.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        deployment_id = %deployment_id,
                        subscriber = subscriber.id,
                        "subscriber queue full, disconnecting"
                    );
                    subscriber.lagged.store(true, Ordering::SeqCst);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        Ok(event)
    }

    /// Attach a subscriber that first replays events from `from_sequence`
    pub fn subscribe(
        &self,
        deployment_id: &DeploymentId,
        from_sequence: u64,
    ) -> Result<Subscription, EngineError> {
        let mut channels = self.inner.channels();
        let channel = channels
            .get_mut(deployment_id)
            .ok_or_else(|| EngineError::NotFound(format!("log channel {}", deployment_id)))?;

        let start = (from_sequence as usize).min(channel.events.len());
        let replay: VecDeque<LogEvent> = channel.events[start..].iter().cloned().collect();
        let subscriber_id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let lagged = Arc::new(AtomicBool::new(false));

        let live = if channel.closed {
            None
        } else {
            let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer);
            channel.subscribers.push(Subscriber {
                id: subscriber_id,
                tx,
                lagged: lagged.clone(),
            });
            Some(rx)
        };
        channel.attached += 1;

        Ok(Subscription {
            replay,
            live,
            lagged,
            next_sequence: from_sequence,
            attachment: Some(Attachment {
                hub: self.inner.clone(),
                deployment_id: deployment_id.clone(),
                subscriber_id,
            }),
        })
    }

    /// Events with sequence >= `from_sequence`
    pub fn events_since(&self, deployment_id: &DeploymentId, from_sequence: u64) -> Vec<LogEvent> {
        self.inner
            .channels()
            .get(deployment_id)
            .map(|channel| {
                let start = (from_sequence as usize).min(channel.events.len());
                channel.events[start..].to_vec()
            })
            .unwrap_or_default()
    }

    /// Sequence number the next published event will get
    pub fn next_sequence(&self, deployment_id: &DeploymentId) -> Option<u64> {
        self.inner
            .channels()
            .get(deployment_id)
            .map(|channel| channel.events.len() as u64)
    }

    /// Live subscribers currently attached
    pub fn subscriber_count(&self, deployment_id: &DeploymentId) -> usize {
        self.inner
            .channels()
            .get(deployment_id)
            .map(|channel| channel.subscribers.len())
            .unwrap_or(0)
    }

    /// Mark the transcript complete. Live subscribers finish once they have
    /// drained their queue; the buffer is evicted when none remain.
    pub fn close(&self, deployment_id: &DeploymentId) {
        let mut channels = self.inner.channels();
        let evict = match channels.get_mut(deployment_id) {
            Some(channel) => {
                channel.closed = true;
                channel.subscribers.clear();
                channel.attached == 0
            }
            None => false,
        };
        if evict {
            channels.remove(deployment_id);
            debug!(deployment_id = %deployment_id, "log channel evicted");
        }
    }

    /// Drop the buffer regardless of attached subscribers
    pub fn evict(&self, deployment_id: &DeploymentId) {
        self.inner.channels().remove(deployment_id);
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

struct Attachment {
    hub: Arc<HubInner>,
    deployment_id: DeploymentId,
    subscriber_id: u64,
}

/// A subscriber's view of a transcript: buffered history, then live events
pub struct Subscription {
    replay: VecDeque<LogEvent>,
    live: Option<mpsc::Receiver<LogEvent>>,
    lagged: Arc<AtomicBool>,
    next_sequence: u64,
    attachment: Option<Attachment>,
}

impl Subscription {
    /// A finished transcript loaded from durable storage
    pub fn from_transcript(events: Vec<LogEvent>, from_sequence: u64) -> Self {
        let replay: VecDeque<LogEvent> = events
            .into_iter()
            .filter(|event| event.sequence >= from_sequence)
            .collect();
        Self {
            replay,
            live: None,
            lagged: Arc::new(AtomicBool::new(false)),
            next_sequence: from_sequence,
            attachment: None,
        }
    }

    /// Sequence number of the next event this subscriber expects
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Next event; `Ok(None)` once the transcript is complete
    pub async fn next(&mut self) -> Result<Option<LogEvent>, EngineError> {
        if let Some(event) = self.replay.pop_front() {
            self.next_sequence = event.sequence + 1;
            return Ok(Some(event));
        }

        loop {
            let event = match self.live.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            };

            return match event {
                // Cursor was ahead of the buffer when subscribing
                Some(event) if event.sequence < self.next_sequence => continue,
                Some(event) => {
                    self.next_sequence = event.sequence + 1;
                    Ok(Some(event))
                }
                None if self.lagged.load(Ordering::SeqCst) => Err(EngineError::SubscriberLagged {
                    next_sequence: self.next_sequence,
                }),
                None => {
                    self.live = None;
                    Ok(None)
                }
            };
        }
    }

    /// Adapt into a stream that ends after the transcript or the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<LogEvent, EngineError>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut subscription = state?;
            match subscription.next().await {
                Ok(Some(event)) => Some((Ok(event), Some(subscription))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment
                .hub
                .detach(&attachment.deployment_id, attachment.subscriber_id);
        }
    }
}
