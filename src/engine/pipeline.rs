//! In-process event pipeline.
//!
//! One bounded channel per handler chain decouples the request path from
//! counter maintenance. Publishing never waits longer than the configured
//! enqueue wait; a full chain rejects the event instead.

use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

use crate::cache::lock::{rw_read, rw_write};
use crate::domain::events::{MutationEvent, MutationKind};
use crate::domain::types::CounterName;

use super::config::PipelineConfig;

const SOURCE: &str = "engine::pipeline";
const METRIC_PUBLISHED: &str = "tally_pipeline_published_total";
const METRIC_DROPPED: &str = "tally_pipeline_dropped_total";

/// A consumer chain; each owns exactly one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerChain {
    Likes,
    Comments,
    Views,
}

impl HandlerChain {
    pub const ALL: [HandlerChain; 3] = [Self::Likes, Self::Comments, Self::Views];

    pub fn for_kind(kind: MutationKind) -> Self {
        Self::for_counter(kind.counter())
    }

    pub fn for_counter(counter: CounterName) -> Self {
        match counter {
            CounterName::Likes => Self::Likes,
            CounterName::Comments => Self::Comments,
            CounterName::Views => Self::Views,
        }
    }

    pub fn counter(self) -> CounterName {
        match self {
            Self::Likes => CounterName::Likes,
            Self::Comments => CounterName::Comments,
            Self::Views => CounterName::Views,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Likes => "likes",
            Self::Comments => "comments",
            Self::Views => "views",
        }
    }
}

impl fmt::Display for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("handler chain `{chain}` is full; event {event_id} rejected")]
    Overflow { chain: HandlerChain, event_id: Uuid },
    #[error("event pipeline is closed")]
    Closed,
}

#[derive(Debug, Clone)]
struct ChainSenders {
    likes: mpsc::Sender<MutationEvent>,
    comments: mpsc::Sender<MutationEvent>,
    views: mpsc::Sender<MutationEvent>,
}

impl ChainSenders {
    fn get(&self, chain: HandlerChain) -> &mpsc::Sender<MutationEvent> {
        match chain {
            HandlerChain::Likes => &self.likes,
            HandlerChain::Comments => &self.comments,
            HandlerChain::Views => &self.views,
        }
    }
}

/// Receiving ends handed to the chain runners.
#[derive(Debug)]
pub struct ChainReceivers {
    pub likes: mpsc::Receiver<MutationEvent>,
    pub comments: mpsc::Receiver<MutationEvent>,
    pub views: mpsc::Receiver<MutationEvent>,
}

pub struct EventPipeline {
    senders: RwLock<Option<ChainSenders>>,
    sequence: AtomicU64,
    enqueue_wait: Duration,
}

impl EventPipeline {
    /// Creates the pipeline and the receivers its chains drain.
    pub fn open(config: &PipelineConfig) -> (Self, ChainReceivers) {
        let capacity = config.channel_capacity();
        let (likes_tx, likes_rx) = mpsc::channel(capacity);
        let (comments_tx, comments_rx) = mpsc::channel(capacity);
        let (views_tx, views_rx) = mpsc::channel(capacity);

        let pipeline = Self {
            senders: RwLock::new(Some(ChainSenders {
                likes: likes_tx,
                comments: comments_tx,
                views: views_tx,
            })),
            sequence: AtomicU64::new(0),
            enqueue_wait: config.enqueue_wait(),
        };
        let receivers = ChainReceivers {
            likes: likes_rx,
            comments: comments_rx,
            views: views_rx,
        };
        (pipeline, receivers)
    }

    /// Enqueues `event` on its chain and returns the assigned sequence number.
    pub async fn publish(&self, event: MutationEvent) -> Result<u64, PipelineError> {
        let chain = HandlerChain::for_kind(event.kind);
        let sender = self.sender(chain)?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = event.with_sequence(sequence);
        let event_id = event.id;
        let kind = event.kind;

        let result = if self.enqueue_wait.is_zero() {
            sender.try_send(event).map_err(|err| match err {
                TrySendError::Full(_) => PipelineError::Overflow { chain, event_id },
                TrySendError::Closed(_) => PipelineError::Closed,
            })
        } else {
            sender
                .send_timeout(event, self.enqueue_wait)
                .await
                .map_err(|err| match err {
                    SendTimeoutError::Timeout(_) => PipelineError::Overflow { chain, event_id },
                    SendTimeoutError::Closed(_) => PipelineError::Closed,
                })
        };

        match &result {
            Ok(()) => {
                counter!(METRIC_PUBLISHED, "chain" => chain.as_str()).increment(1);
                debug!(
                    event_id = %event_id,
                    event_sequence = sequence,
                    event_kind = kind.as_str(),
                    chain = chain.as_str(),
                    "Mutation event enqueued"
                );
            }
            Err(PipelineError::Overflow { .. }) => {
                counter!(METRIC_DROPPED, "chain" => chain.as_str()).increment(1);
            }
            Err(PipelineError::Closed) => {}
        }
        result.map(|()| sequence)
    }

    /// Stops accepting events. Chains drain what is buffered and then stop.
    /// Returns false when the pipeline was already closed.
    pub fn close(&self) -> bool {
        rw_write(&self.senders, SOURCE, "close").take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        rw_read(&self.senders, SOURCE, "is_closed").is_none()
    }

    /// Events buffered on `chain` and not yet received by its runner.
    pub fn queued(&self, chain: HandlerChain) -> usize {
        rw_read(&self.senders, SOURCE, "queued")
            .as_ref()
            .map(|senders| {
                let sender = senders.get(chain);
                sender.max_capacity() - sender.capacity()
            })
            .unwrap_or(0)
    }

    fn sender(&self, chain: HandlerChain) -> Result<mpsc::Sender<MutationEvent>, PipelineError> {
        rw_read(&self.senders, SOURCE, "sender")
            .as_ref()
            .map(|senders| senders.get(chain).clone())
            .ok_or(PipelineError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TargetRef;

    fn config(capacity: usize) -> PipelineConfig {
        PipelineConfig {
            channel_capacity: capacity,
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn routes_events_to_their_chain_in_order() {
        let (pipeline, mut receivers) = EventPipeline::open(&config(8));
        let target = TargetRef::post(42);

        pipeline.publish(MutationEvent::like(1, target)).await.unwrap();
        pipeline.publish(MutationEvent::view(1, target)).await.unwrap();
        pipeline
            .publish(MutationEvent::unlike(1, target))
            .await
            .unwrap();

        let first = receivers.likes.recv().await.unwrap();
        let second = receivers.likes.recv().await.unwrap();
        assert_eq!(first.kind, MutationKind::Like);
        assert_eq!(second.kind, MutationKind::Unlike);
        assert!(first.sequence < second.sequence);
        assert_eq!(receivers.views.recv().await.unwrap().kind, MutationKind::View);
    }

    #[tokio::test]
    async fn full_chain_rejects_without_blocking() {
        let (pipeline, _receivers) = EventPipeline::open(&config(2));
        let target = TargetRef::post(1);

        pipeline.publish(MutationEvent::view(1, target)).await.unwrap();
        pipeline.publish(MutationEvent::view(2, target)).await.unwrap();
        let err = pipeline
            .publish(MutationEvent::view(3, target))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Overflow {
                chain: HandlerChain::Views,
                ..
            }
        ));
        assert_eq!(pipeline.queued(HandlerChain::Views), 2);
        // Other chains are unaffected.
        pipeline.publish(MutationEvent::like(1, target)).await.unwrap();
    }

    #[tokio::test]
    async fn bounded_wait_gives_up_after_the_enqueue_wait() {
        let config = PipelineConfig {
            channel_capacity: 1,
            enqueue_wait_ms: 20,
            ..PipelineConfig::default()
        };
        let (pipeline, _receivers) = EventPipeline::open(&config);
        let target = TargetRef::post(1);

        pipeline.publish(MutationEvent::like(1, target)).await.unwrap();
        assert!(matches!(
            pipeline.publish(MutationEvent::like(2, target)).await,
            Err(PipelineError::Overflow { .. })
        ));
    }

    #[tokio::test]
    async fn closed_pipeline_rejects_and_drains() {
        let (pipeline, mut receivers) = EventPipeline::open(&config(4));
        pipeline
            .publish(MutationEvent::view(1, TargetRef::post(1)))
            .await
            .unwrap();

        assert!(pipeline.close());
        assert!(!pipeline.close());
        assert!(pipeline.is_closed());
        assert!(matches!(
            pipeline
                .publish(MutationEvent::view(1, TargetRef::post(1)))
                .await,
            Err(PipelineError::Closed)
        ));

        assert!(receivers.views.recv().await.is_some());
        assert!(receivers.views.recv().await.is_none());
    }
}
