//! Handler chain runner.
//!
//! Drains one chain's channel in batches of at most `drain_limit` events and
//! feeds them to its handler in arrival order. The last event of each batch is
//! flagged as the batch boundary. Idle ticks give the handler a boundary when
//! no events arrive, so interval flushes still happen on a quiet chain.

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::domain::events::MutationEvent;

use super::config::PipelineConfig;
use super::handler::EventHandler;
use super::pipeline::HandlerChain;

const METRIC_BATCH_SIZE: &str = "tally_chain_batch_size";
const METRIC_BATCH_MS: &str = "tally_chain_batch_ms";
const METRIC_HANDLER_FAILURE: &str = "tally_handler_failure_total";

pub struct ChainRunner<H> {
    chain: HandlerChain,
    receiver: mpsc::Receiver<MutationEvent>,
    handler: H,
    drain_limit: usize,
    idle_interval: Duration,
}

impl<H: EventHandler> ChainRunner<H> {
    pub fn new(
        receiver: mpsc::Receiver<MutationEvent>,
        handler: H,
        config: &PipelineConfig,
        idle_interval: Duration,
    ) -> Self {
        Self {
            chain: handler.chain(),
            receiver,
            handler,
            drain_limit: config.drain_limit(),
            idle_interval: idle_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Runs until the pipeline closes and the channel is drained, then lets
    /// the handler perform its final flush.
    pub async fn run(mut self) -> H {
        let start = tokio::time::Instant::now() + self.idle_interval;
        let mut idle = interval_at(start, self.idle_interval);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(chain = self.chain.as_str(), "Handler chain started");
        loop {
            tokio::select! {
                biased;
                received = self.receiver.recv() => match received {
                    Some(first) => {
                        let batch = self.collect_batch(first);
                        self.process(batch).await;
                    }
                    None => break,
                },
                _ = idle.tick() => self.handler.on_idle().await,
            }
        }

        self.handler.on_shutdown().await;
        info!(chain = self.chain.as_str(), "Handler chain stopped");
        self.handler
    }

    /// Processes whatever is buffered right now as one batch. Returns the
    /// number of events handled.
    pub async fn drain_once(&mut self) -> usize {
        match self.receiver.try_recv() {
            Ok(first) => {
                let batch = self.collect_batch(first);
                let size = batch.len();
                self.process(batch).await;
                size
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => 0,
        }
    }

    /// Hands the chain over to shutdown without a running loop.
    pub async fn finish(mut self) -> H {
        while self.drain_once().await > 0 {}
        self.handler.on_shutdown().await;
        self.handler
    }

    fn collect_batch(&mut self, first: MutationEvent) -> Vec<MutationEvent> {
        let mut batch = Vec::with_capacity(self.drain_limit.min(64));
        batch.push(first);
        while batch.len() < self.drain_limit {
            match self.receiver.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }

    async fn process(&mut self, batch: Vec<MutationEvent>) {
        let started = Instant::now();
        let size = batch.len();
        let chain = self.chain.as_str();

        for (index, event) in batch.into_iter().enumerate() {
            let is_last = index + 1 == size;
            let event_id = event.id;
            let target = event.target;
            let sequence = event.sequence;
            if let Err(err) = self.handler.on_event(event, is_last).await {
                counter!(METRIC_HANDLER_FAILURE, "chain" => chain, "reason" => err.reason())
                    .increment(1);
                warn!(
                    chain,
                    event_id = %event_id,
                    event_sequence = sequence,
                    target = %target,
                    error = %err,
                    "Event skipped; target scheduled for repair"
                );
            }
        }

        histogram!(METRIC_BATCH_SIZE, "chain" => chain).record(size as f64);
        histogram!(METRIC_BATCH_MS, "chain" => chain)
            .record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(chain, batch_size = size, "Handler batch processed");
    }
}
