//! Frame publisher: sampled frames in, keyed broker messages out.
//!
//! Deliveries are pipelined up to `publish.max_in_flight`. When the broker
//! stops accepting messages the publisher switches to an outage mode: frames
//! go to a bounded backlog, the broker is probed with capped backoff, and once
//! it answers the outstanding deliveries settle before the backlog is replayed
//! in capture order.

use crate::config::PublishConfig;
use crate::frame::Frame;
use crate::metrics::{DropReason, PipelineMetrics};
use crate::producer::{DeliveryResult, MessageSink, OutgoingMessage, ProducerError};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::future::BoxFuture;
use futures::stream::FuturesOrdered;
use futures::{FutureExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Message type header value carried by every frame message.
pub const FRAME_MESSAGE_TYPE: &str = "frame";

/// Where an accepted frame currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAck {
    /// Handed to the producer, delivery pending
    InFlight,
    /// Held in the outage backlog
    Buffered,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("Frame {frame_number} cannot be published: {reason}")]
    Serialization { frame_number: u64, reason: String },

    #[error("Broker unavailable and backlog full, frame {frame_number} dropped")]
    BrokerUnavailable { frame_number: u64 },
}

type Delivery = BoxFuture<'static, (u64, Result<DeliveryResult, ProducerError>)>;

struct Queued {
    frame_number: u64,
    message: OutgoingMessage,
}

struct Outage {
    backoff: ExponentialBackoff,
    probes: u32,
    next_probe: Instant,
}

/// Publishes one stream's frames to its channel.
pub struct FramePublisher {
    sink: Arc<dyn MessageSink>,
    stream_id: String,
    topic: String,
    config: PublishConfig,
    max_message_bytes: usize,
    metrics: Arc<PipelineMetrics>,
    in_flight: FuturesOrdered<Delivery>,
    backlog: VecDeque<Queued>,
    outage: Option<Outage>,
    last_accepted: Option<u64>,
}

impl FramePublisher {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        stream_id: impl Into<String>,
        topic: impl Into<String>,
        config: PublishConfig,
        max_message_bytes: usize,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            sink,
            stream_id: stream_id.into(),
            topic: topic.into(),
            config,
            max_message_bytes,
            metrics,
            in_flight: FuturesOrdered::new(),
            backlog: VecDeque::new(),
            outage: None,
            last_accepted: None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn in_outage(&self) -> bool {
        self.outage.is_some()
    }

    /// Publish one frame.
    ///
    /// Waits for the oldest delivery when `max_in_flight` deliveries are
    /// pending. Never fails the stream: an error means this frame was dropped.
    pub async fn publish(&mut self, frame: Frame) -> Result<PublishAck, PublishError> {
        let queued = self.encode(&frame).map_err(|reason| {
            self.metrics
                .frame_dropped(&self.stream_id, DropReason::Serialization);
            warn!(
                stream_id = %self.stream_id,
                frame_number = frame.frame_number,
                reason = %reason,
                "Dropping unpublishable frame"
            );
            PublishError::Serialization {
                frame_number: frame.frame_number,
                reason,
            }
        })?;
        self.last_accepted = Some(frame.frame_number);

        if self.outage.as_ref().is_some_and(|o| Instant::now() >= o.next_probe) {
            self.recover().await;
        }

        while self.outage.is_none() && self.in_flight.len() >= self.config.max_in_flight.max(1) {
            self.settle_oldest().await;
        }

        if self.outage.is_some() {
            return self.buffer(queued);
        }

        match self.dispatch(queued) {
            Ok(()) => Ok(PublishAck::InFlight),
            Err(queued) => self.buffer(queued),
        }
    }

    /// Consume frames until the capture side hangs up, then drain and flush.
    ///
    /// `cancel` only cuts short outage probing; frames already in `frames`
    /// are still published.
    pub async fn run(mut self, mut frames: mpsc::Receiver<Frame>, cancel: CancellationToken) {
        info!(stream_id = %self.stream_id, topic = %self.topic, "Starting frame publisher");

        loop {
            let next_probe = self
                .outage
                .as_ref()
                .map(|o| o.next_probe)
                .unwrap_or_else(Instant::now);

            tokio::select! {
                Some((frame_number, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_delivery(frame_number, result);
                }
                _ = tokio::time::sleep_until(next_probe), if self.outage.is_some() && !cancel.is_cancelled() => {
                    self.recover().await;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.publish(frame).await {
                            debug!(stream_id = %self.stream_id, error = %e, "Frame not published");
                        }
                    }
                    None => break,
                },
            }
        }

        self.shutdown(&cancel).await;
    }

    fn encode(&self, frame: &Frame) -> Result<Queued, String> {
        if let Some(last) = self.last_accepted {
            if frame.frame_number < last {
                return Err(format!(
                    "frame number went backwards (last accepted {})",
                    last
                ));
            }
        }

        let payload = frame.to_payload().map_err(|e| e.to_string())?;
        if payload.len() > self.max_message_bytes {
            return Err(format!(
                "payload of {} bytes exceeds the {} byte message limit",
                payload.len(),
                self.max_message_bytes
            ));
        }

        let message = OutgoingMessage::new(&self.topic, payload)
            .with_key(&self.stream_id)
            .with_message_type(FRAME_MESSAGE_TYPE);

        Ok(Queued {
            frame_number: frame.frame_number,
            message,
        })
    }

    /// Enqueue on the producer. On refusal the publisher enters outage mode
    /// and the message is handed back.
    fn dispatch(&mut self, queued: Queued) -> Result<(), Queued> {
        let frame_number = queued.frame_number;
        match self.sink.enqueue(queued.message) {
            Ok(delivery) => {
                self.in_flight
                    .push_back(async move { (frame_number, delivery.await) }.boxed());
                Ok(())
            }
            Err((e, message)) => {
                warn!(
                    stream_id = %self.stream_id,
                    frame_number,
                    error = %e,
                    "Producer refused frame"
                );
                self.enter_outage();
                Err(Queued {
                    frame_number,
                    message,
                })
            }
        }
    }

    fn buffer(&mut self, queued: Queued) -> Result<PublishAck, PublishError> {
        if self.backlog.len() >= self.config.outage_queue_capacity {
            self.metrics.frame_dropped(&self.stream_id, DropReason::Outage);
            warn!(
                stream_id = %self.stream_id,
                frame_number = queued.frame_number,
                backlog = self.backlog.len(),
                "Outage backlog full, dropping frame"
            );
            return Err(PublishError::BrokerUnavailable {
                frame_number: queued.frame_number,
            });
        }
        self.backlog.push_back(queued);
        Ok(PublishAck::Buffered)
    }

    async fn settle_oldest(&mut self) -> bool {
        match self.in_flight.next().await {
            Some((frame_number, result)) => self.on_delivery(frame_number, result),
            None => true,
        }
    }

    fn on_delivery(&mut self, frame_number: u64, result: Result<DeliveryResult, ProducerError>) -> bool {
        match result {
            Ok(delivery) => {
                self.metrics.frame_published(&self.stream_id);
                debug!(
                    stream_id = %self.stream_id,
                    frame_number,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Frame delivered"
                );
                true
            }
            Err(e) => {
                self.metrics.frame_dropped(&self.stream_id, DropReason::Delivery);
                warn!(
                    stream_id = %self.stream_id,
                    frame_number,
                    error = %e,
                    "Frame delivery failed"
                );
                self.enter_outage();
                false
            }
        }
    }

    fn enter_outage(&mut self) {
        if self.outage.is_some() {
            return;
        }
        warn!(stream_id = %self.stream_id, "Broker unavailable, buffering frames");

        let mut outage = Outage {
            backoff: self.config.reconnect.backoff(),
            probes: 0,
            next_probe: Instant::now(),
        };
        outage.next_probe += outage
            .backoff
            .next_backoff()
            .unwrap_or_else(|| self.config.reconnect.max_backoff());
        self.outage = Some(outage);
    }

    fn schedule_probe(&mut self) {
        let max_backoff = self.config.reconnect.max_backoff();
        if let Some(outage) = self.outage.as_mut() {
            let delay = outage.backoff.next_backoff().unwrap_or(max_backoff);
            outage.next_probe = Instant::now() + delay;
        }
    }

    /// Probe the broker; if it answers, settle in-flight deliveries and
    /// replay the backlog. Returns true once the outage is over.
    async fn recover(&mut self) -> bool {
        if let Err(e) = self.sink.probe().await {
            let probes = match self.outage.as_mut() {
                Some(outage) => {
                    outage.probes += 1;
                    outage.probes
                }
                None => return true,
            };
            warn!(
                stream_id = %self.stream_id,
                probes,
                backlog = self.backlog.len(),
                error = %e,
                "Broker still unreachable"
            );

            if self.config.reconnect.is_exhausted(probes) {
                error!(
                    stream_id = %self.stream_id,
                    dropped = self.backlog.len(),
                    "Broker unreachable for too long, discarding backlog"
                );
                self.discard_backlog();
                if let Some(outage) = self.outage.as_mut() {
                    outage.probes = 0;
                }
            }
            self.schedule_probe();
            return false;
        }

        let mut settled = true;
        while let Some((frame_number, result)) = self.in_flight.next().await {
            settled &= self.on_delivery(frame_number, result);
        }
        if !settled {
            self.schedule_probe();
            return false;
        }

        info!(
            stream_id = %self.stream_id,
            backlog = self.backlog.len(),
            "Broker reachable again, replaying backlog"
        );
        self.outage = None;

        while !self.backlog.is_empty() {
            if self.in_flight.len() >= self.config.max_in_flight.max(1) {
                if !self.settle_oldest().await {
                    return false;
                }
                continue;
            }
            let Some(queued) = self.backlog.pop_front() else {
                break;
            };
            if let Err(queued) = self.dispatch(queued) {
                self.backlog.push_front(queued);
                return false;
            }
        }
        true
    }

    fn discard_backlog(&mut self) {
        for _ in self.backlog.drain(..) {
            self.metrics.frame_dropped(&self.stream_id, DropReason::Outage);
        }
    }

    async fn shutdown(&mut self, cancel: &CancellationToken) {
        info!(
            stream_id = %self.stream_id,
            in_flight = self.in_flight.len(),
            backlog = self.backlog.len(),
            "Draining frame publisher"
        );

        let flush_timeout = self.config.flush_timeout();
        let drained = tokio::time::timeout(flush_timeout, async {
            if self.outage.is_some() && !self.backlog.is_empty() && !cancel.is_cancelled() {
                self.recover().await;
            }
            while let Some((frame_number, result)) = self.in_flight.next().await {
                self.on_delivery(frame_number, result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                stream_id = %self.stream_id,
                "Timed out waiting for in-flight deliveries"
            );
        }
        if !self.backlog.is_empty() {
            warn!(
                stream_id = %self.stream_id,
                dropped = self.backlog.len(),
                "Discarding undelivered backlog on shutdown"
            );
            self.discard_backlog();
        }

        let sink = self.sink.clone();
        match tokio::task::spawn_blocking(move || sink.flush(flush_timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(stream_id = %self.stream_id, error = %e, "Producer flush failed"),
            Err(e) => warn!(stream_id = %self.stream_id, error = %e, "Producer flush task failed"),
        }

        info!(stream_id = %self.stream_id, "Frame publisher stopped");
    }
}
