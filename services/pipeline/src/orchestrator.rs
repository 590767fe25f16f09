//! Wires capture, publishing and channel workers together and shuts them
//! down in order.
//!
//! Components are injected through the public seams ([`FrameSource`],
//! [`MessageSink`], [`MessageSource`], [`Detector`], [`ObjectStore`]) so the
//! same orchestration runs against Kafka/S3 in production and in-process
//! fakes in tests. [`run`] builds the production components from a
//! [`PipelineConfig`].

use crate::annotator::AnnotateOptions;
use crate::batch_assembler::BatchAssembler;
use crate::channel_worker::ChannelWorker;
use crate::config::{PipelineConfig, StorageBackend};
use crate::consumer::{ChannelConsumer, MessageSource};
use crate::frame::Frame;
use crate::frame_publisher::FramePublisher;
use crate::health::{self, AppState, DependencyProbe, HealthState};
use crate::inference::{Detector, HttpDetector, InferenceClient};
use crate::metrics::PipelineMetrics;
use crate::producer::{KafkaSink, MessageSink};
use crate::storage::{MemoryStore, ObjectStore, ResultPublisher, S3Store};
use crate::stream_reader::{run_capture, FrameSource, StreamError, StreamReader};
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Which halves of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Capture and publish frames
    Producer,
    /// Consume, infer, annotate and store
    Consumer,
    Both,
}

impl Mode {
    pub fn produces(&self) -> bool {
        matches!(self, Mode::Producer | Mode::Both)
    }

    pub fn consumes(&self) -> bool {
        matches!(self, Mode::Consumer | Mode::Both)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "producer" => Ok(Mode::Producer),
            "consumer" => Ok(Mode::Consumer),
            "both" => Ok(Mode::Both),
            other => Err(format!(
                "unknown mode '{}', expected producer, consumer or both",
                other
            )),
        }
    }
}

/// Running pipeline tasks, grouped by shutdown stage.
pub struct Orchestrator {
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthState>,
    capture_cancel: CancellationToken,
    consume_cancel: CancellationToken,
    service_cancel: CancellationToken,
    captures: Vec<(String, JoinHandle<Result<(), StreamError>>)>,
    publishers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    services: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, metrics: Arc<PipelineMetrics>, health: HealthState) -> Self {
        Self {
            config,
            metrics,
            health: Arc::new(health),
            capture_cancel: CancellationToken::new(),
            consume_cancel: CancellationToken::new(),
            service_cancel: CancellationToken::new(),
            captures: Vec::new(),
            publishers: Vec::new(),
            workers: Vec::new(),
            services: Vec::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    /// Start capture for one configured stream and a publisher for each of
    /// its channels.
    pub fn spawn_stream(
        &mut self,
        stream_id: &str,
        source: Arc<dyn FrameSource>,
        sink: Arc<dyn MessageSink>,
    ) -> Result<()> {
        let stream = self
            .config
            .stream_sources
            .get(stream_id)
            .with_context(|| format!("No stream source configured for {}", stream_id))?;
        let capacity = self.config.capture.frame_queue_capacity.max(1);

        let reader = StreamReader::new(
            stream_id,
            &stream.uri,
            source,
            self.config.sample_rate,
            &self.config.capture,
        );
        let (tx, rx) = mpsc::channel(capacity);

        self.captures.push((
            stream_id.to_string(),
            tokio::spawn(run_capture(
                reader,
                tx,
                self.config.capture.clone(),
                self.metrics.clone(),
                self.capture_cancel.clone(),
            )),
        ));

        let channels: Vec<String> = stream
            .routes()
            .iter()
            .map(|route| route.channel.to_string())
            .collect();
        let mut outputs = Vec::with_capacity(channels.len());
        for channel in &channels {
            let publisher = FramePublisher::new(
                sink.clone(),
                stream_id,
                channel,
                self.config.publish.clone(),
                self.config.kafka.max_message_bytes,
                self.metrics.clone(),
            );
            let (channel_tx, channel_rx) = mpsc::channel(capacity);
            outputs.push(channel_tx);
            // Once capture is cancelled a publisher stops probing a down
            // broker and only drains what is already in flight.
            self.publishers
                .push(tokio::spawn(publisher.run(channel_rx, self.capture_cancel.clone())));
        }
        self.publishers.push(tokio::spawn(fan_out(rx, outputs)));

        info!(stream_id = %stream_id, channels = ?channels, "Stream started");
        Ok(())
    }

    /// Start the channel worker for a stream's primary channel.
    pub fn spawn_channel(
        &mut self,
        stream_id: &str,
        source: Box<dyn MessageSource>,
        detector: Arc<dyn Detector>,
        store: Arc<dyn ObjectStore>,
        dead_letter: Option<Arc<dyn MessageSink>>,
    ) -> Result<()> {
        let channel = self
            .config
            .stream_sources
            .get(stream_id)
            .map(|stream| stream.channel.clone())
            .with_context(|| format!("No stream source configured for {}", stream_id))?;
        self.spawn_route(stream_id, &channel, source, detector, store, dead_letter)
    }

    /// Start the channel worker consuming `channel`, one of the stream's
    /// primary or mirror channels.
    pub fn spawn_route(
        &mut self,
        stream_id: &str,
        channel: &str,
        source: Box<dyn MessageSource>,
        detector: Arc<dyn Detector>,
        store: Arc<dyn ObjectStore>,
        dead_letter: Option<Arc<dyn MessageSink>>,
    ) -> Result<()> {
        let stream = self
            .config
            .stream_sources
            .get(stream_id)
            .with_context(|| format!("No stream source configured for {}", stream_id))?;
        let route = stream
            .route(channel)
            .with_context(|| format!("Stream {} is not published to {}", stream_id, channel))?;

        let assembler = BatchAssembler::new(
            route.channel,
            stream_id,
            self.config.batch_policy(stream_id),
        );
        let inference = InferenceClient::new(
            detector,
            self.config.inference.retry.clone(),
            self.config.confidence_threshold,
            self.metrics.clone(),
        )
        .with_shutdown(self.consume_cancel.clone());
        let results = ResultPublisher::new(
            store,
            route.bucket,
            &self.config.storage,
            self.metrics.clone(),
        )
        .with_shutdown(self.consume_cancel.clone());

        let mut worker = ChannelWorker::new(
            source,
            assembler,
            inference,
            results,
            self.metrics.clone(),
            self.health.clone(),
        )
        .with_annotate_options(AnnotateOptions::from(&self.config.storage))
        .with_store_empty_frames(self.config.storage.store_empty_frames)
        .with_failure_backoff(&self.config.batch.failure_backoff);

        if let (Some(sink), Some(topic)) = (dead_letter, self.config.kafka.topics.dead_letter.as_ref()) {
            worker = worker.with_dead_letter(sink, topic);
        }

        info!(
            stream_id = %stream_id,
            channel = %route.channel,
            bucket = %route.bucket,
            "Channel worker started"
        );
        self.workers
            .push(tokio::spawn(worker.run(self.consume_cancel.clone())));
        Ok(())
    }

    /// Keep the liveness heartbeat ticking.
    pub fn spawn_heartbeat(&mut self) {
        self.services.push(tokio::spawn(health::run_heartbeat(
            self.health.clone(),
            self.service_cancel.clone(),
        )));
    }

    /// Probe inference and storage in the background.
    pub fn spawn_probes(&mut self, probe: DependencyProbe) {
        self.services.push(tokio::spawn(probe.run(
            self.health.clone(),
            self.config.health.probe_interval(),
            self.service_cancel.clone(),
        )));
    }

    /// Serve `/health`, `/ready` and `/metrics` on `health.port`.
    pub async fn spawn_health_server(&mut self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.health.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind health server to {}", addr))?;

        let state = AppState {
            health: self.health.clone(),
            metrics: self.metrics.clone(),
        };
        let cancel = self.service_cancel.clone();
        self.services.push(tokio::spawn(async move {
            if let Err(e) = health::serve(listener, state, cancel).await {
                error!(error = %e, "Health server error");
            }
        }));
        Ok(())
    }

    /// Stop everything, in order: capture, publishers, channel workers,
    /// then the health services. Each group gets `shutdown.drain_timeout_secs`;
    /// channel workers still busy after that are waited for, the rest are
    /// aborted.
    pub async fn shutdown(self) {
        let drain_timeout = self.config.shutdown.drain_timeout();
        info!(
            drain_timeout_secs = drain_timeout.as_secs(),
            "Shutting down pipeline"
        );

        self.capture_cancel.cancel();
        let (names, captures): (Vec<String>, Vec<_>) = self.captures.into_iter().unzip();
        if let Some(outcomes) = wait_group("capture", captures, drain_timeout, Straggler::Abort).await {
            for (stream_id, outcome) in names.iter().zip(outcomes) {
                if let Err(e) = outcome {
                    warn!(stream_id = %stream_id, error = %e, "Capture ended with an error");
                }
            }
        }

        wait_group("publish", self.publishers, drain_timeout, Straggler::Abort).await;

        // Workers stop retrying once cancelled, but a call already running
        // (an upload, an inference request) is bounded by its own timeout and
        // is never cut off.
        self.consume_cancel.cancel();
        wait_group("consume", self.workers, drain_timeout, Straggler::Await).await;

        self.service_cancel.cancel();
        wait_group("health", self.services, drain_timeout, Straggler::Abort).await;

        info!("Pipeline stopped");
    }
}

/// Copy every captured frame to each channel's publisher, in capture order.
/// The slowest publisher sets the pace for all of them. Ends when capture
/// stops or every publisher is gone.
async fn fan_out(mut frames: mpsc::Receiver<Frame>, mut outputs: Vec<mpsc::Sender<Frame>>) {
    while let Some(frame) = frames.recv().await {
        let sent = join_all(outputs.iter().map(|tx| tx.send(frame.clone()))).await;
        let mut sent = sent.into_iter();
        outputs.retain(|_| sent.next().map_or(false, |r| r.is_ok()));
        if outputs.is_empty() {
            break;
        }
    }
}

/// What to do with tasks still running when a group's drain times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Straggler {
    Abort,
    Await,
}

/// Wait for a group of tasks. After `timeout` the stragglers are aborted or,
/// for [`Straggler::Await`], waited for to completion.
async fn wait_group<T>(
    group: &'static str,
    handles: Vec<JoinHandle<T>>,
    timeout: Duration,
    stragglers: Straggler,
) -> Option<Vec<T>> {
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let mut joined = Box::pin(join_all(handles));

    let results = match tokio::time::timeout(timeout, &mut joined).await {
        Ok(results) => results,
        Err(_) if stragglers == Straggler::Abort => {
            warn!(group, timeout_secs = timeout.as_secs(), "Drain timed out, aborting tasks");
            for abort in aborts {
                abort.abort();
            }
            return None;
        }
        Err(_) => {
            warn!(
                group,
                timeout_secs = timeout.as_secs(),
                "Drain timed out, waiting for in-flight calls to finish"
            );
            joined.await
        }
    };

    let mut outputs = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(output) => outputs.push(output),
            Err(e) => error!(group, error = %e, "Task failed during shutdown"),
        }
    }
    Some(outputs)
}

#[cfg(feature = "gstreamer")]
fn frame_source(config: &PipelineConfig) -> Result<Arc<dyn FrameSource>> {
    let source = crate::gst_source::GstFrameSource::new(&config.capture.transport, config.capture.latency_ms)
        .context("Failed to initialise gstreamer")?;
    Ok(Arc::new(source))
}

#[cfg(not(feature = "gstreamer"))]
fn frame_source(_config: &PipelineConfig) -> Result<Arc<dyn FrameSource>> {
    bail!("built without the gstreamer feature, producer mode is unavailable")
}

async fn object_store(config: &PipelineConfig) -> Arc<dyn ObjectStore> {
    match config.storage.backend {
        StorageBackend::S3 => Arc::new(S3Store::new(&config.storage).await),
        StorageBackend::Memory => {
            warn!("Using the in-memory storage backend; artifacts are not persisted");
            Arc::new(MemoryStore::new())
        }
    }
}

/// Build the production pipeline from `config`, run it until `shutdown`
/// resolves, then drain it.
pub async fn run<F>(config: PipelineConfig, mode: Mode, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown.await;
            stop.cancel();
        });
    }

    let metrics = Arc::new(PipelineMetrics::new());
    let health = if mode.consumes() {
        HealthState::new(&config.health)
    } else {
        HealthState::new(&config.health).without_dependencies()
    };
    let mut orchestrator = Orchestrator::new(config.clone(), metrics, health);
    orchestrator.spawn_heartbeat();
    orchestrator.spawn_health_server().await?;

    if mode.consumes() {
        let detector: Arc<dyn Detector> = Arc::new(
            HttpDetector::new(&config.inference).context("Failed to create inference client")?,
        );
        let store = object_store(&config).await;
        let buckets: Vec<String> = config
            .stream_sources
            .values()
            .flat_map(|s| s.routes().into_iter().map(|r| r.bucket.to_string()))
            .collect();
        let probe = DependencyProbe::new(detector.clone(), store.clone(), buckets);

        if let Some(timeout) = config.health.startup_timeout() {
            info!(timeout_secs = timeout.as_secs(), "Waiting for inference and storage");
            let ready = probe
                .wait_ready(
                    orchestrator.health(),
                    config.health.probe_interval(),
                    timeout,
                    &stop,
                )
                .await;
            if stop.is_cancelled() {
                orchestrator.shutdown().await;
                return Ok(());
            }
            if !ready {
                orchestrator.shutdown().await;
                bail!(
                    "inference endpoint or storage not reachable within {}s",
                    timeout.as_secs()
                );
            }
        }
        orchestrator.spawn_probes(probe);

        let dead_letter = match &config.kafka.topics.dead_letter {
            Some(_) => {
                let sink = KafkaSink::new(&config.kafka, config.publish.delivery_timeout())
                    .context("Failed to create dead-letter producer")?;
                Some(Arc::new(sink) as Arc<dyn MessageSink>)
            }
            None => None,
        };

        for (stream_id, stream) in &config.stream_sources {
            for route in stream.routes() {
                let consumer = ChannelConsumer::new(&config.kafka, route.channel)
                    .with_context(|| format!("Failed to create consumer for {}", route.channel))?;
                orchestrator.spawn_route(
                    stream_id,
                    route.channel,
                    Box::new(consumer),
                    detector.clone(),
                    store.clone(),
                    dead_letter.clone(),
                )?;
            }
        }
    }

    if mode.produces() {
        let source = frame_source(&config)?;
        let sink: Arc<dyn MessageSink> = Arc::new(
            KafkaSink::new(&config.kafka, config.publish.delivery_timeout())
                .context("Failed to create frame producer")?,
        );
        for stream_id in config.stream_sources.keys() {
            orchestrator.spawn_stream(stream_id, source.clone(), sink.clone())?;
        }
    }

    info!(
        mode = ?mode,
        streams = config.stream_sources.len(),
        "Pipeline running"
    );
    stop.cancelled().await;

    orchestrator.shutdown().await;
    Ok(())
}
