//! Configuration for the Vigil pipeline.
//!
//! A single [`PipelineConfig`] is built at startup from configuration files
//! and `VIGIL__*` environment variables, validated once, and passed by
//! reference to every component. Unknown keys are rejected everywhere so a
//! typo fails startup instead of silently falling back to a default.

use crate::retry::RetryConfig;
use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] ::config::ConfigError),
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Frame sampling policy applied by the stream reader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleRate {
    /// Keep one of every N decoded frames
    EveryNth(u32),
    /// Keep at most this many frames per second
    Fps(f32),
}

impl Default for SampleRate {
    fn default() -> Self {
        SampleRate::Fps(10.0)
    }
}

/// One configured video source and the channel its frames travel through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSource {
    /// Source URI (rtsp://, rtsps:// or any URI gstreamer can decode)
    pub uri: String,
    /// Kafka topic carrying this stream's frames
    pub channel: String,
    /// Bucket receiving this stream's annotated frames
    pub bucket: String,
    /// Per-stream override of `batch_max_size`
    #[serde(default)]
    pub batch_max_size: Option<usize>,
    /// Per-stream override of `batch_max_wait_seconds`
    #[serde(default)]
    pub batch_max_wait_seconds: Option<f64>,
    /// Further channels that receive a copy of every frame
    #[serde(default)]
    pub mirrors: Vec<MirrorChannel>,
}

/// An extra channel a stream is published to, consumed into its own bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorChannel {
    pub channel: String,
    pub bucket: String,
}

/// A channel and the bucket its worker writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRoute<'a> {
    pub channel: &'a str,
    pub bucket: &'a str,
}

impl StreamSource {
    /// Every channel this stream is published to, primary first.
    pub fn routes(&self) -> Vec<ChannelRoute<'_>> {
        std::iter::once(ChannelRoute {
            channel: &self.channel,
            bucket: &self.bucket,
        })
        .chain(self.mirrors.iter().map(|m| ChannelRoute {
            channel: &m.channel,
            bucket: &m.bucket,
        }))
        .collect()
    }

    /// The route consuming `channel`, if this stream publishes there.
    pub fn route(&self, channel: &str) -> Option<ChannelRoute<'_>> {
        self.routes().into_iter().find(|r| r.channel == channel)
    }
}

/// Effective batching bounds for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchPolicy {
    pub max_size: usize,
    pub max_wait: Duration,
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
    OAuthBearer,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::OAuthBearer => "OAUTHBEARER",
        }
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    /// Path to CA certificate file
    #[serde(default)]
    pub ca_location: Option<String>,
    /// Path to client certificate file
    #[serde(default)]
    pub certificate_location: Option<String>,
    /// Path to client private key file
    #[serde(default)]
    pub key_location: Option<String>,
    /// Private key password
    #[serde(default)]
    pub key_password: Option<String>,
    /// Enable certificate verification
    #[serde(default = "default_true")]
    pub enable_verification: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            ca_location: None,
            certificate_location: None,
            key_location: None,
            key_password: None,
            enable_verification: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Retry and reliability configuration for the Kafka client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReliabilityConfig {
    /// Number of retries librdkafka performs before reporting a failure
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Retry backoff in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Enable idempotent producer
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_acks() -> String {
    "all".to_string()
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            enable_idempotence: true,
            acks: default_acks(),
        }
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerConfig {
    /// Batch size in bytes
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Linger time in milliseconds
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Compression type: none, gzip, snappy, lz4, zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
    /// Maximum in-flight requests per connection
    #[serde(default = "default_max_in_flight_requests")]
    pub max_in_flight_requests: u32,
}

fn default_batch_size() -> usize {
    1_048_576
}

fn default_linger_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_max_in_flight_requests() -> u32 {
    5
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            linger_ms: default_linger_ms(),
            compression_type: default_compression(),
            max_in_flight_requests: default_max_in_flight_requests(),
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "vigil-pipeline".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_heartbeat_interval() -> u64 {
    3000
}

fn default_max_poll_interval() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

/// Topics used besides the per-stream channels
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TopicConfig {
    /// Receives a report for every batch that failed processing
    #[serde(default)]
    pub dead_letter: Option<String>,
}

/// Kafka connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Largest message accepted on either side, in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Security protocol
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// SSL configuration
    #[serde(default)]
    pub ssl: SslConfig,
    /// SASL configuration
    #[serde(default)]
    pub sasl: SaslConfig,
    /// Reliability settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    /// Producer settings
    #[serde(default)]
    pub producer: ProducerConfig,
    /// Consumer settings
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Topic configuration
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "vigil-pipeline".to_string()
}

fn default_max_message_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            max_message_bytes: default_max_message_bytes(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            reliability: ReliabilityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Build a base rdkafka ClientConfig from this configuration
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }
        if let Some(ref password) = self.ssl.key_password {
            config.set("ssl.key.password", password);
        }
        if !self.ssl.enable_verification {
            config.set("enable.ssl.certificate.verification", "false");
        }

        if matches!(
            self.security_protocol,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        ) {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("retries", self.reliability.retries.to_string());
        config.set("retry.backoff.ms", self.reliability.retry_backoff_ms.to_string());
        config.set("request.timeout.ms", self.reliability.request_timeout_ms.to_string());
        config.set("acks", &self.reliability.acks);

        if self.reliability.enable_idempotence {
            config.set("enable.idempotence", "true");
        }

        config.set("batch.size", self.producer.batch_size.to_string());
        config.set("linger.ms", self.producer.linger_ms.to_string());
        config.set("compression.type", &self.producer.compression_type);
        config.set(
            "max.in.flight.requests.per.connection",
            self.producer.max_in_flight_requests.to_string(),
        );
        config.set("message.max.bytes", self.max_message_bytes.to_string());

        config
    }

    /// Build a consumer ClientConfig. Offsets are only ever committed
    /// explicitly, after a batch is fully stored.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set("enable.auto.offset.store", "false");
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "heartbeat.interval.ms",
            self.consumer.heartbeat_interval_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );
        config.set("fetch.message.max.bytes", self.max_message_bytes.to_string());

        config
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.reliability.request_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.consumer.group_id".to_string(),
            ));
        }

        if self.max_message_bytes == 0 {
            return Err(ConfigError::invalid(
                "kafka.max_message_bytes",
                "must be greater than 0",
            ));
        }

        match self.security_protocol {
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl => {
                if self.sasl.username.is_none() {
                    return Err(ConfigError::MissingRequired(
                        "kafka.sasl.username (required for SASL)".to_string(),
                    ));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Stream capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    /// RTSP transport protocol (tcp, udp, or udp-mcast)
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Jitter buffer latency for RTSP sources in milliseconds
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u32,
    /// JPEG quality of sampled frames (1-100)
    #[serde(default = "default_capture_jpeg_quality")]
    pub jpeg_quality: u8,
    /// A source producing nothing for this long is treated as disconnected
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// Consecutive decode errors tolerated before the source is reopened
    #[serde(default = "default_max_consecutive_decode_errors")]
    pub max_consecutive_decode_errors: u32,
    /// Stop capturing instead of reconnecting when the source ends
    #[serde(default)]
    pub stop_on_end_of_stream: bool,
    /// Frames buffered between capture and publish
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,
    /// Reopen schedule after a connection failure
    #[serde(default = "default_capture_reconnect")]
    pub reconnect: RetryConfig,
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_latency_ms() -> u32 {
    200
}

fn default_capture_jpeg_quality() -> u8 {
    85
}

fn default_stall_timeout_secs() -> u64 {
    10
}

fn default_max_consecutive_decode_errors() -> u32 {
    5
}

fn default_frame_queue_capacity() -> usize {
    16
}

fn default_capture_reconnect() -> RetryConfig {
    RetryConfig::new(0, 1000, 30000)
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            latency_ms: default_latency_ms(),
            jpeg_quality: default_capture_jpeg_quality(),
            stall_timeout_secs: default_stall_timeout_secs(),
            max_consecutive_decode_errors: default_max_consecutive_decode_errors(),
            stop_on_end_of_stream: false,
            frame_queue_capacity: default_frame_queue_capacity(),
            reconnect: default_capture_reconnect(),
        }
    }
}

impl CaptureConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Frame publishing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    /// Deliveries awaiting broker acknowledgement before publish blocks
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Frames held in memory while the broker is unreachable
    #[serde(default = "default_outage_queue_capacity")]
    pub outage_queue_capacity: usize,
    /// Upper bound on a single delivery in seconds
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
    /// Time allowed for the final flush on shutdown in seconds
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
    /// Broker probe schedule during an outage
    #[serde(default = "default_publish_reconnect")]
    pub reconnect: RetryConfig,
}

fn default_max_in_flight() -> usize {
    32
}

fn default_outage_queue_capacity() -> usize {
    256
}

fn default_delivery_timeout_secs() -> u64 {
    30
}

fn default_flush_timeout_secs() -> u64 {
    10
}

fn default_publish_reconnect() -> RetryConfig {
    RetryConfig::new(0, 500, 10000)
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            outage_queue_capacity: default_outage_queue_capacity(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
            flush_timeout_secs: default_flush_timeout_secs(),
            reconnect: default_publish_reconnect(),
        }
    }
}

impl PublishConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}

/// Inference endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InferenceConfig {
    /// Base URL of the model-serving endpoint
    #[serde(default = "default_inference_endpoint")]
    pub endpoint: String,
    /// Upper bound on a single request in seconds
    #[serde(default = "default_inference_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_inference_retry")]
    pub retry: RetryConfig,
}

fn default_inference_endpoint() -> String {
    "http://localhost:8000".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_inference_retry() -> RetryConfig {
    RetryConfig::new(3, 1000, 10000)
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_inference_endpoint(),
            request_timeout_secs: default_inference_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry: default_inference_retry(),
        }
    }
}

impl InferenceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Object storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    S3,
    /// In-process store, for local runs
    Memory,
}

/// Object storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO, LocalStack)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Use path-style addressing
    #[serde(default)]
    pub force_path_style: bool,
    /// First component of every object key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// JPEG quality of annotated frames (1-100)
    #[serde(default = "default_storage_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Store frames without any detection
    #[serde(default = "default_true")]
    pub store_empty_frames: bool,
    /// Concurrent uploads per batch
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Upper bound on a single upload in seconds
    #[serde(default = "default_storage_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_storage_retry")]
    pub retry: RetryConfig,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "annotated".to_string()
}

fn default_storage_jpeg_quality() -> u8 {
    90
}

fn default_upload_concurrency() -> usize {
    8
}

fn default_storage_timeout_secs() -> u64 {
    30
}

fn default_storage_retry() -> RetryConfig {
    RetryConfig::new(5, 200, 5000)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            key_prefix: default_key_prefix(),
            jpeg_quality: default_storage_jpeg_quality(),
            store_empty_frames: true,
            upload_concurrency: default_upload_concurrency(),
            request_timeout_secs: default_storage_timeout_secs(),
            retry: default_storage_retry(),
        }
    }
}

impl StorageConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Batch failure handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Pause schedule after consecutive failed batches on one channel
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff: RetryConfig,
}

fn default_failure_backoff() -> RetryConfig {
    RetryConfig::new(0, 1000, 30000)
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            failure_backoff: default_failure_backoff(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Health and metrics endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Port for the health/metrics HTTP server
    #[serde(default = "default_health_port")]
    pub port: u16,
    /// Interval between dependency probes in seconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Liveness fails when the runtime heartbeat is older than this
    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: u64,
    /// Readiness fails when a dependency was last reachable longer ago than this
    #[serde(default = "default_readiness_window")]
    pub readiness_window_secs: u64,
    /// Exit when dependencies are not reachable within this time (0 = skip)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

fn default_health_port() -> u16 {
    8080
}

fn default_probe_interval() -> u64 {
    10
}

fn default_liveness_window() -> u64 {
    30
}

fn default_readiness_window() -> u64 {
    60
}

fn default_startup_timeout() -> u64 {
    60
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: default_health_port(),
            probe_interval_secs: default_probe_interval(),
            liveness_window_secs: default_liveness_window(),
            readiness_window_secs: default_readiness_window(),
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn readiness_window(&self) -> Duration {
        Duration::from_secs(self.readiness_window_secs)
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        (self.startup_timeout_secs > 0).then(|| Duration::from_secs(self.startup_timeout_secs))
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Time allowed for each drain step in seconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_drain_timeout() -> u64 {
    30
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Frames per batch before it is dispatched
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    /// Seconds after the first frame before a partial batch is dispatched
    #[serde(default = "default_batch_max_wait_seconds")]
    pub batch_max_wait_seconds: f64,
    #[serde(default)]
    pub sample_rate: SampleRate,
    /// Detections below this confidence are discarded
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Stream id to source mapping
    #[serde(default)]
    pub stream_sources: BTreeMap<String, StreamSource>,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

fn default_batch_max_size() -> usize {
    25
}

fn default_batch_max_wait_seconds() -> f64 {
    5.0
}

fn default_confidence_threshold() -> f32 {
    0.5
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_max_size: default_batch_max_size(),
            batch_max_wait_seconds: default_batch_max_wait_seconds(),
            sample_rate: SampleRate::default(),
            confidence_threshold: default_confidence_threshold(),
            stream_sources: BTreeMap::new(),
            kafka: KafkaConfig::default(),
            capture: CaptureConfig::default(),
            publish: PublishConfig::default(),
            inference: InferenceConfig::default(),
            storage: StorageConfig::default(),
            batch: BatchConfig::default(),
            logging: LoggingConfig::default(),
            health: HealthConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `config/default` (any format the config crate understands)
    /// 2. `config/{RUN_MODE}`
    /// 3. Environment variables such as `VIGIL__KAFKA__BOOTSTRAP_SERVERS`
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = ::config::Config::builder()
            .add_source(::config::File::with_name("config/default").required(false))
            .add_source(::config::File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                ::config::Environment::with_prefix("VIGIL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: PipelineConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document, then validate it.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config = ::config::Config::builder()
            .add_source(::config::File::from_str(source, ::config::FileFormat::Toml))
            .build()?;

        let config: PipelineConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Batching bounds for one stream, with per-stream overrides applied.
    pub fn batch_policy(&self, stream_id: &str) -> BatchPolicy {
        let source = self.stream_sources.get(stream_id);
        let max_size = source
            .and_then(|s| s.batch_max_size)
            .unwrap_or(self.batch_max_size);
        let max_wait = source
            .and_then(|s| s.batch_max_wait_seconds)
            .unwrap_or(self.batch_max_wait_seconds);

        BatchPolicy {
            max_size,
            max_wait: Duration::from_secs_f64(max_wait),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_batch_bounds(
            "batch_max_size",
            self.batch_max_size,
            "batch_max_wait_seconds",
            self.batch_max_wait_seconds,
        )?;

        match self.sample_rate {
            SampleRate::EveryNth(0) => {
                return Err(ConfigError::invalid(
                    "sample_rate.every_nth",
                    "must be at least 1",
                ));
            }
            SampleRate::Fps(fps) if !(fps.is_finite() && fps > 0.0) => {
                return Err(ConfigError::invalid(
                    "sample_rate.fps",
                    "must be greater than 0",
                ));
            }
            _ => {}
        }

        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::invalid(
                "confidence_threshold",
                "must be within [0, 1]",
            ));
        }

        if self.stream_sources.is_empty() {
            return Err(ConfigError::MissingRequired("stream_sources".to_string()));
        }

        let mut channels = HashSet::new();
        for (id, source) in &self.stream_sources {
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(ConfigError::invalid(
                    format!("stream_sources.{}", id),
                    "stream ids may only contain letters, digits, '-' and '_'",
                ));
            }
            if source.uri.is_empty() {
                return Err(ConfigError::MissingRequired(format!(
                    "stream_sources.{}.uri",
                    id
                )));
            }
            let mut buckets = HashSet::new();
            for route in source.routes() {
                if route.channel.is_empty() {
                    return Err(ConfigError::MissingRequired(format!(
                        "stream_sources.{}.channel",
                        id
                    )));
                }
                if route.bucket.is_empty() {
                    return Err(ConfigError::MissingRequired(format!(
                        "stream_sources.{}.bucket",
                        id
                    )));
                }
                if !channels.insert(route.channel) {
                    return Err(ConfigError::invalid(
                        format!("stream_sources.{}.channel", id),
                        format!("channel '{}' is already in use", route.channel),
                    ));
                }
                if !buckets.insert(route.bucket) {
                    return Err(ConfigError::invalid(
                        format!("stream_sources.{}.bucket", id),
                        format!("bucket '{}' is used by two channels of this stream", route.bucket),
                    ));
                }
            }
            validate_batch_bounds(
                &format!("stream_sources.{}.batch_max_size", id),
                source.batch_max_size.unwrap_or(self.batch_max_size),
                &format!("stream_sources.{}.batch_max_wait_seconds", id),
                source
                    .batch_max_wait_seconds
                    .unwrap_or(self.batch_max_wait_seconds),
            )?;
        }

        self.kafka.validate()?;

        if self.kafka.topics.dead_letter.as_deref() == Some("") {
            return Err(ConfigError::invalid(
                "kafka.topics.dead_letter",
                "must not be empty when set",
            ));
        }

        for (key, quality) in [
            ("capture.jpeg_quality", self.capture.jpeg_quality),
            ("storage.jpeg_quality", self.storage.jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::invalid(key, "must be within [1, 100]"));
            }
        }

        if self.capture.frame_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "capture.frame_queue_capacity",
                "must be greater than 0",
            ));
        }

        if self.capture.reconnect.max_attempts != 0 {
            return Err(ConfigError::invalid(
                "capture.reconnect.max_attempts",
                "must be 0; stream sources are retried indefinitely",
            ));
        }

        if self.capture.stall_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "capture.stall_timeout_secs",
                "must be greater than 0",
            ));
        }

        if self.publish.max_in_flight == 0 {
            return Err(ConfigError::invalid(
                "publish.max_in_flight",
                "must be greater than 0",
            ));
        }

        if self.inference.endpoint.is_empty() {
            return Err(ConfigError::MissingRequired("inference.endpoint".to_string()));
        }
        if !self.inference.endpoint.starts_with("http://")
            && !self.inference.endpoint.starts_with("https://")
        {
            return Err(ConfigError::invalid(
                "inference.endpoint",
                "URL must start with http:// or https://",
            ));
        }

        if self.storage.upload_concurrency == 0 {
            return Err(ConfigError::invalid(
                "storage.upload_concurrency",
                "must be greater than 0",
            ));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigError::invalid(
                "logging.format",
                "must be 'json' or 'pretty'",
            ));
        }

        Ok(())
    }
}

/// Upper bound on any batch wait: one day.
const MAX_BATCH_WAIT_SECONDS: f64 = 86_400.0;

fn validate_batch_bounds(
    size_key: &str,
    max_size: usize,
    wait_key: &str,
    max_wait_seconds: f64,
) -> Result<(), ConfigError> {
    if max_size == 0 {
        return Err(ConfigError::invalid(size_key, "must be greater than 0"));
    }
    if !(max_wait_seconds.is_finite() && max_wait_seconds > 0.0) {
        return Err(ConfigError::invalid(wait_key, "must be greater than 0"));
    }
    if max_wait_seconds > MAX_BATCH_WAIT_SECONDS {
        return Err(ConfigError::invalid(
            wait_key,
            format!("must be at most {} seconds", MAX_BATCH_WAIT_SECONDS),
        ));
    }
    Ok(())
}
