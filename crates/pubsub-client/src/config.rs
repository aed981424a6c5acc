// Publisher/subscriber configuration: defaults, env overrides, YAML overrides and validation.
use crate::error::ConfigError;
use anyhow::{Context, Result};
use pubsub_wire::{MAX_ACK_DEADLINE, MAX_PUBLISH_ELEMENT_COUNT, MAX_PUBLISH_REQUEST_BYTES, MIN_ACK_DEADLINE};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub(crate) const DEFAULT_ELEMENT_COUNT_THRESHOLD: usize = 100;
pub(crate) const DEFAULT_REQUEST_BYTE_THRESHOLD: usize = 1000;
pub(crate) const DEFAULT_DELAY_THRESHOLD: Duration = Duration::from_millis(1);
pub(crate) const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_RETRY_DELAY_MULTIPLIER: f64 = 4.0;
pub(crate) const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);

pub(crate) const DEFAULT_SUBSCRIBER_MAX_OUTSTANDING_MESSAGES: u64 = 1000;
pub(crate) const DEFAULT_SUBSCRIBER_MAX_OUTSTANDING_BYTES: u64 = 100 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_ACK_EXTENSION_PERIOD: Duration = Duration::from_secs(60 * 60);
pub(crate) const DEFAULT_STREAM_ACK_DEADLINE: Duration = Duration::from_secs(60);
/// Min per-extension used under exactly-once delivery when none is configured.
pub(crate) const DEFAULT_MIN_EXTENSION_EXACTLY_ONCE: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_ACK_EXPIRATION_PADDING: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_ACK_RETRY_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_PARALLEL_PULL_COUNT: usize = 1;
pub(crate) const CALLBACKS_PER_STREAM: usize = 5;

/// Environment variable naming an optional YAML override file.
pub const CONFIG_PATH_ENV: &str = "PUBSUB_CLIENT_CONFIG";

/// What `acquire` does when a limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlBehavior {
    /// Wait for capacity.
    Block,
    /// Fail the admission immediately.
    Reject,
    /// Admit everything; limits are informational only.
    Ignore,
}

impl FlowControlBehavior {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "block" => Some(Self::Block),
            "reject" | "throw_exception" => Some(Self::Reject),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

/// Outstanding element/byte limits for an admission gate.
///
/// ```
/// use pubsub_client::{FlowControlBehavior, FlowControlConfig};
///
/// let config = FlowControlConfig::bounded(10, 1024, FlowControlBehavior::Block);
/// assert!(config.validate().is_ok());
/// assert!(FlowControlConfig::unbounded().validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlConfig {
    pub max_outstanding_elements: Option<u64>,
    pub max_outstanding_bytes: Option<u64>,
    pub behavior: FlowControlBehavior,
}

impl FlowControlConfig {
    pub fn unbounded() -> Self {
        Self {
            max_outstanding_elements: None,
            max_outstanding_bytes: None,
            behavior: FlowControlBehavior::Ignore,
        }
    }

    pub fn bounded(elements: u64, bytes: u64, behavior: FlowControlBehavior) -> Self {
        Self {
            max_outstanding_elements: Some(elements),
            max_outstanding_bytes: Some(bytes),
            behavior,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_outstanding_elements == Some(0) {
            return Err(ConfigError::invalid(
                "max_outstanding_elements",
                "must be greater than zero when set",
            ));
        }
        if self.max_outstanding_bytes == Some(0) {
            return Err(ConfigError::invalid(
                "max_outstanding_bytes",
                "must be greater than zero when set",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingConfig {
    /// Flush once a batch holds this many messages.
    pub element_count_threshold: usize,
    /// Flush once a batch's encoded size reaches this many bytes.
    pub request_byte_threshold: usize,
    /// Flush a non-empty batch this long after the alarm is armed.
    pub delay_threshold: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            element_count_threshold: DEFAULT_ELEMENT_COUNT_THRESHOLD,
            request_byte_threshold: DEFAULT_REQUEST_BYTE_THRESHOLD,
            delay_threshold: DEFAULT_DELAY_THRESHOLD,
        }
    }
}

impl BatchingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.element_count_threshold == 0
            || self.element_count_threshold > MAX_PUBLISH_ELEMENT_COUNT
        {
            return Err(ConfigError::invalid(
                "element_count_threshold",
                format!("must be in 1..={MAX_PUBLISH_ELEMENT_COUNT}"),
            ));
        }
        if self.request_byte_threshold == 0 || self.request_byte_threshold > MAX_PUBLISH_REQUEST_BYTES
        {
            return Err(ConfigError::invalid(
                "request_byte_threshold",
                format!("must be in 1..={MAX_PUBLISH_REQUEST_BYTES}"),
            ));
        }
        if self.delay_threshold.is_zero() {
            return Err(ConfigError::invalid("delay_threshold", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_retry_delay: Duration,
    pub retry_delay_multiplier: f64,
    pub max_retry_delay: Duration,
    /// Overall budget across attempts. Ignored when message ordering is on.
    pub total_timeout: Duration,
    /// Zero means no attempt limit. Ignored when message ordering is on.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: DEFAULT_INITIAL_RETRY_DELAY,
            retry_delay_multiplier: DEFAULT_RETRY_DELAY_MULTIPLIER,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
            max_attempts: 0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.retry_delay_multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "retry_delay_multiplier",
                "must be at least 1.0",
            ));
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(ConfigError::invalid(
                "initial_retry_delay",
                "must not exceed max_retry_delay",
            ));
        }
        if self.total_timeout.is_zero() {
            return Err(ConfigError::invalid("total_timeout", "must be positive"));
        }
        Ok(())
    }
}

/// Immutable publisher settings, checked when the publisher is built.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub batching: BatchingConfig,
    pub retry: RetryConfig,
    pub flow_control: FlowControlConfig,
    pub enable_message_ordering: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batching: BatchingConfig::default(),
            retry: RetryConfig::default(),
            flow_control: FlowControlConfig::unbounded(),
            enable_message_ordering: false,
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.batching.validate()?;
        self.retry.validate()?;
        self.flow_control.validate()
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize_env("PUBSUB_PUBLISH_ELEMENT_COUNT_THRESHOLD") {
            config.batching.element_count_threshold = value;
        }
        if let Some(value) = read_usize_env("PUBSUB_PUBLISH_REQUEST_BYTE_THRESHOLD") {
            config.batching.request_byte_threshold = value;
        }
        if let Some(value) = read_u64_env("PUBSUB_PUBLISH_DELAY_THRESHOLD_MS") {
            config.batching.delay_threshold = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("PUBSUB_PUBLISH_MAX_ATTEMPTS") {
            config.retry.max_attempts = u32::try_from(value).unwrap_or(u32::MAX);
        }
        if let Some(value) = read_u64_env("PUBSUB_PUBLISH_TOTAL_TIMEOUT_MS") {
            config.retry.total_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_bool_env("PUBSUB_PUBLISH_ENABLE_ORDERING") {
            config.enable_message_ordering = value;
        }
        if let Some(value) = read_u64_env("PUBSUB_PUBLISH_MAX_OUTSTANDING_MESSAGES") {
            config.flow_control.max_outstanding_elements = Some(value);
        }
        if let Some(value) = read_u64_env("PUBSUB_PUBLISH_MAX_OUTSTANDING_BYTES") {
            config.flow_control.max_outstanding_bytes = Some(value);
        }
        if let Some(value) = read_behavior_env("PUBSUB_PUBLISH_FLOW_CONTROL") {
            config.flow_control.behavior = value;
        }
        config
    }

    /// Defaults, then `PUBSUB_*` env vars, then the `publisher:` section of an
    /// optional YAML file (explicit path or `PUBSUB_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(file) = read_override_file(config_path)?
            && let Some(section) = file.publisher
        {
            section.apply(&mut config);
        }
        config.validate().context("validate publisher config")?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let in-flight callbacks finish; nack what is left once the timeout expires.
    WaitForProcessing,
    /// Stop extending leases and nack everything outstanding right away.
    NackImmediately,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    pub mode: ShutdownMode,
    /// Only used by `WaitForProcessing`. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::WaitForProcessing,
            timeout: None,
        }
    }
}

/// Immutable subscriber settings, checked when the subscriber is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberConfig {
    pub flow_control: FlowControlConfig,
    /// Total time a message may be leased before it is left to expire.
    pub max_ack_extension_period: Duration,
    /// Lower bound for each extension. Zero leaves it unset.
    pub min_duration_per_ack_extension: Duration,
    /// Upper bound for each extension. Zero leaves it unset.
    pub max_duration_per_ack_extension: Duration,
    /// Advertised on the stream; receipts modack right away, so this mostly
    /// covers a late first modack.
    pub stream_ack_deadline: Duration,
    /// Re-extend this long before a lease would lapse.
    pub ack_expiration_padding: Duration,
    pub parallel_pull_count: usize,
    /// Callback concurrency; `None` means five per stream.
    pub max_concurrent_callbacks: Option<usize>,
    /// When true, `ack`/`nack` futures resolve with the server-confirmed outcome.
    pub track_ack_responses: bool,
    /// Budget for retrying transient ack failures under exactly-once delivery.
    pub ack_retry_timeout: Duration,
    pub shutdown: ShutdownConfig,
    /// Pulled streams share this id; generated when absent.
    pub client_id: Option<String>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            flow_control: FlowControlConfig::bounded(
                DEFAULT_SUBSCRIBER_MAX_OUTSTANDING_MESSAGES,
                DEFAULT_SUBSCRIBER_MAX_OUTSTANDING_BYTES,
                FlowControlBehavior::Block,
            ),
            max_ack_extension_period: DEFAULT_MAX_ACK_EXTENSION_PERIOD,
            min_duration_per_ack_extension: Duration::ZERO,
            max_duration_per_ack_extension: Duration::ZERO,
            stream_ack_deadline: DEFAULT_STREAM_ACK_DEADLINE,
            ack_expiration_padding: DEFAULT_ACK_EXPIRATION_PADDING,
            parallel_pull_count: DEFAULT_PARALLEL_PULL_COUNT,
            max_concurrent_callbacks: None,
            track_ack_responses: false,
            ack_retry_timeout: DEFAULT_ACK_RETRY_TIMEOUT,
            shutdown: ShutdownConfig::default(),
            client_id: None,
        }
    }
}

impl SubscriberConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.flow_control.validate()?;
        check_extension_bound(
            "min_duration_per_ack_extension",
            self.min_duration_per_ack_extension,
        )?;
        check_extension_bound(
            "max_duration_per_ack_extension",
            self.max_duration_per_ack_extension,
        )?;
        if !self.min_duration_per_ack_extension.is_zero()
            && !self.max_duration_per_ack_extension.is_zero()
            && self.min_duration_per_ack_extension > self.max_duration_per_ack_extension
        {
            return Err(ConfigError::invalid(
                "min_duration_per_ack_extension",
                "must not exceed max_duration_per_ack_extension",
            ));
        }
        if self.stream_ack_deadline < MIN_ACK_DEADLINE || self.stream_ack_deadline > MAX_ACK_DEADLINE
        {
            return Err(ConfigError::invalid(
                "stream_ack_deadline",
                format!(
                    "must be between {}s and {}s",
                    MIN_ACK_DEADLINE.as_secs(),
                    MAX_ACK_DEADLINE.as_secs()
                ),
            ));
        }
        if self.parallel_pull_count == 0 {
            return Err(ConfigError::invalid(
                "parallel_pull_count",
                "must be at least 1",
            ));
        }
        if self.max_concurrent_callbacks == Some(0) {
            return Err(ConfigError::invalid(
                "max_concurrent_callbacks",
                "must be greater than zero when set",
            ));
        }
        Ok(())
    }

    pub fn callback_concurrency(&self) -> usize {
        self.max_concurrent_callbacks
            .unwrap_or(CALLBACKS_PER_STREAM * self.parallel_pull_count)
    }

    /// Lower extension bound in effect for the current delivery mode.
    pub(crate) fn effective_min_extension(&self, exactly_once: bool) -> Duration {
        if !self.min_duration_per_ack_extension.is_zero() {
            return self.min_duration_per_ack_extension;
        }
        if exactly_once {
            return DEFAULT_MIN_EXTENSION_EXACTLY_ONCE;
        }
        Duration::ZERO
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_u64_env("PUBSUB_SUBSCRIBE_MAX_OUTSTANDING_MESSAGES") {
            config.flow_control.max_outstanding_elements = Some(value);
        }
        if let Some(value) = read_u64_env("PUBSUB_SUBSCRIBE_MAX_OUTSTANDING_BYTES") {
            config.flow_control.max_outstanding_bytes = Some(value);
        }
        if let Some(value) = read_u64_env("PUBSUB_SUBSCRIBE_MAX_ACK_EXTENSION_SECS") {
            config.max_ack_extension_period = Duration::from_secs(value);
        }
        if let Some(value) = read_u64_env("PUBSUB_SUBSCRIBE_MIN_EXTENSION_SECS") {
            config.min_duration_per_ack_extension = Duration::from_secs(value);
        }
        if let Some(value) = read_u64_env("PUBSUB_SUBSCRIBE_MAX_EXTENSION_SECS") {
            config.max_duration_per_ack_extension = Duration::from_secs(value);
        }
        if let Some(value) = read_usize_env("PUBSUB_SUBSCRIBE_PARALLEL_PULL_COUNT") {
            config.parallel_pull_count = value;
        }
        if let Some(value) = read_usize_env("PUBSUB_SUBSCRIBE_MAX_CONCURRENT_CALLBACKS") {
            config.max_concurrent_callbacks = Some(value);
        }
        if let Some(value) = read_bool_env("PUBSUB_SUBSCRIBE_TRACK_ACK_RESPONSES") {
            config.track_ack_responses = value;
        }
        if let Some(value) = std::env::var("PUBSUB_SUBSCRIBE_SHUTDOWN_MODE")
            .ok()
            .and_then(|value| parse_shutdown_mode(&value))
        {
            config.shutdown.mode = value;
        }
        if let Some(value) = read_u64_env("PUBSUB_SUBSCRIBE_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown.timeout = Some(Duration::from_millis(value));
        }
        config
    }

    /// Defaults, then `PUBSUB_*` env vars, then the `subscriber:` section of an
    /// optional YAML file (explicit path or `PUBSUB_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(file) = read_override_file(config_path)?
            && let Some(section) = file.subscriber
        {
            section.apply(&mut config);
        }
        config.validate().context("validate subscriber config")?;
        Ok(config)
    }
}

fn check_extension_bound(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() || (MIN_ACK_DEADLINE..=MAX_ACK_DEADLINE).contains(&value) {
        return Ok(());
    }
    Err(ConfigError::invalid(
        field,
        format!(
            "must be zero or between {}s and {}s",
            MIN_ACK_DEADLINE.as_secs(),
            MAX_ACK_DEADLINE.as_secs()
        ),
    ))
}

fn parse_shutdown_mode(value: &str) -> Option<ShutdownMode> {
    match value {
        "wait" | "wait_for_processing" => Some(ShutdownMode::WaitForProcessing),
        "nack" | "nack_immediately" => Some(ShutdownMode::NackImmediately),
        _ => None,
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ConfigFile {
    publisher: Option<PublisherOverride>,
    subscriber: Option<SubscriberOverride>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct PublisherOverride {
    element_count_threshold: Option<usize>,
    request_byte_threshold: Option<usize>,
    delay_threshold_ms: Option<u64>,
    initial_retry_delay_ms: Option<u64>,
    retry_delay_multiplier: Option<f64>,
    max_retry_delay_ms: Option<u64>,
    total_timeout_ms: Option<u64>,
    max_attempts: Option<u32>,
    enable_message_ordering: Option<bool>,
    max_outstanding_messages: Option<u64>,
    max_outstanding_bytes: Option<u64>,
    flow_control_behavior: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct SubscriberOverride {
    max_outstanding_messages: Option<u64>,
    max_outstanding_bytes: Option<u64>,
    flow_control_behavior: Option<String>,
    max_ack_extension_secs: Option<u64>,
    min_extension_secs: Option<u64>,
    max_extension_secs: Option<u64>,
    stream_ack_deadline_secs: Option<u64>,
    ack_expiration_padding_secs: Option<u64>,
    parallel_pull_count: Option<usize>,
    max_concurrent_callbacks: Option<usize>,
    track_ack_responses: Option<bool>,
    ack_retry_timeout_ms: Option<u64>,
    shutdown_mode: Option<String>,
    shutdown_timeout_ms: Option<u64>,
    client_id: Option<String>,
}

impl PublisherOverride {
    fn apply(&self, config: &mut PublisherConfig) {
        if let Some(value) = self.element_count_threshold
            && value > 0
        {
            config.batching.element_count_threshold = value;
        }
        if let Some(value) = self.request_byte_threshold
            && value > 0
        {
            config.batching.request_byte_threshold = value;
        }
        if let Some(value) = self.delay_threshold_ms
            && value > 0
        {
            config.batching.delay_threshold = Duration::from_millis(value);
        }
        if let Some(value) = self.initial_retry_delay_ms
            && value > 0
        {
            config.retry.initial_retry_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_delay_multiplier
            && value > 0.0
        {
            config.retry.retry_delay_multiplier = value;
        }
        if let Some(value) = self.max_retry_delay_ms
            && value > 0
        {
            config.retry.max_retry_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.total_timeout_ms
            && value > 0
        {
            config.retry.total_timeout = Duration::from_millis(value);
        }
        // Zero is meaningful here: it removes the attempt limit.
        if let Some(value) = self.max_attempts {
            config.retry.max_attempts = value;
        }
        if let Some(value) = self.enable_message_ordering {
            config.enable_message_ordering = value;
        }
        if let Some(value) = self.max_outstanding_messages
            && value > 0
        {
            config.flow_control.max_outstanding_elements = Some(value);
        }
        if let Some(value) = self.max_outstanding_bytes
            && value > 0
        {
            config.flow_control.max_outstanding_bytes = Some(value);
        }
        if let Some(value) = &self.flow_control_behavior
            && let Some(parsed) = FlowControlBehavior::parse(value)
        {
            config.flow_control.behavior = parsed;
        }
    }
}

impl SubscriberOverride {
    fn apply(&self, config: &mut SubscriberConfig) {
        if let Some(value) = self.max_outstanding_messages
            && value > 0
        {
            config.flow_control.max_outstanding_elements = Some(value);
        }
        if let Some(value) = self.max_outstanding_bytes
            && value > 0
        {
            config.flow_control.max_outstanding_bytes = Some(value);
        }
        if let Some(value) = &self.flow_control_behavior
            && let Some(parsed) = FlowControlBehavior::parse(value)
        {
            config.flow_control.behavior = parsed;
        }
        if let Some(value) = self.max_ack_extension_secs {
            config.max_ack_extension_period = Duration::from_secs(value);
        }
        if let Some(value) = self.min_extension_secs {
            config.min_duration_per_ack_extension = Duration::from_secs(value);
        }
        if let Some(value) = self.max_extension_secs {
            config.max_duration_per_ack_extension = Duration::from_secs(value);
        }
        if let Some(value) = self.stream_ack_deadline_secs
            && value > 0
        {
            config.stream_ack_deadline = Duration::from_secs(value);
        }
        if let Some(value) = self.ack_expiration_padding_secs {
            config.ack_expiration_padding = Duration::from_secs(value);
        }
        if let Some(value) = self.parallel_pull_count
            && value > 0
        {
            config.parallel_pull_count = value;
        }
        if let Some(value) = self.max_concurrent_callbacks
            && value > 0
        {
            config.max_concurrent_callbacks = Some(value);
        }
        if let Some(value) = self.track_ack_responses {
            config.track_ack_responses = value;
        }
        if let Some(value) = self.ack_retry_timeout_ms
            && value > 0
        {
            config.ack_retry_timeout = Duration::from_millis(value);
        }
        if let Some(value) = &self.shutdown_mode
            && let Some(parsed) = parse_shutdown_mode(value)
        {
            config.shutdown.mode = parsed;
        }
        if let Some(value) = self.shutdown_timeout_ms
            && value > 0
        {
            config.shutdown.timeout = Some(Duration::from_millis(value));
        }
        if let Some(value) = &self.client_id
            && !value.is_empty()
        {
            config.client_id = Some(value.clone());
        }
    }
}

fn read_override_file(config_path: Option<&str>) -> Result<Option<ConfigFile>> {
    let override_path = config_path
        .map(|value| value.to_string())
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok());
    let Some(path) = override_path else {
        return Ok(None);
    };
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read client config: {path}"))?;
    let file: ConfigFile =
        serde_yaml::from_str(&contents).context("parse client config yaml")?;
    Ok(Some(file))
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

fn read_behavior_env(key: &str) -> Option<FlowControlBehavior> {
    std::env::var(key)
        .ok()
        .and_then(|value| FlowControlBehavior::parse(&value))
}
