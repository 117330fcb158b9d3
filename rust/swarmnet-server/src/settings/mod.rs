//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. Examples of
//! configuration files can be found in the `configs/` directory located in the repository root.

use std::{fmt, path::Path, time::Duration};

use config::{Config, ConfigError, Environment};
use redis::{ConnectionInfo, IntoConnectionInfo};
use serde::{
    de::{self, DeserializeOwned, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{merge::Selection, state_machine::Role, storage::DEFAULT_BEAM_SIZE};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Loads a settings type from a configuration file and the `SWARMNET_` environment.
fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .add_source(
            Environment::with_prefix("swarmnet")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?
        .try_deserialize()
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_peer_process"))]
/// The settings of a peer process.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub peer: PeerSettings,
    #[validate]
    pub training: TrainingSettings,
    #[serde(default)]
    #[validate]
    pub polling: PollingSettings,
    #[serde(default)]
    #[validate]
    pub merge: MergeSettings,
    #[serde(default)]
    #[validate]
    pub store: StoreSettings,
    pub redis: Option<RedisSettings>,
    #[serde(default)]
    #[validate]
    pub coordinator: CoordinatorSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = load(path)?;
        settings.validate()?;
        Ok(settings)
    }
}

fn validate_peer_process(s: &Settings) -> Result<(), ValidationError> {
    validate_redis(&s.store, &s.redis)
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_dashboard_process"))]
/// The settings of a dashboard process.
pub struct DashboardSettings {
    #[serde(default)]
    #[validate]
    pub store: StoreSettings,
    pub redis: Option<RedisSettings>,
    #[serde(default)]
    #[validate]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    #[validate]
    pub cache: CacheSettings,
    pub api: ApiSettings,
    pub log: LoggingSettings,
}

impl DashboardSettings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: DashboardSettings = load(path)?;
        settings.validate()?;
        Ok(settings)
    }
}

fn validate_dashboard_process(s: &DashboardSettings) -> Result<(), ValidationError> {
    validate_redis(&s.store, &s.redis)
}

fn validate_redis(
    store: &StoreSettings,
    redis: &Option<RedisSettings>,
) -> Result<(), ValidationError> {
    match (store.backend, redis) {
        (StoreBackend::Redis, None) => Err(ValidationError::new("missing redis settings")),
        _ => Ok(()),
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Identity of the peer.
pub struct PeerSettings {
    /// The peer id. It must be unique in the swarm and stable across restarts.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [peer]
    /// id = "QmYyQSo1c1Ym7orWxLYvCrM2EmxFTANf8wXmmE7DWjhx5N"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SWARMNET_PEER__ID=QmYyQSo1c1Ym7orWxLYvCrM2EmxFTANf8wXmmE7DWjhx5N
    /// ```
    #[validate(length(min = 1))]
    pub id: String,

    /// Whether this peer advances the round/stage counter. Exactly one peer of a swarm must be
    /// the `coordinator`, all others are `follower`s.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [peer]
    /// role = "follower"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SWARMNET_PEER__ROLE=coordinator
    /// ```
    pub role: Role,
}

/// Where a follower reads the round/stage counter from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CounterSource {
    /// The counter key of the shared store.
    Store,
    /// The external coordinator service.
    Coordinator,
}

impl Default for CounterSource {
    fn default() -> Self {
        Self::Store
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Training schedule settings.
pub struct TrainingSettings {
    /// The number of rounds to train.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// max_rounds = 100
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SWARMNET_TRAINING__MAX_ROUNDS=100
    /// ```
    #[validate(range(min = 1))]
    pub max_rounds: u64,

    /// The total training time of the peer, in seconds. Defaults to 4 days.
    #[serde(default = "default_train_timeout")]
    #[validate(range(min = 1))]
    pub train_timeout: u64,

    /// Publish the cumulative reward every `publish_cadence` progress increments.
    #[serde(default = "default_publish_cadence")]
    #[validate(range(min = 1))]
    pub publish_cadence: u64,

    /// How often a stage's training step is attempted when it fails with transport errors.
    #[serde(default = "default_max_train_fails")]
    #[validate(range(min = 1))]
    pub max_train_fails: u32,

    /// The pause between two failed training attempts, in seconds.
    #[serde(default = "default_train_retry_pause")]
    pub train_retry_pause: u64,

    /// The lifetime of every published value, in seconds. Defaults to 4 hours.
    #[serde(default = "default_output_expiration")]
    #[validate(range(min = 1))]
    pub output_expiration: u64,

    /// The number of round winners submitted by the coordinator.
    #[serde(default = "default_winners")]
    pub winners: usize,

    #[serde(default)]
    pub follow: CounterSource,

    /// A JSON file holding the stage 0 dataset: a list of `{"question": ..., "answer": ...}`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// dataset = "configs/questions.json"
    /// ```
    pub dataset: Option<String>,
}

impl TrainingSettings {
    pub fn train_timeout(&self) -> Duration {
        Duration::from_secs(self.train_timeout)
    }

    pub fn train_retry_pause(&self) -> Duration {
        Duration::from_secs(self.train_retry_pause)
    }
}

fn default_train_timeout() -> u64 {
    4 * 24 * 3600
}

fn default_publish_cadence() -> u64 {
    4
}

fn default_max_train_fails() -> u32 {
    5
}

fn default_train_retry_pause() -> u64 {
    5
}

fn default_output_expiration() -> u64 {
    4 * 3600
}

fn default_winners() -> usize {
    10
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_polling"))]
/// How followers poll the round/stage counter. All values are in seconds.
pub struct PollingSettings {
    /// The retry interval while the counter is unreadable, and the initial backoff while waiting
    /// out a finished round.
    pub check_interval: u64,
    /// The minimal time between two logged polling failures.
    pub log_timeout: u64,
    /// The upper bound of the backoff.
    pub max_check_interval: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            check_interval: 5,
            log_timeout: 10,
            max_check_interval: 300,
        }
    }
}

impl PollingSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_secs(self.log_timeout)
    }

    pub fn max_check_interval(&self) -> Duration {
        Duration::from_secs(self.max_check_interval)
    }
}

fn validate_polling(s: &PollingSettings) -> Result<(), ValidationError> {
    if 0 < s.check_interval && s.check_interval <= s.max_check_interval {
        Ok(())
    } else {
        Err(ValidationError::new("invalid polling interval(s)"))
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy, Default)]
/// How contributions are picked when a stage prompt is assembled.
pub struct MergeSettings {
    #[serde(default)]
    pub selection: Selection,
    /// The maximal number of contributions per prompt. No limit if unset.
    #[validate(range(min = 1))]
    pub max_contributions: Option<usize>,
}

/// The backend of the shared store.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    /// A store private to the process. Only useful for local simulations.
    Memory,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Shared store settings.
pub struct StoreSettings {
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [store]
    /// backend = "redis"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SWARMNET_STORE__BACKEND=memory
    /// ```
    pub backend: StoreBackend,
    /// The number of contributors consulted per read.
    #[serde(default = "default_beam_size")]
    #[validate(range(min = 1))]
    pub beam_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            beam_size: DEFAULT_BEAM_SIZE,
        }
    }
}

fn default_beam_size() -> usize {
    DEFAULT_BEAM_SIZE
}

#[derive(Debug, Deserialize)]
/// Redis settings.
pub struct RedisSettings {
    /// The URL where Redis is running.
    ///
    /// The format of the URL is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [redis]
    /// url = "redis://127.0.0.1/"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SWARMNET_REDIS__URL=redis://127.0.0.1/
    /// ```
    #[serde(deserialize_with = "deserialize_redis_url")]
    pub url: ConnectionInfo,
    /// The maximum number of concurrent uses of the shared connection.
    #[serde(default = "default_connections")]
    pub connections: usize,
}

fn default_connections() -> usize {
    10
}

fn deserialize_redis_url<'de, D>(deserializer: D) -> Result<ConnectionInfo, D::Error>
where
    D: Deserializer<'de>,
{
    struct ConnectionInfoVisitor;

    impl<'de> Visitor<'de> for ConnectionInfoVisitor {
        type Value = ConnectionInfo;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]"
            )
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .into_connection_info()
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(ConnectionInfoVisitor)
}

/// The kind of external coordinator service.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorKind {
    /// No external service: registrations and winners stay in process, the round/stage counter
    /// is read from the shared store.
    None,
    /// An HTTP proxy in front of the coordinator service.
    Proxy,
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_coordinator"))]
/// External coordinator settings.
pub struct CoordinatorSettings {
    pub kind: CoordinatorKind,
    /// The base URL of the proxy.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [coordinator]
    /// kind = "proxy"
    /// url = "http://localhost:3000"
    /// org_id = "my-org"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SWARMNET_COORDINATOR__URL=http://localhost:3000
    /// ```
    #[validate(url)]
    pub url: Option<String>,
    /// The organization the peer is registered for.
    pub org_id: Option<String>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            kind: CoordinatorKind::None,
            url: None,
            org_id: None,
        }
    }
}

fn validate_coordinator(s: &CoordinatorSettings) -> Result<(), ValidationError> {
    match (s.kind, &s.url, &s.org_id) {
        (CoordinatorKind::None, _, _) | (CoordinatorKind::Proxy, Some(_), Some(_)) => Ok(()),
        _ => Err(ValidationError::new("the proxy coordinator needs a url and an org_id")),
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_cache"))]
/// Dashboard cache settings. Durations are in seconds.
pub struct CacheSettings {
    /// The time between two polls of the shared store.
    pub poll_interval: u64,
    /// The number of peers sampled for gossip.
    #[validate(range(min = 1))]
    pub node_target: usize,
    /// The maximal number of gossip messages.
    #[validate(range(min = 1))]
    pub message_target: usize,
    /// The time budget of one gossip collection.
    pub gossip_timeout: u64,
    /// How many rounds before the current one gossip looks back.
    pub gossip_rounds: u64,
    /// The number of points kept per peer in the cumulative leaderboard.
    pub history_len: usize,
    /// The number of points kept per peer in the rewards history.
    pub rewards_history_len: usize,
    /// The cache is unhealthy if its last completed poll is older than this.
    pub stale_after: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            poll_interval: 10,
            node_target: 20,
            message_target: 200,
            gossip_timeout: 10,
            gossip_rounds: 3,
            history_len: 30,
            rewards_history_len: 100,
            stale_after: 300,
        }
    }
}

fn validate_cache(s: &CacheSettings) -> Result<(), ValidationError> {
    if 0 < s.poll_interval && 0 < s.history_len && 0 < s.rewards_history_len {
        Ok(())
    } else {
        Err(ValidationError::new("invalid cache settings"))
    }
}

#[derive(Debug, Deserialize, Clone)]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:8081"
    /// # or
    /// bind_address = "127.0.0.1:8081"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SWARMNET_API__BIND_ADDRESS=127.0.0.1:8081
    /// ```
    pub bind_address: std::net::SocketAddr,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SWARMNET_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
