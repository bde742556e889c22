//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast on unparsable values. Every field is a
//! startup-time constant; nothing here changes at runtime. Connection
//! strings are wrapped in `secrecy::SecretString` to keep them out of logs.

pub mod secrets;

use crate::bridge::{ApplyMode, PublishMode, ReadPath};
use crate::error::{Error, Result};
use crate::model::{StartOffset, TopicPartition};
use secrecy::SecretString;
use serde::Deserialize;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Postgres URL for the durable log. `None` runs an in-process log.
    pub broker_url: Option<SecretString>,
    /// Postgres URL for the keyed cache. `None` runs an in-process cache.
    pub cache_url: Option<SecretString>,
    pub topic: String,
    pub partition: i32,
    pub http_host: String,
    pub http_port: u16,
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Simulated processing time of a `/process` job.
    pub job_duration_ms: u64,
    pub start_offset: StartOffset,
    pub publish_mode: PublishMode,
    /// Capacity of the async publish channel.
    pub publish_buffer: usize,
    pub apply_mode: ApplyMode,
    /// Upper bound on in-flight publishes during a republish fan-out.
    pub republish_concurrency: usize,
    /// What `GET /getdata` does.
    pub read_path: ReadPath,
    /// Subscriber poll fallback when no append notification arrives.
    pub poll_interval_ms: u64,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: None,
            cache_url: None,
            topic: "testTopic".to_string(),
            partition: 0,
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            worker_count: 5,
            queue_capacity: 10,
            job_duration_ms: 2000,
            start_offset: StartOffset::Oldest,
            publish_mode: PublishMode::Async,
            publish_buffer: 256,
            apply_mode: ApplyMode::Inline,
            republish_concurrency: 16,
            read_path: ReadPath::Republish,
            poll_interval_ms: 500,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. In local dev, call
    /// `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            broker_url: optional_var("BROKER_URL").map(SecretString::from),
            cache_url: optional_var("CACHE_URL").map(SecretString::from),
            topic: optional_var("TOPIC").unwrap_or(defaults.topic),
            partition: parsed_var("PARTITION")?.unwrap_or(defaults.partition),
            http_host: optional_var("HTTP_HOST").unwrap_or(defaults.http_host),
            http_port: parsed_var("HTTP_PORT")?.unwrap_or(defaults.http_port),
            worker_count: parsed_var("WORKER_COUNT")?.unwrap_or(defaults.worker_count),
            queue_capacity: parsed_var("QUEUE_CAPACITY")?.unwrap_or(defaults.queue_capacity),
            job_duration_ms: parsed_var("JOB_DURATION_MS")?.unwrap_or(defaults.job_duration_ms),
            start_offset: parsed_var("START_OFFSET")?.unwrap_or(defaults.start_offset),
            publish_mode: parsed_var("PUBLISH_MODE")?.unwrap_or(defaults.publish_mode),
            publish_buffer: parsed_var("PUBLISH_BUFFER")?.unwrap_or(defaults.publish_buffer),
            apply_mode: parsed_var("APPLY_MODE")?.unwrap_or(defaults.apply_mode),
            republish_concurrency: parsed_var("REPUBLISH_CONCURRENCY")?
                .unwrap_or(defaults.republish_concurrency),
            read_path: parsed_var("READ_PATH")?.unwrap_or(defaults.read_path),
            poll_interval_ms: parsed_var("POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval_ms),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::Config("topic must not be empty".to_string()));
        }
        for (name, value) in [
            ("worker_count", self.worker_count),
            ("queue_capacity", self.queue_capacity),
            ("publish_buffer", self.publish_buffer),
            ("republish_concurrency", self.republish_concurrency),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_duration(&self) -> Duration {
        Duration::from_millis(self.job_duration_ms)
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    optional_var(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}")))
        })
        .transpose()
}
