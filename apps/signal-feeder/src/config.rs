use crate::publisher::{DatabaseEndpoint, DEFAULT_WRITE_TIMEOUT};
use crate::telemetry::TagSet;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("unknown log format `{other}` (expected text or json)")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_precision: String,
    pub location: String,
    pub aggregator: String,
    pub http_timeout_secs: u64,
    pub handoff_capacity: usize,
    pub inclusive_end: bool,
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup };

        Ok(Self {
            db_host: vars.string("SIGNAL_FEEDER_DB_HOST", "localhost"),
            db_port: vars.parse("SIGNAL_FEEDER_DB_PORT", 8086)?,
            db_name: vars.string("SIGNAL_FEEDER_DB_NAME", "iot_field_metrics"),
            db_precision: vars.string("SIGNAL_FEEDER_DB_PRECISION", "ms"),
            location: vars.string("SIGNAL_FEEDER_LOCATION", "colombia"),
            aggregator: vars.string("SIGNAL_FEEDER_AGGREGATOR", "agg-col-001"),
            http_timeout_secs: vars
                .parse::<u64>(
                    "SIGNAL_FEEDER_HTTP_TIMEOUT_SECS",
                    DEFAULT_WRITE_TIMEOUT.as_secs(),
                )?
                .max(1),
            handoff_capacity: vars.parse("SIGNAL_FEEDER_HANDOFF_CAPACITY", 0)?,
            inclusive_end: vars.flag("SIGNAL_FEEDER_INCLUSIVE_END", false)?,
            log_format: vars.parse("SIGNAL_FEEDER_LOG_FORMAT", LogFormat::Text)?,
            otlp_endpoint: vars.optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn endpoint(&self) -> DatabaseEndpoint {
        DatabaseEndpoint {
            host: self.db_host.clone(),
            port: self.db_port,
            db_name: self.db_name.clone(),
            precision: self.db_precision.clone(),
        }
    }

    pub fn tags(&self) -> TagSet {
        let mut tags = TagSet::new();
        tags.insert("location".to_string(), self.location.clone());
        tags.insert("aggregator".to_string(), self.aggregator.clone());
        tags
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|err| anyhow!("{err}"))
                .with_context(|| format!("invalid {key}")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key) {
            Some(raw) if raw == "1" || raw.eq_ignore_ascii_case("true") => Ok(true),
            Some(raw) if raw == "0" || raw.eq_ignore_ascii_case("false") => Ok(false),
            Some(raw) => Err(anyhow!("invalid {key}: expected true/false, got `{raw}`")),
            None => Ok(default),
        }
    }
}
