//! Consumer tuning knobs. Deserializable so hosts can embed them in their config file.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::protocol::DEFAULT_INTEREST_LIFETIME_MS;

/// Default total attempts per request (first expression included).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default number of outstanding segment interests per object.
pub const DEFAULT_PIPELINE_SIZE: usize = 8;

/// Default timeout for requests in ticks, for hosts that drive `tick()`.
pub const DEFAULT_REQUEST_TIMEOUT_TICKS: u64 = 4;

/// What to do with an in-progress assembly when a newer version is discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleVersionPolicy {
    /// Cancel the stale assembly and its outstanding requests.
    #[default]
    Cancel,
    /// Let it finish; publish only if nothing newer was published meanwhile.
    LetComplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    /// Attempts per request before the fetch is reported failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Outstanding segment interests per object.
    #[serde(default = "default_pipeline_size")]
    pub pipeline_size: usize,
    /// Segment interests sent before the final block id is known.
    #[serde(default = "default_initial_interest_count")]
    pub initial_interest_count: usize,
    #[serde(default = "default_interest_lifetime_ms")]
    pub interest_lifetime_ms: u64,
    #[serde(default = "default_request_timeout_ticks")]
    pub request_timeout_ticks: u64,
    #[serde(default)]
    pub stale_version_policy: StaleVersionPolicy,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_pipeline_size() -> usize {
    DEFAULT_PIPELINE_SIZE
}
fn default_initial_interest_count() -> usize {
    1
}
fn default_interest_lifetime_ms() -> u64 {
    DEFAULT_INTEREST_LIFETIME_MS
}
fn default_request_timeout_ticks() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_TICKS
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            pipeline_size: default_pipeline_size(),
            initial_interest_count: default_initial_interest_count(),
            interest_lifetime_ms: default_interest_lifetime_ms(),
            request_timeout_ticks: default_request_timeout_ticks(),
            stale_version_policy: StaleVersionPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    /// Reject values the handlers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries < 1 {
            return Err(Error::Config("max_retries must be at least 1".into()));
        }
        if self.pipeline_size < 1 {
            return Err(Error::Config("pipeline_size must be at least 1".into()));
        }
        if self.initial_interest_count < 1 {
            return Err(Error::Config(
                "initial_interest_count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_max_retries(mut self, n: u32) -> Result<Self> {
        self.max_retries = n;
        self.validate().map(|_| self)
    }

    pub fn with_pipeline_size(mut self, n: usize) -> Result<Self> {
        self.pipeline_size = n;
        self.validate().map(|_| self)
    }

    pub fn with_initial_interest_count(mut self, n: usize) -> Result<Self> {
        self.initial_interest_count = n;
        self.validate().map(|_| self)
    }

    pub fn with_stale_version_policy(mut self, policy: StaleVersionPolicy) -> Self {
        self.stale_version_policy = policy;
        self
    }
}
