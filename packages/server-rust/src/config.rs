//! Server configuration.
//!
//! [`ServerConfig`] doubles as the clap surface for the `stashd` binary
//! (every option also binds an environment variable) and as the plain
//! struct embedded by tests, which construct it via [`Default`].

use clap::Parser;

/// How deadline-passed entries leave the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryMode {
    /// The sweep deletes due entries at the next tick.
    Strict,
    /// The sweep only marks due entries; the next read removes them.
    Lazy,
}

/// Bytes per configured megabyte.
pub const BYTES_PER_MB: u64 = 1_048_576;

/// Top-level configuration for a cache server instance.
#[derive(Debug, Clone, Parser)]
#[command(name = "stashd", version, about = "In-memory key/value cache service")]
pub struct ServerConfig {
    /// Port the client listener binds to.
    #[arg(long, env = "STASH_CLIENT_PORT", default_value_t = 7171)]
    pub client_port: u16,

    /// Memory ceiling for stored entries, in megabytes.
    #[arg(long, env = "STASH_CACHE_SIZE_MBS", default_value_t = 64)]
    pub cache_size_mbs: u64,

    /// Fraction of the ceiling at which eviction is signalled, in (0, 1].
    #[arg(long, env = "STASH_EVICTION_THRESHOLD", default_value_t = 0.9)]
    pub eviction_threshold: f64,

    /// Fraction of live entries removed per eviction pass, in (0, 1].
    #[arg(long, env = "STASH_EVICTION_FACTOR", default_value_t = 0.75)]
    pub eviction_factor: f64,

    /// Delete due entries on sweep (strict) instead of on next read (lazy).
    #[arg(long, env = "STASH_STRICT_EXPIRY", default_value_t = false)]
    pub strict_expiry: bool,

    /// Seconds between expiry sweeps.
    #[arg(long, env = "STASH_SWEEP_INTERVAL_SECS", default_value_t = 6)]
    pub sweep_interval_secs: u64,

    /// Port for the Prometheus metrics exporter. Disabled when absent.
    #[arg(long, env = "STASH_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_port: 7171,
            cache_size_mbs: 64,
            eviction_threshold: 0.9,
            eviction_factor: 0.75,
            strict_expiry: false,
            sweep_interval_secs: 6,
            metrics_port: None,
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cache size must be at least 1 MB")]
    ZeroCacheSize,
    #[error("{name} must be a fraction in (0, 1], got {value}")]
    FractionOutOfRange { name: &'static str, value: f64 },
    #[error("sweep interval must be at least 1 second")]
    ZeroSweepInterval,
}

impl ServerConfig {
    /// The memory ceiling in bytes.
    #[must_use]
    pub fn ceiling_bytes(&self) -> u64 {
        self.cache_size_mbs * BYTES_PER_MB
    }

    /// The configured expiry mode.
    #[must_use]
    pub fn expiry_mode(&self) -> ExpiryMode {
        if self.strict_expiry {
            ExpiryMode::Strict
        } else {
            ExpiryMode::Lazy
        }
    }

    /// Check option ranges before the server starts.
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range option found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size_mbs == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        for (name, value) in [
            ("eviction-threshold", self.eviction_threshold),
            ("eviction-factor", self.eviction_factor),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::FractionOutOfRange { name, value });
            }
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }
}
