/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for connections and links.
//!
//! Components receive a [`Config`] explicitly (through connection and link
//! options). [`global`] holds the process-wide default, initialized from
//! the environment, and lets tests install scoped overrides.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::RwLock;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use serde::Serialize;

/// Configuration for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Container id advertised in Open.
    pub container_id: String,
    /// Largest frame this side accepts.
    pub max_frame_size: u32,
    /// Number of channels this side supports.
    pub channel_max: u16,
    /// Heartbeat interval. Zero disables heartbeats.
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
    /// How long `transport::connect` waits for the Open exchange.
    #[serde(with = "duration_str")]
    pub open_timeout: Duration,
    /// How far below zero a receiver's credit may go before the link is
    /// destroyed.
    pub credit_violation_threshold: u32,
    /// Most messages a sender link queues before rejecting sends.
    pub available_limit: u32,
    /// Auto-replenishing receivers top up once credit falls below this.
    pub auto_credit_low_water: u32,
    /// Credit added by an auto-replenishing receiver.
    pub auto_credit_boost: u32,
    /// First interval between credit nudges for a blocked sender.
    #[serde(with = "duration_str")]
    pub nudge_initial_interval: Duration,
    /// Cap on the interval between credit nudges.
    #[serde(with = "duration_str")]
    pub nudge_max_interval: Duration,
    /// How often the nudger scans its registry.
    #[serde(with = "duration_str")]
    pub nudge_tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        Self {
            container_id: format!("amqp-transport-{}", suffix),
            max_frame_size: 1024 * 1024, // 1 MiB
            channel_max: 256,
            heartbeat_interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            credit_violation_threshold: 10,
            available_limit: 10_000,
            auto_credit_low_water: 20,
            auto_credit_boost: 100,
            nudge_initial_interval: Duration::from_secs(2),
            nudge_max_interval: Duration::from_secs(60),
            nudge_tick: Duration::from_millis(500),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = env::var(name).ok()?;
    match val.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(name, value = %val, "ignoring unparseable config variable");
            None
        }
    }
}

fn env_duration(name: &str) -> Option<Duration> {
    let val = env::var(name).ok()?;
    match humantime::parse_duration(&val) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!(name, value = %val, error = %err, "ignoring unparseable duration");
            None
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `AMQP_TRANSPORT_*` environment variables,
    /// falling back to defaults. Durations use humantime syntax ("30s").
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("AMQP_TRANSPORT_CONTAINER_ID") {
            config.container_id = val;
        }
        if let Some(val) = env_parse("AMQP_TRANSPORT_MAX_FRAME_SIZE") {
            config.max_frame_size = val;
        }
        if let Some(val) = env_parse("AMQP_TRANSPORT_CHANNEL_MAX") {
            config.channel_max = val;
        }
        if let Some(val) = env_duration("AMQP_TRANSPORT_HEARTBEAT_INTERVAL") {
            config.heartbeat_interval = val;
        }
        if let Some(val) = env_duration("AMQP_TRANSPORT_OPEN_TIMEOUT") {
            config.open_timeout = val;
        }
        if let Some(val) = env_parse("AMQP_TRANSPORT_CREDIT_VIOLATION_THRESHOLD") {
            config.credit_violation_threshold = val;
        }
        if let Some(val) = env_parse("AMQP_TRANSPORT_AVAILABLE_LIMIT") {
            config.available_limit = val;
        }
        if let Some(val) = env_parse("AMQP_TRANSPORT_AUTO_CREDIT_LOW_WATER") {
            config.auto_credit_low_water = val;
        }
        if let Some(val) = env_parse("AMQP_TRANSPORT_AUTO_CREDIT_BOOST") {
            config.auto_credit_boost = val;
        }
        if let Some(val) = env_duration("AMQP_TRANSPORT_NUDGE_INITIAL_INTERVAL") {
            config.nudge_initial_interval = val;
        }
        if let Some(val) = env_duration("AMQP_TRANSPORT_NUDGE_MAX_INTERVAL") {
            config.nudge_max_interval = val;
        }
        if let Some(val) = env_duration("AMQP_TRANSPORT_NUDGE_TICK") {
            config.nudge_tick = val;
        }

        config
    }

    /// Load configuration from a YAML file. Missing keys take defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}

/// Serde adapter writing durations as humantime strings.
mod duration_str {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Global configuration functions
///
/// Tests can override global configuration using [`global::lock`]. This
/// ensures that such tests are serialized (and cannot clobber each other's
/// overrides).
///
/// ```ignore rust
/// let config = amqp_transport::config::global::lock();
/// let _guard = config.override_with(|c| c.channel_max = 16);
/// ```
pub mod global {
    use std::marker::PhantomData;

    use super::*;

    static CONFIG: LazyLock<Arc<RwLock<Config>>> =
        LazyLock::new(|| Arc::new(RwLock::new(Config::from_env())));

    /// A snapshot of the global configuration.
    pub fn get() -> Config {
        CONFIG.read().unwrap().clone()
    }

    /// Re-initialize the global configuration from environment variables.
    pub fn init_from_env() {
        *CONFIG.write().unwrap() = Config::from_env();
    }

    /// Initialize the global configuration from a YAML file.
    pub fn init_from_yaml<P: AsRef<Path>>(path: P) -> Result<(), anyhow::Error> {
        let config = Config::from_yaml(path)?;
        *CONFIG.write().unwrap() = config;
        Ok(())
    }

    /// Reset the global configuration to defaults. Call with the
    /// [`lock`] held.
    pub fn reset_to_defaults() {
        *CONFIG.write().unwrap() = Config::default();
    }

    /// Acquire the global configuration lock for testing.
    pub fn lock() -> ConfigLock {
        static MUTEX: LazyLock<std::sync::Mutex<()>> = LazyLock::new(|| std::sync::Mutex::new(()));
        ConfigLock {
            _guard: MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Holds the global configuration lock; the only way to create overrides.
    pub struct ConfigLock {
        _guard: std::sync::MutexGuard<'static, ()>,
    }

    impl ConfigLock {
        /// Apply `f` to the global configuration until the returned guard
        /// is dropped.
        pub fn override_with(&self, f: impl FnOnce(&mut Config)) -> ConfigOverrideGuard<'_> {
            let mut config = CONFIG.write().unwrap();
            let orig = config.clone();
            f(&mut *config);
            ConfigOverrideGuard {
                orig: Some(orig),
                _phantom: PhantomData,
            }
        }
    }

    /// Restores the previous configuration when dropped.
    pub struct ConfigOverrideGuard<'a> {
        orig: Option<Config>,
        // Ties the guard to the ConfigLock it was created from.
        _phantom: PhantomData<&'a ()>,
    }

    impl Drop for ConfigOverrideGuard<'_> {
        fn drop(&mut self) {
            if let Some(orig) = self.orig.take() {
                *CONFIG.write().unwrap() = orig;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_frame_size, 1024 * 1024);
        assert_eq!(config.channel_max, 256);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.nudge_initial_interval, Duration::from_secs(2));
        assert_eq!(config.nudge_max_interval, Duration::from_secs(60));
        assert!(config.container_id.starts_with("amqp-transport-"));
    }

    #[test]
    fn test_from_env() {
        let _lock = global::lock();
        // SAFETY: tests touching the environment hold the global config lock.
        unsafe { std::env::set_var("AMQP_TRANSPORT_CHANNEL_MAX", "16") };
        // SAFETY: as above.
        unsafe { std::env::set_var("AMQP_TRANSPORT_HEARTBEAT_INTERVAL", "5s") };
        // SAFETY: as above.
        unsafe { std::env::set_var("AMQP_TRANSPORT_AVAILABLE_LIMIT", "not a number") };

        let config = Config::from_env();
        assert_eq!(config.channel_max, 16);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.available_limit, 10_000);

        // SAFETY: as above.
        unsafe { std::env::remove_var("AMQP_TRANSPORT_CHANNEL_MAX") };
        // SAFETY: as above.
        unsafe { std::env::remove_var("AMQP_TRANSPORT_HEARTBEAT_INTERVAL") };
        // SAFETY: as above.
        unsafe { std::env::remove_var("AMQP_TRANSPORT_AVAILABLE_LIMIT") };
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = std::env::temp_dir()
            .join(format!("amqp-transport-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");

        let mut config = Config::default();
        config.channel_max = 32;
        config.nudge_tick = Duration::from_millis(250);
        config.to_yaml(&path).unwrap();

        let yaml = std::fs::read_to_string(&path).unwrap();
        assert!(yaml.contains("nudge_tick: 250ms"), "{yaml}");
        assert_eq!(Config::from_yaml(&path).unwrap(), config);

        std::fs::write(&path, "channel_max: 8\n").unwrap();
        let partial = Config::from_yaml(&path).unwrap();
        assert_eq!(partial.channel_max, 8);
        assert_eq!(partial.max_frame_size, 1024 * 1024);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_global_override() {
        let config = global::lock();
        global::reset_to_defaults();
        assert_eq!(global::get().channel_max, 256);
        {
            let _guard = config.override_with(|c| c.channel_max = 16);
            assert_eq!(global::get().channel_max, 16);
        }
        assert_eq!(global::get().channel_max, 256);
    }
}
