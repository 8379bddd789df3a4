// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration for the SSE broker.
//!
//! Precedence: CLI flags/env vars (clap) override whatever a `--config`
//! TOML file supplied, which in turn overrides the built-in defaults below.

use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches};
use serde::Deserialize;

/// Top-level broker configuration.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "ssebroker")]
pub struct BrokerConfig {
    /// Path to a TOML config file merged in before CLI/env overrides.
    #[arg(long, env = "SSE_BROKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host to bind the HTTP listener on.
    #[arg(long, default_value = "0.0.0.0", env = "SSE_BROKER_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "SSE_BROKER_PORT")]
    pub port: u16,

    /// This instance's cluster-visible address (host:port other instances
    /// use to reach it). Defaults to `host:port` if unset.
    #[arg(long, env = "SSE_BROKER_INSTANCE_ADDRESS")]
    pub instance_address: Option<String>,

    /// Comma-separated Redis node addresses (`redis://host:port`).
    #[arg(
        long,
        default_value = "redis://127.0.0.1:6379",
        env = "SSE_BROKER_REDIS_ADDRS",
        value_delimiter = ','
    )]
    pub redis_addrs: Vec<String>,

    /// Redis AUTH password, if required.
    #[arg(long, env = "SSE_BROKER_REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// Redis logical database index.
    #[arg(long, default_value_t = 0, env = "SSE_BROKER_REDIS_DB")]
    pub redis_db: i64,

    /// Redis connection pool size. Accepted for config-file compatibility
    /// with the original deployment's `pool_size` knob; `redis::aio::
    /// ConnectionManager` multiplexes all commands over a single
    /// auto-reconnecting connection rather than a fixed-size pool, so this
    /// value is not otherwise consulted.
    #[arg(long, default_value_t = 10, env = "SSE_BROKER_REDIS_POOL_SIZE")]
    pub redis_pool_size: usize,

    /// Shared secret used to sign and verify `/token` JWTs.
    #[arg(long, env = "SSE_BROKER_JWT_SECRET")]
    pub jwt_secret: String,

    /// Default token lifetime, in seconds, for `/token` minting.
    #[arg(long, default_value_t = 86400, env = "SSE_BROKER_JWT_EXPIRE_SECS")]
    pub jwt_expire_secs: i64,

    /// Heartbeat interval for idle `/events` connections, in seconds.
    #[arg(long, default_value_t = 15, env = "SSE_BROKER_HEARTBEAT_SECS")]
    pub heartbeat_interval_secs: u64,

    /// Number of frames retained per device in the replay cache.
    #[arg(long, default_value_t = 200, env = "SSE_BROKER_FRAME_CACHE_SIZE")]
    pub device_frame_cache_size: u64,

    /// TTL, in seconds, for a device's cached frames.
    #[arg(long, default_value_t = 3600, env = "SSE_BROKER_FRAME_CACHE_EXPIRE_SECS")]
    pub device_frame_cache_expire_secs: u64,

    /// Remote instance-address resolution batch size for `/send` and `/kick`.
    #[arg(long, default_value_t = 250, env = "SSE_BROKER_RESOLVE_BATCH_SIZE")]
    pub resolve_batch_size: usize,
}

/// Subset of `BrokerConfig` that may be supplied via TOML file, read before
/// clap parses CLI/env args.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub instance_address: Option<String>,
    pub redis_addrs: Option<Vec<String>>,
    pub redis_password: Option<String>,
    pub redis_db: Option<i64>,
    pub redis_pool_size: Option<usize>,
    pub jwt_expire_secs: Option<i64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub device_frame_cache_size: Option<u64>,
    pub device_frame_cache_expire_secs: Option<u64>,
    pub resolve_batch_size: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

impl BrokerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn device_frame_cache_expire(&self) -> Duration {
        Duration::from_secs(self.device_frame_cache_expire_secs)
    }

    /// Derived from the heartbeat interval: how long a device/user record
    /// may go un-refreshed before it's considered gone.
    pub fn device_user_exist_duration(&self) -> Duration {
        self.heartbeat_interval() + Duration::from_secs(5)
    }

    pub fn resolved_instance_address(&self) -> String {
        self.instance_address.clone().unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    /// Apply file-sourced values, but only to fields the CLI/env layer left
    /// at their built-in default — per SPEC_FULL.md §6, CLI flags and env
    /// vars override the file, which overrides built-in defaults. `sourced`
    /// reports, per field name, whether clap resolved it from the command
    /// line or an environment variable (in which case the file must not
    /// touch it) versus from its own default.
    fn apply_file_defaults(&mut self, file: FileConfig, sourced: impl Fn(&str) -> bool) {
        if !sourced("host") {
            if let Some(v) = file.host {
                self.host = v;
            }
        }
        if !sourced("port") {
            if let Some(v) = file.port {
                self.port = v;
            }
        }
        if !sourced("instance_address") && file.instance_address.is_some() {
            self.instance_address = file.instance_address;
        }
        if !sourced("redis_addrs") {
            if let Some(v) = file.redis_addrs {
                self.redis_addrs = v;
            }
        }
        if !sourced("redis_password") && file.redis_password.is_some() {
            self.redis_password = file.redis_password;
        }
        if !sourced("redis_db") {
            if let Some(v) = file.redis_db {
                self.redis_db = v;
            }
        }
        if !sourced("redis_pool_size") {
            if let Some(v) = file.redis_pool_size {
                self.redis_pool_size = v;
            }
        }
        if !sourced("jwt_expire_secs") {
            if let Some(v) = file.jwt_expire_secs {
                self.jwt_expire_secs = v;
            }
        }
        if !sourced("heartbeat_interval_secs") {
            if let Some(v) = file.heartbeat_interval_secs {
                self.heartbeat_interval_secs = v;
            }
        }
        if !sourced("device_frame_cache_size") {
            if let Some(v) = file.device_frame_cache_size {
                self.device_frame_cache_size = v;
            }
        }
        if !sourced("device_frame_cache_expire_secs") {
            if let Some(v) = file.device_frame_cache_expire_secs {
                self.device_frame_cache_expire_secs = v;
            }
        }
        if !sourced("resolve_batch_size") {
            if let Some(v) = file.resolve_batch_size {
                self.resolve_batch_size = v;
            }
        }
    }

    /// Parse CLI/env args, then — if `--config`/`SSE_BROKER_CONFIG` names a
    /// TOML file — merge its values into whichever fields clap left at
    /// their built-in default. CLI flags and env vars always win over the
    /// file; the file always wins over the compiled-in defaults above.
    pub fn load() -> anyhow::Result<Self> {
        let matches = Self::command().get_matches();
        let mut config = Self::from_arg_matches(&matches)?;

        if let Some(path) = config.config.clone() {
            let file = FileConfig::load(&path)?;
            let sourced = |name: &str| {
                matches!(
                    matches.value_source(name),
                    Some(clap::parser::ValueSource::CommandLine) | Some(clap::parser::ValueSource::EnvVariable)
                )
            };
            config.apply_file_defaults(file, sourced);
        }

        Ok(config)
    }
}
