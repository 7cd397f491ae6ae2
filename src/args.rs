// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::time::Duration;

use clap::Parser;
use colabscan::{
    scanner::{AccessLevel, ScannerConfig},
    telegram::DEFAULT_PORT,
};
use serde_json::json;
use tracing::level_filters::LevelFilter;
use zenoh::config::{Config, WhatAmI};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host name or IP address of the laser scanner.
    #[arg(long, env, default_value = "192.168.0.1")]
    pub target: String,

    /// CoLa-B TCP port of the laser scanner.
    #[arg(long, env, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Access level used for the login handshake.
    #[arg(long, env, value_enum, default_value = "authorized-client")]
    pub access_level: AccessLevel,

    /// Timeout in milliseconds for the login handshake.
    #[arg(long, env, default_value = "1000")]
    pub login_timeout: u64,

    /// Timeout in milliseconds for a scan data read.  Must cover a full scan.
    #[arg(long, env, default_value = "5000")]
    pub scan_timeout: u64,

    /// Scan poll rate in Hz.
    #[arg(long, env, default_value = "25")]
    pub rate: f64,

    /// lidar frame transform vector from base_link
    #[arg(
        long,
        env,
        default_value = "0 0 0",
        value_delimiter = ' ',
        num_args = 3
    )]
    pub lidar_tf_vec: Vec<f64>,

    /// lidar frame transform quaternion from base_link
    #[arg(
        long,
        env,
        default_value = "0 0 0 1",
        value_delimiter = ' ',
        num_args = 4
    )]
    pub lidar_tf_quat: Vec<f64>,

    /// The name of the base frame
    #[arg(long, env, default_value = "base_link")]
    pub base_frame_id: String,

    /// The name of the lidar frame
    #[arg(long, env, default_value = "lidar")]
    pub lidar_frame_id: String,

    /// lidar points topic name
    #[arg(long, default_value = "rt/lidar/points")]
    pub points_topic: String,

    /// Application log level
    #[arg(long, env, default_value = "info")]
    pub rust_log: LevelFilter,

    /// Enable Tracy profiler broadcast
    #[arg(long, env)]
    pub tracy: bool,

    /// zenoh connection mode
    #[arg(long, env, default_value = "peer")]
    mode: WhatAmI,

    /// connect to zenoh endpoints
    #[arg(long, env)]
    connect: Vec<String>,

    /// listen to zenoh endpoints
    #[arg(long, env)]
    listen: Vec<String>,

    /// disable zenoh multicast scouting
    #[arg(long, env)]
    no_multicast_scouting: bool,
}

impl Args {
    /// Interval between scan polls.
    pub fn poll_interval(&self) -> Duration {
        if self.rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.rate)
        } else {
            Duration::ZERO
        }
    }
}

impl From<&Args> for ScannerConfig {
    fn from(args: &Args) -> Self {
        ScannerConfig {
            access_level: args.access_level,
            login_timeout: Duration::from_millis(args.login_timeout),
            scan_timeout: Duration::from_millis(args.scan_timeout),
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let mut config = Config::default();

        config
            .insert_json5("mode", &json!(args.mode).to_string())
            .unwrap();

        if !args.connect.is_empty() {
            config
                .insert_json5("connect/endpoints", &json!(args.connect).to_string())
                .unwrap();
        }

        if !args.listen.is_empty() {
            config
                .insert_json5("listen/endpoints", &json!(args.listen).to_string())
                .unwrap();
        }

        if args.no_multicast_scouting {
            config
                .insert_json5("scouting/multicast/enabled", &json!(false).to_string())
                .unwrap();
        }

        config
            .insert_json5("scouting/multicast/interface", &json!("lo").to_string())
            .unwrap();

        config
    }
}
