use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::BridgeTiming;
use crate::cli::Cli;

/// MQTT endpoint settings
#[derive(Clone, Debug)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
}

/// TLS credential material, supplied as PEM file paths
#[derive(Clone, Debug)]
pub struct Credentials {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub root_ca: PathBuf,
}

/// Session retry and actuation timing
#[derive(Clone, Debug)]
pub struct Timing {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub auth_alarm_threshold: u32,
    pub flash_hold: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub radio_address: u8,
    pub device_prefix: String,
    pub broker: Broker,
    pub credentials: Credentials,
    pub radio_socket: PathBuf,
    pub led_path: PathBuf,
    pub bridge: BridgeTiming,
    pub timing: Timing,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            radio_address: cli.radio_address,
            device_prefix: cli.device_prefix,
            broker: Broker {
                host: cli.broker_host,
                port: cli.broker_port,
                keep_alive: cli.keep_alive,
            },
            credentials: Credentials {
                certificate: cli.certificate,
                private_key: cli.private_key,
                root_ca: cli.root_ca,
            },
            radio_socket: cli.radio_socket,
            led_path: cli.led_path,
            bridge: BridgeTiming {
                report_interval: cli.report_interval,
                idle_interval: cli.idle_interval,
                recovery_interval: cli.recovery_interval,
            },
            timing: Timing {
                min_backoff: cli.min_backoff,
                max_backoff: cli.max_backoff,
                auth_alarm_threshold: cli.auth_alarm_threshold,
                flash_hold: cli.flash_hold,
            },
        }
    }
}
