use clap::Parser;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use crate::identity;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Radio network address of this gateway (0 is the broadcast identity)
    #[arg(
        env = "BRIDGE_RADIO_ADDRESS",
        long = "radio-address",
        value_name = "addr",
        default_value_t = identity::GATEWAY_ADDRESS
    )]
    pub radio_address: u8,

    /// Topic prefix of the device-twin service
    #[arg(
        env = "BRIDGE_DEVICE_PREFIX",
        long = "device-prefix",
        value_name = "prefix",
        default_value = identity::DEFAULT_DEVICE_PREFIX
    )]
    pub device_prefix: String,

    /// Hostname of the device-twin MQTT endpoint
    #[arg(env = "BRIDGE_BROKER_HOST", long = "broker-host", value_name = "host")]
    pub broker_host: String,

    /// Port of the device-twin MQTT endpoint
    #[arg(
        env = "BRIDGE_BROKER_PORT",
        long = "broker-port",
        value_name = "port",
        default_value_t = 8883
    )]
    pub broker_port: u16,

    /// Client certificate for this gateway (PEM)
    #[arg(env = "BRIDGE_CERTIFICATE", long = "certificate", value_name = "path")]
    pub certificate: PathBuf,

    /// Private key for this gateway (PEM)
    #[arg(env = "BRIDGE_PRIVATE_KEY", long = "private-key", value_name = "path")]
    pub private_key: PathBuf,

    /// Root certificate used to authenticate the service (PEM)
    #[arg(env = "BRIDGE_ROOT_CA", long = "root-ca", value_name = "path")]
    pub root_ca: PathBuf,

    /// Unix datagram socket fed by the radio driver
    #[arg(
        env = "BRIDGE_RADIO_SOCKET",
        long = "radio-socket",
        value_name = "path",
        default_value = "/run/lora/bridge.sock"
    )]
    pub radio_socket: PathBuf,

    /// Sysfs brightness path of the LED actuator
    #[arg(
        env = "BRIDGE_LED_PATH",
        long = "led-path",
        value_name = "path",
        default_value = "/sys/class/leds/led0/brightness"
    )]
    pub led_path: PathBuf,

    /// Keep-alive interval for the MQTT session in milliseconds
    #[arg(
        env = "BRIDGE_KEEP_ALIVE_MS",
        long = "keep-alive-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "60000"
    )]
    pub keep_alive: Duration,

    /// Wait between sensor reports in milliseconds
    #[arg(
        env = "BRIDGE_REPORT_INTERVAL_MS",
        long = "report-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "30000"
    )]
    pub report_interval: Duration,

    /// Wait while disconnected or when no message is available, in milliseconds
    #[arg(
        env = "BRIDGE_IDLE_INTERVAL_MS",
        long = "idle-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "1000"
    )]
    pub idle_interval: Duration,

    /// Wait after a bridge error before resuming, in milliseconds
    #[arg(
        env = "BRIDGE_RECOVERY_INTERVAL_MS",
        long = "recovery-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "10000"
    )]
    pub recovery_interval: Duration,

    /// Hold time for each half of an LED flash, in milliseconds
    #[arg(
        env = "BRIDGE_FLASH_HOLD_MS",
        long = "flash-hold-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "1000"
    )]
    pub flash_hold: Duration,

    /// Minimum reconnection backoff in milliseconds
    #[arg(
        env = "BRIDGE_MIN_BACKOFF_MS",
        long = "min-backoff-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "1000"
    )]
    pub min_backoff: Duration,

    /// Maximum reconnection backoff in milliseconds
    #[arg(
        env = "BRIDGE_MAX_BACKOFF_MS",
        long = "max-backoff-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "300000"
    )]
    pub max_backoff: Duration,

    /// Consecutive authentication refusals before an operator alarm is logged
    #[arg(
        env = "BRIDGE_AUTH_ALARM_THRESHOLD",
        long = "auth-alarm-threshold",
        value_name = "count",
        default_value_t = 5
    )]
    pub auth_alarm_threshold: u32,
}

pub fn parse() -> Cli {
    Parser::parse()
}
