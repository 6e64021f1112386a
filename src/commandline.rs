use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show pack voltage, current, capacity, SOC, temperatures, FET state and active faults
    Status,
    /// Show individual cell voltages with min/max/spread
    Cells,
    /// Show status and cell voltages
    All,
    /// Decode a hex capture offline (one received chunk per line)
    Decode {
        /// Capture file, "-" reads from standard input
        #[arg(long, short, default_value = "-")]
        input: String,
        /// Cut frames by their length byte instead of by chunk boundaries
        #[arg(long, action)]
        length_prefixed: bool,
    },
    /// Poll the BMS continuously and keep rolling statistics
    Monitor {
        /// Output destination for records and statistics
        #[command(subcommand)]
        output: MonitorOutput,
        /// Delay between two read requests (e.g., "3s", "500ms")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "3s")]
        interval: Duration,
        /// How often the statistics are sampled into the history (e.g., "30s", "1m")
        #[clap(long, value_parser = humantime::parse_duration, default_value = "30s")]
        save_period: Duration,
        /// How far back the history reaches (e.g., "30m", "48h")
        #[clap(long, value_parser = humantime::parse_duration, default_value = "30m")]
        retention: Duration,
        /// JSON file the history is loaded from at start and written to on every save
        #[clap(long)]
        history_file: Option<String>,
        /// Empty the history file before monitoring starts
        #[clap(long, requires = "history_file")]
        clear_history: bool,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum MonitorOutput {
    /// Print records and statistics to the standard output (console).
    Console,
    /// Publish records and statistics to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "jbd bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Time to wait for a complete reply (e.g., "500ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "500ms")]
    pub timeout: Duration,
}
