use anyhow::{Context, Result};
use chrono::Utc;
use jbdbms_lib::protocol::PollCycle;
use jbdbms_lib::register::{CellVoltageRecord, StatusRecord};
use jbdbms_lib::serialport::JbdBms;
use jbdbms_lib::{Event, EventKind};
use log::{debug, error, info, warn};
use serde_json::json;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::history::{StatsCollector, Summary};
use crate::{commandline, mqtt};

pub fn format_status(status: &StatusRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Voltage:          {:.2} V", status.voltage);
    let _ = writeln!(out, "Current:          {:.2} A", status.current);
    let _ = writeln!(
        out,
        "Capacity:         {:.2} / {:.2} Ah ({} %)",
        status.balance_capacity, status.full_capacity, status.state_of_charge
    );
    let _ = writeln!(out, "Cycles:           {}", status.charge_cycles);
    match status.production_date {
        Some(date) => {
            let _ = writeln!(out, "Production date:  {date}");
        }
        None => {
            let _ = writeln!(out, "Production date:  invalid");
        }
    }
    let _ = writeln!(out, "Software version: {}", status.software_version);
    let _ = writeln!(
        out,
        "FET:              charge={} discharge={}",
        on_off(status.fet.charging),
        on_off(status.fet.discharging)
    );
    let balancing: Vec<String> = status
        .balancing
        .iter()
        .enumerate()
        .filter(|(_, active)| *active)
        .map(|(cell, _)| cell.to_string())
        .collect();
    let _ = writeln!(
        out,
        "Balancing:        {}",
        if balancing.is_empty() {
            "none".to_string()
        } else {
            balancing.join(",")
        }
    );
    let temperatures: Vec<String> = status
        .temperatures
        .iter()
        .map(|t| format!("{t:.1} °C"))
        .collect();
    let _ = writeln!(
        out,
        "Temperatures:     {} ({} sensors)",
        temperatures.join(", "),
        status.temperature_sensor_count
    );
    let faults: Vec<String> = status.faults.active().map(|f| f.to_string()).collect();
    let _ = write!(
        out,
        "Faults:           {}",
        if faults.is_empty() {
            "none".to_string()
        } else {
            faults.join(", ")
        }
    );
    out
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

pub fn format_cells(cells: &CellVoltageRecord) -> String {
    let volts: Vec<String> = cells
        .millivolts
        .iter()
        .map(|mv| format!("{:.3}", *mv as f32 / 1000.0))
        .collect();
    let mut out = format!("Cells ({}): {} V", cells.millivolts.len(), volts.join(" "));
    if let (Some(min), Some(max), Some(spread)) = (cells.min(), cells.max(), cells.spread()) {
        let _ = write!(out, "\nmin {min} mV, max {max} mV, spread {spread} mV");
    }
    out
}

fn summary_to_json(samples: &[(&'static str, Option<Summary>)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, summary) in samples {
        map.insert(name.to_string(), json!(summary));
    }
    serde_json::Value::Object(map)
}

fn publish_simple_format(publisher: &mqtt::MqttPublisher, topic: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                publish_simple_format(publisher, &format!("{topic}/{k}"), v);
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                publish_simple_format(publisher, &format!("{topic}/{i}"), v);
            }
        }
        serde_json::Value::String(s) => {
            if let Err(e) = publisher.publish(topic, s) {
                error!("Failed to publish message to topic {topic}: {e}");
            }
        }
        serde_json::Value::Number(n) => {
            if let Err(e) = publisher.publish(topic, &n.to_string()) {
                error!("Failed to publish message to topic {topic}: {e}");
            }
        }
        serde_json::Value::Bool(b) => {
            if let Err(e) = publisher.publish(topic, &b.to_string()) {
                error!("Failed to publish message to topic {topic}: {e}");
            }
        }
        serde_json::Value::Null => {}
    }
}

/// Where records and statistics go.
enum Sink {
    Console,
    Mqtt {
        publisher: mqtt::MqttPublisher,
        format: commandline::MqttFormat,
    },
}

impl Sink {
    fn open(output: &commandline::MonitorOutput) -> Result<Self> {
        match output {
            commandline::MonitorOutput::Console => Ok(Sink::Console),
            commandline::MonitorOutput::Mqtt {
                config_file,
                format,
            } => {
                let config = mqtt::MqttConfig::load(config_file).with_context(|| {
                    format!("Failed to open MQTT config file at '{config_file}'")
                })?;
                info!("Successfully loaded MQTT config from {config_file}: {config:?}");
                let publisher = mqtt::MqttPublisher::new(config)
                    .with_context(|| "Failed to create MQTT publisher")?;
                Ok(Sink::Mqtt {
                    publisher,
                    format: format.clone(),
                })
            }
        }
    }

    /// `name` is the sub-topic below the configured base topic.
    fn emit(
        &self,
        name: &str,
        console: impl FnOnce() -> String,
        value: serde_json::Value,
    ) -> Result<()> {
        match self {
            Sink::Console => {
                println!("--- {} at {} ---", name, chrono::Local::now().to_rfc3339());
                println!("{}", console());
            }
            Sink::Mqtt { publisher, format } => {
                let topic = format!("{}/{}", publisher.topic(), name);
                match format {
                    commandline::MqttFormat::Json => {
                        let mut payload = serde_json::Map::new();
                        payload.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
                        payload.insert(name.to_string(), value);
                        publisher.publish(&topic, &serde_json::to_string(&payload)?)?;
                    }
                    commandline::MqttFormat::Simple => {
                        publish_simple_format(publisher, &topic, &value)
                    }
                }
            }
        }
        Ok(())
    }
}

/// Polls status and cell voltages alternately until the process is stopped.
///
/// Failed polls are logged and the cycle moves on to the next request.
pub fn run(
    mut bms: JbdBms,
    output: commandline::MonitorOutput,
    interval: Duration,
    save_period: Duration,
    retention: Duration,
    history_file: Option<&str>,
    clear_history: bool,
) -> Result<()> {
    info!(
        "Starting monitor: output={output:?}, interval={interval:?}, save_period={save_period:?}, retention={retention:?}, history_file={history_file:?}"
    );
    let sink = Rc::new(Sink::open(&output)?);
    let mut collector = match history_file {
        Some(path) => StatsCollector::persistent(path, save_period, retention)
            .with_context(|| format!("Failed to load history from '{path}'"))?,
        None => StatsCollector::new(save_period, retention),
    };
    if clear_history {
        collector.clear_history();
    }
    let collector = Rc::new(RefCell::new(collector));

    {
        let collector = Rc::clone(&collector);
        bms.subscribe(EventKind::Status, move |event| {
            if let Event::Status(status) = event {
                collector.borrow_mut().on_status(status);
            }
            Ok(())
        });
    }
    {
        let collector = Rc::clone(&collector);
        bms.subscribe(EventKind::CellVoltages, move |event| {
            if let Event::CellVoltages(cells) = event {
                collector.borrow_mut().on_cells(cells);
            }
            Ok(())
        });
    }
    {
        let sink = Rc::clone(&sink);
        bms.subscribe(EventKind::Status, move |event| {
            if let Event::Status(status) = event {
                sink.emit("status", || format_status(status), serde_json::to_value(status)?)?;
            }
            Ok(())
        });
    }
    {
        let sink = Rc::clone(&sink);
        bms.subscribe(EventKind::CellVoltages, move |event| {
            if let Event::CellVoltages(cells) = event {
                sink.emit("cells", || format_cells(cells), serde_json::to_value(cells)?)?;
            }
            Ok(())
        });
    }
    bms.subscribe(EventKind::DecodeError, |event| {
        if let Event::DecodeError { reason, frame } = event {
            debug!("Discarded frame {:02X?}: {reason}", frame);
        }
        Ok(())
    });

    let mut last_save = Instant::now();
    for command in PollCycle::new() {
        if let Err(err) = bms.poll(command) {
            warn!("Polling {command:?} failed: {err}");
        }

        if last_save.elapsed() >= save_period {
            last_save = Instant::now();
            let samples = collector.borrow_mut().save(Utc::now());
            let kept = {
                let collector = collector.borrow();
                let history = collector.history();
                match history.timestamps().first() {
                    Some(first) => format!(
                        "{}/{} entries kept since {}",
                        history.len(),
                        history.capacity(),
                        first.to_rfc3339()
                    ),
                    None => String::from("no entries kept"),
                }
            };
            let value = summary_to_json(&samples);
            let console = || {
                let mut out = kept;
                for (name, summary) in &samples {
                    if let Some(s) = summary {
                        let _ = write!(
                            out,
                            "\n{name}: mean={} min={} max={} stdev={}",
                            s.mean, s.min, s.max, s.stdev
                        );
                    }
                }
                out
            };
            if let Err(err) = sink.emit("history", console, value) {
                error!("Cannot output history: {err}");
            }
        }
        std::thread::sleep(interval);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_show_spread() {
        let cells = CellVoltageRecord {
            millivolts: vec![3333, 3340, 3329],
        };
        assert_eq!(
            format_cells(&cells),
            "Cells (3): 3.333 3.340 3.329 V\nmin 3329 mV, max 3340 mV, spread 11 mV"
        );
    }

    #[test]
    fn empty_cells_have_no_spread() {
        let cells = CellVoltageRecord { millivolts: vec![] };
        assert_eq!(format_cells(&cells), "Cells (0):  V");
    }

    #[test]
    fn summary_json_keeps_empty_metrics() {
        let value = summary_to_json(&[
            ("soc", None),
            (
                "voltage_v",
                Some(Summary {
                    mean: 13.3,
                    min: 13.2,
                    max: 13.4,
                    stdev: 0.05,
                }),
            ),
        ]);
        assert_eq!(value["soc"], serde_json::Value::Null);
        assert_eq!(value["voltage_v"]["max"], json!(13.4));
    }
}
