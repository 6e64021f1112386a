use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jbdbms_lib::register::{CellVoltageRecord, StatusRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Statistics of one metric over one save period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stdev: f64,
}

fn round_to(value: f64, precision: u8) -> f64 {
    let scale = 10f64.powi(precision as i32);
    (value * scale).round() / scale
}

/// Collects the readings of one quantity between two samples.
#[derive(Debug, Clone)]
pub struct Metric {
    name: &'static str,
    precision: u8,
    values: Vec<f64>,
}

impl Metric {
    pub fn new(name: &'static str, precision: u8) -> Self {
        Self {
            name,
            precision,
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn update(&mut self, value: f64) {
        if !value.is_nan() {
            self.values.push(value);
        }
    }

    /// Drains the collected readings into a summary, `None` if there were none.
    ///
    /// Mean, min and max are rounded to the metric precision, the population
    /// standard deviation to two more digits.
    pub fn sample(&mut self) -> Option<Summary> {
        if self.values.is_empty() {
            return None;
        }
        let values = std::mem::take(&mut self.values);
        let count = values.len() as f64;
        let mean = values.iter().sum::<f64>() / count;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count;
        Some(Summary {
            mean: round_to(mean, self.precision),
            min: round_to(min, self.precision),
            max: round_to(max, self.precision),
            stdev: round_to(variance.sqrt(), self.precision + 2),
        })
    }
}

/// History of metric summaries, one entry per save period.
///
/// Stored as JSON with one array of timestamps and one array per metric, all
/// of the same length. The capacity is not stored; it follows from the
/// settings of the process that loads the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    #[serde(skip)]
    capacity: usize,
    timestamps: Vec<DateTime<Utc>>,
    metrics: BTreeMap<String, Vec<Option<Summary>>>,
}

fn capacity_for(save_period: Duration, retention: Duration) -> usize {
    if save_period.is_zero() {
        1
    } else {
        (retention.as_millis() / save_period.as_millis()).max(1) as usize
    }
}

impl TimeSeries {
    /// Keeps as many entries as fit into `retention` at one entry per `save_period`.
    pub fn new(save_period: Duration, retention: Duration) -> Self {
        Self {
            capacity: capacity_for(save_period, retention),
            timestamps: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Reads a history written by [`TimeSeries::store`].
    ///
    /// A missing file gives an empty history. Entries beyond the capacity of
    /// the current settings are dropped, oldest first.
    pub fn load(path: &str, save_period: Duration, retention: Duration) -> Result<Self> {
        if !std::path::Path::new(path).exists() {
            log::info!("No history file at {path:?}, starting empty");
            return Ok(Self::new(save_period, retention));
        }
        log::debug!("Loading history from {path:?}");
        let file = std::fs::File::open(path)
            .with_context(|| format!("Cannot open history file {path:?}"))?;
        let mut series: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Cannot read history from file: {path:?}"))?;
        series.capacity = capacity_for(save_period, retention);
        let len = series.timestamps.len();
        for values in series.metrics.values_mut() {
            values.resize(len, None);
        }
        series.truncate();
        Ok(series)
    }

    pub fn store(&self, path: &str) -> Result<()> {
        let json = serde_json::to_vec(self).context("Cannot serialize history")?;
        std::fs::write(path, json).with_context(|| format!("Cannot write history file {path:?}"))
    }

    pub fn clear(&mut self) {
        self.timestamps.clear();
        self.metrics.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    /// Appends one entry; a metric seen for the first time is back-filled with `None`.
    pub fn push(&mut self, at: DateTime<Utc>, samples: &[(&'static str, Option<Summary>)]) {
        let previous = self.timestamps.len();
        for (name, summary) in samples {
            let series = self
                .metrics
                .entry(name.to_string())
                .or_insert_with(|| vec![None; previous]);
            series.push(*summary);
        }
        self.timestamps.push(at);
        for series in self.metrics.values_mut() {
            series.resize(self.timestamps.len(), None);
        }
        self.truncate();
    }

    fn truncate(&mut self) {
        if self.timestamps.len() > self.capacity {
            let excess = self.timestamps.len() - self.capacity;
            self.timestamps.drain(..excess);
            for series in self.metrics.values_mut() {
                series.drain(..excess);
            }
            log::trace!("History truncated to {} entries", self.capacity);
        }
    }
}

/// Feeds decoded records into the monitored metrics and samples them periodically.
#[derive(Debug)]
pub struct StatsCollector {
    voltage: Metric,
    current: Metric,
    state_of_charge: Metric,
    full_capacity: Metric,
    temperatures: [Metric; 3],
    cells: [Metric; 4],
    series: TimeSeries,
    history_file: Option<String>,
}

impl StatsCollector {
    pub fn new(save_period: Duration, retention: Duration) -> Self {
        Self::with_series(TimeSeries::new(save_period, retention), None)
    }

    /// Continues the history stored in `history_file` and rewrites it on every save.
    pub fn persistent(
        history_file: &str,
        save_period: Duration,
        retention: Duration,
    ) -> Result<Self> {
        let series = TimeSeries::load(history_file, save_period, retention)?;
        log::info!("Loaded {} history entries from {history_file:?}", series.len());
        Ok(Self::with_series(series, Some(history_file.to_string())))
    }

    fn with_series(series: TimeSeries, history_file: Option<String>) -> Self {
        Self {
            voltage: Metric::new("voltage_v", 2),
            current: Metric::new("current_a", 1),
            state_of_charge: Metric::new("soc", 0),
            full_capacity: Metric::new("full_capacity_ah", 0),
            temperatures: [
                Metric::new("board_temp_c", 1),
                Metric::new("cell0_c", 1),
                Metric::new("cell1_c", 1),
            ],
            cells: [
                Metric::new("cell0_v", 3),
                Metric::new("cell1_v", 3),
                Metric::new("cell2_v", 3),
                Metric::new("cell3_v", 3),
            ],
            series,
            history_file,
        }
    }

    pub fn on_status(&mut self, status: &StatusRecord) {
        self.voltage.update(status.voltage as f64);
        self.current.update(status.current as f64);
        self.state_of_charge.update(status.state_of_charge as f64);
        self.full_capacity.update(status.full_capacity as f64);
        for (metric, value) in self.temperatures.iter_mut().zip(&status.temperatures) {
            metric.update(*value as f64);
        }
    }

    pub fn on_cells(&mut self, cells: &CellVoltageRecord) {
        for (metric, mv) in self.cells.iter_mut().zip(&cells.millivolts) {
            metric.update(*mv as f64 / 1000.0);
        }
    }

    /// Samples every metric, appends the result to the history and returns it.
    pub fn save(&mut self, at: DateTime<Utc>) -> Vec<(&'static str, Option<Summary>)> {
        let samples: Vec<_> = self
            .metrics_mut()
            .map(|metric| (metric.name(), metric.sample()))
            .collect();
        self.series.push(at, &samples);
        self.store();
        samples
    }

    pub fn history(&self) -> &TimeSeries {
        &self.series
    }

    /// Forgets every stored entry; collected readings are kept.
    pub fn clear_history(&mut self) {
        log::info!("Clearing {} history entries", self.series.len());
        self.series.clear();
        self.store();
    }

    fn store(&self) {
        if let Some(path) = &self.history_file {
            if let Err(err) = self.series.store(path) {
                log::warn!("Cannot store history: {err:#}");
            }
        }
    }

    fn metrics_mut(&mut self) -> impl Iterator<Item = &mut Metric> {
        [
            &mut self.voltage,
            &mut self.current,
            &mut self.state_of_charge,
            &mut self.full_capacity,
        ]
        .into_iter()
        .chain(self.temperatures.iter_mut())
        .chain(self.cells.iter_mut())
    }
}
