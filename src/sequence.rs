//! Sequence tables: the declarative description of a fluidic protocol.
//!
//! A protocol is an ordered list of [`SequenceRow`]s loaded from a delimited text file.
//! Rows whose `include` flag is not set are never executed and never counted toward
//! progress. One canonical table can be replayed once per experimental round against a
//! different physical reagent via [`RoundMapping`] and [`SequenceTable::apply_round`].
//!
//! # File format
//!
//! ```text
//! sequence_name,fluidic_port,volume_ul,flow_rate_ul_per_s,duration_s,include
//! Flow Probe,5,500,10,,1
//! Wash,30,1000,20,,1
//! Image,0,,,,0
//! ```
//!
//! Aliases accepted for older protocol files: `volume`, `flow_rate`, `incubation_time_s`.
//! Optional columns: `repeat`, `fill_tubing_with`, `temperature_c`.

use crate::error::{AppResult, FluidicsError};
use serde::{Deserialize, Deserializer, Serialize};
use std::io::Read;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Operation name whose port is rewritten on every round.
pub const FLOW_PROBE: &str = "Flow Probe";

/// One protocol step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRow {
    /// Operation identifier (e.g. "Flow Probe", "Wash", "Incubate")
    pub sequence_name: String,
    /// Logical fluidic port (1..N)
    pub fluidic_port: u32,
    /// Volume in microliters (0 when not applicable)
    pub volume_ul: f64,
    /// Flow rate in microliters per second (0 when not applicable)
    pub flow_rate_ul_per_s: f64,
    /// Hold/incubation time in seconds (0 when not given)
    pub duration_s: f64,
    /// Number of times the operation is executed within this row
    pub repeat: u32,
    /// Port used to chase reagent out of the shared tubing after a flow
    pub fill_tubing_with: Option<u32>,
    /// Temperature setpoint for thermal operations
    pub temperature_c: Option<f64>,
    /// Row takes part in the run
    pub include: bool,
}

impl SequenceRow {
    /// Create an included row with no volume, rate or duration.
    pub fn new(sequence_name: impl Into<String>, fluidic_port: u32) -> Self {
        Self {
            sequence_name: sequence_name.into(),
            fluidic_port,
            volume_ul: 0.0,
            flow_rate_ul_per_s: 0.0,
            duration_s: 0.0,
            repeat: 1,
            fill_tubing_with: None,
            temperature_c: None,
            include: true,
        }
    }

    /// Set volume and flow rate.
    pub fn with_flow(mut self, volume_ul: f64, flow_rate_ul_per_s: f64) -> Self {
        self.volume_ul = volume_ul;
        self.flow_rate_ul_per_s = flow_rate_ul_per_s;
        self
    }

    /// Set the hold duration.
    pub fn with_duration(mut self, duration_s: f64) -> Self {
        self.duration_s = duration_s;
        self
    }

    /// Set the repeat count.
    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    /// Set the tubing chase port.
    pub fn with_fill_tubing(mut self, port: u32) -> Self {
        self.fill_tubing_with = Some(port);
        self
    }

    /// Set the temperature setpoint.
    pub fn with_temperature(mut self, temperature_c: f64) -> Self {
        self.temperature_c = Some(temperature_c);
        self
    }

    /// Set the include flag.
    pub fn with_include(mut self, include: bool) -> Self {
        self.include = include;
        self
    }

    /// Nominal execution time in seconds.
    ///
    /// `duration_s` when given, otherwise `volume_ul / flow_rate_ul_per_s`, multiplied by
    /// the repeat count.
    pub fn nominal_duration_s(&self) -> f64 {
        let single = if self.duration_s > 0.0 {
            self.duration_s
        } else if self.volume_ul > 0.0 && self.flow_rate_ul_per_s > 0.0 {
            self.volume_ul / self.flow_rate_ul_per_s
        } else {
            0.0
        };
        single * f64::from(self.repeat.max(1))
    }
}

/// Contiguous half-open range `[start, end)` over the active (included) rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSection {
    /// First active row to run
    pub start: usize,
    /// One past the last active row to run
    pub end: usize,
}

impl RunSection {
    /// Create a section.
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Resolve against a table length, clamping both bounds.
    ///
    /// Out-of-range bounds shrink the section rather than failing, so a section past the
    /// end of the table selects nothing.
    pub fn clamp_to(&self, len: usize) -> Range<usize> {
        let end = self.end.min(len);
        let start = self.start.min(end);
        start..end
    }
}

impl FromStr for RunSection {
    type Err = FluidicsError;

    /// Parse `start:end`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s.split_once(':').ok_or_else(|| {
            FluidicsError::Configuration(format!("Section '{}' must be written start:end", s))
        })?;
        let parse = |value: &str| {
            value.trim().parse::<usize>().map_err(|e| {
                FluidicsError::Configuration(format!("Invalid section bound '{}': {}", value, e))
            })
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }
}

/// Per-round reagent ports supplied through `set_rounds`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMapping {
    /// Port for each round, in round order
    pub port_list: Vec<u32>,
}

impl RoundMapping {
    /// Create a mapping from a port list.
    pub fn new(port_list: Vec<u32>) -> Self {
        Self { port_list }
    }

    /// Port for round `index`.
    pub fn port_for(&self, index: usize) -> AppResult<u32> {
        self.port_list
            .get(index)
            .copied()
            .ok_or(FluidicsError::RoundIndexOutOfRange {
                index,
                len: self.port_list.len(),
            })
    }

    /// Number of rounds.
    pub fn len(&self) -> usize {
        self.port_list.len()
    }

    /// True when no rounds are configured.
    pub fn is_empty(&self) -> bool {
        self.port_list.is_empty()
    }
}

/// Ordered protocol table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceTable {
    rows: Vec<SequenceRow>,
    /// Ports as loaded; round remapping decides eligibility from these
    original_ports: Vec<u32>,
}

impl SequenceTable {
    /// Create a table from rows.
    pub fn new(rows: Vec<SequenceRow>) -> Self {
        let original_ports = rows.iter().map(|row| row.fluidic_port).collect();
        Self {
            rows,
            original_ports,
        }
    }

    /// Load a table from a CSV file.
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            FluidicsError::SequenceTable(format!(
                "Cannot open sequence file {}: {}",
                path.display(),
                e
            ))
        })?;
        let table = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            rows = table.len(),
            active = table.active_len(),
            "Loaded sequence table"
        );
        Ok(table)
    }

    /// Load a table from any CSV reader.
    pub fn from_reader<R: Read>(reader: R) -> AppResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut rows = Vec::new();
        for (index, record) in csv_reader.deserialize::<SequenceRecord>().enumerate() {
            let record = record.map_err(|e| record_error(index, e))?;
            rows.push(record.into_row(index)?);
        }
        Ok(Self::new(rows))
    }

    /// All rows, including excluded ones.
    pub fn rows(&self) -> &[SequenceRow] {
        &self.rows
    }

    /// Total number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of included rows.
    pub fn active_len(&self) -> usize {
        self.rows.iter().filter(|row| row.include).count()
    }

    /// Included rows, optionally restricted to a section of the included rows.
    pub fn active_rows(&self, section: Option<RunSection>) -> Vec<SequenceRow> {
        let active: Vec<SequenceRow> = self.rows.iter().filter(|row| row.include).cloned().collect();
        match section {
            Some(section) => {
                let range = section.clamp_to(active.len());
                active[range].to_vec()
            }
            None => active,
        }
    }

    /// Point every round-addressable "Flow Probe" row at `port`.
    ///
    /// A row is round-addressable when its port as loaded is at most `round_port_max`;
    /// rows above it (fixed reagents, buffers, waste) are never touched. Returns the
    /// number of rows rewritten.
    pub fn apply_round(&mut self, port: u32, round_port_max: u32) -> usize {
        let mut rewritten = 0;
        for (row, original) in self.rows.iter_mut().zip(&self.original_ports) {
            if row.sequence_name == FLOW_PROBE && *original <= round_port_max {
                row.fluidic_port = port;
                rewritten += 1;
            }
        }
        debug!(port, rewritten, "Applied round port");
        rewritten
    }
}

/// Cell-level failures name the row; anything else (I/O, ragged rows) stays a CSV error.
fn record_error(index: usize, error: csv::Error) -> FluidicsError {
    let message = match error.kind() {
        csv::ErrorKind::Deserialize { err, .. } => Some(format!("Row {}: {}", index, err)),
        _ => None,
    };
    match message {
        Some(message) => FluidicsError::SequenceTable(message),
        None => FluidicsError::from(error),
    }
}

/// Raw CSV record; empty numeric cells deserialize to `None`, malformed ones fail.
#[derive(Debug, Deserialize)]
struct SequenceRecord {
    sequence_name: String,
    #[serde(default, deserialize_with = "deserialize_number")]
    fluidic_port: Option<u32>,
    #[serde(default, alias = "volume", deserialize_with = "deserialize_number")]
    volume_ul: Option<f64>,
    #[serde(default, alias = "flow_rate", deserialize_with = "deserialize_number")]
    flow_rate_ul_per_s: Option<f64>,
    #[serde(
        default,
        alias = "incubation_time_s",
        deserialize_with = "deserialize_number"
    )]
    duration_s: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_number")]
    repeat: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_number")]
    fill_tubing_with: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_number")]
    temperature_c: Option<f64>,
    #[serde(deserialize_with = "deserialize_include")]
    include: bool,
}

impl SequenceRecord {
    fn into_row(self, index: usize) -> AppResult<SequenceRow> {
        let name = self.sequence_name.trim().to_string();
        if name.is_empty() {
            return Err(FluidicsError::SequenceTable(format!(
                "Row {}: sequence_name is empty",
                index
            )));
        }

        let non_negative = |field: &str, value: Option<f64>| -> AppResult<f64> {
            match value {
                Some(v) if !v.is_finite() || v < 0.0 => Err(FluidicsError::SequenceTable(format!(
                    "Row {} ({}): {} must be a non-negative number, got {}",
                    index, name, field, v
                ))),
                Some(v) => Ok(v),
                None => Ok(0.0),
            }
        };

        Ok(SequenceRow {
            fluidic_port: self.fluidic_port.unwrap_or(0),
            volume_ul: non_negative("volume_ul", self.volume_ul)?,
            flow_rate_ul_per_s: non_negative("flow_rate_ul_per_s", self.flow_rate_ul_per_s)?,
            duration_s: non_negative("duration_s", self.duration_s)?,
            repeat: self.repeat.unwrap_or(1).max(1),
            fill_tubing_with: self.fill_tubing_with.filter(|port| *port > 0),
            temperature_c: self.temperature_c,
            include: self.include,
            sequence_name: name,
        })
    }
}

/// Empty cell is `None`; anything else must parse.
fn deserialize_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = String::deserialize(deserializer)?;
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value.parse::<T>().map(Some).map_err(|e| {
        serde::de::Error::custom(format!("invalid number '{}': {}", value, e))
    })
}

/// `include` accepts 1/0, 1.0/0.0 and true/false; anything other than "one" excludes.
fn deserialize_include<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let value = raw.trim();
    if value.is_empty() {
        return Ok(false);
    }
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") {
        return Ok(true);
    }
    if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") {
        return Ok(false);
    }
    value
        .parse::<f64>()
        .map(|number| number == 1.0)
        .map_err(|_| serde::de::Error::custom(format!("invalid include flag '{}'", value)))
}
