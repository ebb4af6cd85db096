//! Daily CSV files of grid meter samples
//!
//! One file per local day, `{dir}/YYYY-MM-DD_fronius.csv`. Every field is
//! quoted and decimal points are written as commas so spreadsheets in a
//! German locale read the numbers directly.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::{QuoteStyle, WriterBuilder};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::devices::GridMeterSample;
use crate::error::Result;

/// Consumer of grid meter samples
pub trait MeterSampleSink: Send + Sync {
    fn append(&self, sample: &GridMeterSample) -> Result<()>;
}

pub const CSV_HEADER: [&str; 12] = [
    "Time",
    "E-in/kWh",
    "E-out/kWh",
    "f/Hz",
    "P/W",
    "Q/var",
    "S/VA",
    "Q-in/kvarh",
    "Q-out/kvarh",
    "P1/W",
    "P2/W",
    "P3/W",
];

/// Field values of one CSV row
pub fn format_row(sample: &GridMeterSample) -> [String; 12] {
    let row = [
        sample.timestamp.format("%H:%M:%S").to_string(),
        format!("{:8.3}", sample.active_energy / 1000.0),
        format!("{:8.3}", sample.active_feed_energy / 1000.0),
        format!("{:4.1}", sample.frequency),
        format!("{:7.2}", sample.active_power),
        format!("{:6.2}", sample.reactive_power),
        format!("{:7.2}", sample.apparent_power),
        format!("{:8.3}", sample.reactive_energy / 1000.0),
        format!("{:8.3}", sample.reactive_feed_energy / 1000.0),
        format!("{:8.2}", sample.active_power_l1),
        format!("{:8.2}", sample.active_power_l2),
        format!("{:8.2}", sample.active_power_l3),
    ];
    row.map(|field| field.replace('.', ","))
}

struct OpenFile {
    date: NaiveDate,
    path: PathBuf,
    writer: csv::Writer<File>,
}

/// Appends samples to the file of the sample's local date
pub struct DailyCsvWriter {
    dir: PathBuf,
    current: Mutex<Option<OpenFile>>,
}

impl DailyCsvWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}_fronius.csv", date.format("%Y-%m-%d")))
    }

    fn open(&self, date: NaiveDate) -> Result<OpenFile> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path(date);
        let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Always)
            .from_writer(file);
        if is_new {
            writer.write_record(CSV_HEADER)?;
            writer.flush()?;
            info!("Grid meter CSV file created: {}", path.display());
        }
        Ok(OpenFile { date, path, writer })
    }
}

impl MeterSampleSink for DailyCsvWriter {
    fn append(&self, sample: &GridMeterSample) -> Result<()> {
        let date = sample.timestamp.date_naive();
        let mut current = self.current.lock();

        // Roll on date change or when the file was removed underneath us
        let reopen = match current.as_ref() {
            Some(open) => open.date != date || !open.path.exists(),
            None => true,
        };
        if reopen {
            *current = Some(self.open(date)?);
        }

        if let Some(open) = current.as_mut() {
            open.writer.write_record(format_row(sample))?;
            open.writer.flush()?;
            debug!("Grid meter sample appended to {}", open.path.display());
        }
        Ok(())
    }
}
