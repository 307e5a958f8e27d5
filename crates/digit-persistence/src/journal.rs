//! JSON Lines journal of operation records.
//!
//! One file per UTC day, `operations-YYYY-MM-DD.jsonl`, opened in append
//! mode. Each record is one line and is flushed as soon as it is written.

use crate::error::PersistenceResult;
use crate::OperationSink;
use chrono::NaiveDate;
use digit_core::Operation;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

struct ActiveFile {
    writer: BufWriter<File>,
    date: NaiveDate,
    records_written: usize,
}

pub struct JsonlJournal {
    dir: PathBuf,
    active: Mutex<Option<ActiveFile>>,
}

impl JsonlJournal {
    pub fn new(dir: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            active: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("operations-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append `record` to the file of its timestamp's day.
    pub fn append(&self, record: &Operation) -> PersistenceResult<()> {
        let line = serde_json::to_string(record)?;
        let date = record.timestamp.date_naive();

        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|f| f.date != date) {
            if let Some(mut previous) = active.take() {
                if let Err(e) = previous.writer.flush() {
                    warn!(?e, "Failed to flush journal on rotation");
                }
                info!(
                    date = %previous.date,
                    records = previous.records_written,
                    "Closed operation journal"
                );
            }
        }
        if active.is_none() {
            let path = self.path_for(date);
            info!(path = %path.display(), "Opening operation journal (append mode)");
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            *active = Some(ActiveFile {
                writer: BufWriter::new(file),
                date,
                records_written: 0,
            });
        }

        if let Some(file) = active.as_mut() {
            writeln!(file.writer, "{line}")?;
            file.writer.flush()?;
            file.records_written += 1;
        }
        Ok(())
    }

    /// Records journaled for `date`. Malformed lines are skipped.
    pub fn read_day(&self, date: NaiveDate) -> PersistenceResult<Vec<Operation>> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), line = index + 1, ?e, "Skipping malformed journal line"),
            }
        }
        Ok(records)
    }
}

impl OperationSink for JsonlJournal {
    fn persist<'a>(&'a self, record: &'a Operation) -> BoxFuture<'a, PersistenceResult<()>> {
        Box::pin(async move { self.append(record) })
    }
}
