//! Summary sinks
//!
//! Each sink appends JSON lines to `<dir>/events.jsonl`. Sinks are opened
//! together through a [`SummaryScope`], which closes them in reverse order
//! when it is released or dropped.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use runtime_core::{Error, Result, Step};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// File name of every sink
pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Serialize)]
struct SummaryRecord<'a> {
    step: Step,
    wall_time: DateTime<Utc>,
    tag: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

/// Append-only JSON-lines sink
pub struct SummaryWriter {
    dir: PathBuf,
    file: Mutex<Option<BufWriter<File>>>,
}

/// Shared handle to a sink, lent to programs at setup
pub type SummaryHandle = Arc<SummaryWriter>;

impl SummaryWriter {
    /// Open (or append to) the sink in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        debug!(dir = %dir.display(), "Summary writer opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            file: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// A sink that drops every record, used on non-primary processes
    pub fn disabled(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    pub fn write_scalar(&self, step: Step, tag: &str, value: f64) -> Result<()> {
        self.append(&SummaryRecord {
            step,
            wall_time: Utc::now(),
            tag,
            value: Some(value),
            text: None,
        })
    }

    pub fn write_scalars(&self, step: Step, scalars: &BTreeMap<String, f64>) -> Result<()> {
        for (tag, value) in scalars {
            self.write_scalar(step, tag, *value)?;
        }
        Ok(())
    }

    pub fn write_text(&self, step: Step, tag: &str, text: &str) -> Result<()> {
        self.append(&SummaryRecord {
            step,
            wall_time: Utc::now(),
            tag,
            value: None,
            text: Some(text),
        })
    }

    /// Flush and close; later writes are dropped
    pub fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().take() {
            file.flush()?;
        }
        Ok(())
    }

    fn append(&self, record: &SummaryRecord<'_>) -> Result<()> {
        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Summary directory names under `summaries/` for a run
pub fn summary_dir_names(eval_inputs: &[&str], decode_inputs: &[&str]) -> Vec<String> {
    let mut names = vec!["train".to_string(), "eval_train".to_string()];
    names.extend(eval_inputs.iter().map(|name| format!("eval_test_{name}")));
    names.extend(decode_inputs.iter().map(|name| format!("decode_test_{name}")));
    names
}

/// Sinks acquired together and released together.
///
/// Each scope owns its own list; release runs in reverse acquisition order.
pub struct SummaryScope {
    base_dir: PathBuf,
    enabled: bool,
    acquired: Vec<(String, SummaryHandle)>,
}

impl SummaryScope {
    /// `enabled` is false on processes that must not write summaries
    pub fn new(base_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            base_dir: base_dir.into(),
            enabled,
            acquired: Vec::new(),
        }
    }

    /// Open the sink `base_dir/<name>`
    pub fn acquire(&mut self, name: &str) -> Result<SummaryHandle> {
        if self.get(name).is_some() {
            return Err(Error::Internal {
                message: format!("summary sink {name} acquired twice"),
            });
        }
        let dir = self.base_dir.join(name);
        let writer = if self.enabled {
            SummaryWriter::open(&dir)?
        } else {
            SummaryWriter::disabled(&dir)
        };
        let handle = Arc::new(writer);
        self.acquired.push((name.to_string(), handle.clone()));
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<SummaryHandle> {
        self.acquired
            .iter()
            .find(|(acquired, _)| acquired == name)
            .map(|(_, handle)| handle.clone())
    }

    pub fn len(&self) -> usize {
        self.acquired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty()
    }

    /// Close every sink, newest first, reporting the first failure
    pub fn release(mut self) -> Result<()> {
        let (_, first_error) = self.release_all();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release_all(&mut self) -> (Vec<String>, Option<Error>) {
        let mut order = Vec::with_capacity(self.acquired.len());
        let mut first_error = None;
        while let Some((name, handle)) = self.acquired.pop() {
            if let Err(e) = handle.close() {
                warn!(sink = %name, error = %e, "Failed to close summary sink");
                first_error.get_or_insert(e);
            }
            order.push(name);
        }
        (order, first_error)
    }
}

impl Drop for SummaryScope {
    fn drop(&mut self) {
        let (released, _) = self.release_all();
        if !released.is_empty() {
            debug!(?released, "Summary sinks released");
        }
    }
}
