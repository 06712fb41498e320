//! Experiment tracking.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Named scalar metrics for one logging call.
pub type Metrics = BTreeMap<String, f64>;

/// Identity and configuration of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    /// Project the run belongs to.
    pub project: String,
    /// Unique run identifier.
    pub run_id: String,
    /// Full run configuration.
    pub config: serde_json::Value,
}

impl RunInfo {
    /// Use `run_name` when given, otherwise a UTC timestamp.
    pub fn new(project: &str, run_name: Option<&str>, config: serde_json::Value) -> Self {
        let run_id = run_name.map_or_else(
            || Utc::now().format("run-%Y%m%d-%H%M%S").to_string(),
            str::to_string,
        );
        Self {
            project: project.to_string(),
            run_id,
            config,
        }
    }
}

/// Sink for training metrics.
pub trait Tracker {
    /// Start a run.
    fn init(&mut self, run: &RunInfo) -> Result<()>;

    /// Record metrics at a global step.
    fn log(&mut self, step: usize, metrics: &Metrics) -> Result<()>;

    /// Flush and close the run.
    fn finish(&mut self) -> Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Record<'a> {
    Init {
        timestamp: DateTime<Utc>,
        run: &'a RunInfo,
    },
    Metrics {
        timestamp: DateTime<Utc>,
        step: usize,
        metrics: &'a Metrics,
    },
    Finish {
        timestamp: DateTime<Utc>,
    },
}

/// Appends one JSON object per line to `<save_dir>/<project>/<run_id>.jsonl`.
#[derive(Debug)]
pub struct JsonlTracker {
    save_dir: PathBuf,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

fn tracking_err(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Tracking(format!("{context}: {err}"))
}

impl JsonlTracker {
    /// Tracker writing under `save_dir`.
    pub fn new<P: AsRef<Path>>(save_dir: P) -> Self {
        Self {
            save_dir: save_dir.as_ref().to_path_buf(),
            path: None,
            writer: None,
        }
    }

    /// File of the active (or last) run.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write(&mut self, record: &Record<'_>) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Tracking("tracker used before init".to_string()))?;
        serde_json::to_writer(&mut *writer, record).map_err(|e| tracking_err("encode", e))?;
        writer
            .write_all(b"\n")
            .map_err(|e| tracking_err("write", e))
    }
}

impl Tracker for JsonlTracker {
    fn init(&mut self, run: &RunInfo) -> Result<()> {
        let dir = self.save_dir.join(&run.project);
        std::fs::create_dir_all(&dir).map_err(|e| tracking_err("create run dir", e))?;
        let path = dir.join(format!("{}.jsonl", run.run_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| tracking_err("open run file", e))?;

        self.writer = Some(BufWriter::new(file));
        self.path = Some(path);
        self.write(&Record::Init {
            timestamp: Utc::now(),
            run,
        })
    }

    fn log(&mut self, step: usize, metrics: &Metrics) -> Result<()> {
        self.write(&Record::Metrics {
            timestamp: Utc::now(),
            step,
            metrics,
        })
    }

    fn finish(&mut self) -> Result<()> {
        self.write(&Record::Finish {
            timestamp: Utc::now(),
        })?;
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| tracking_err("flush", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_jsonl_lifecycle() {
        let dir = tempdir().unwrap();
        let mut tracker = JsonlTracker::new(dir.path());
        let run = RunInfo::new("brats", Some("run-a"), serde_json::json!({"lr": 0.1}));

        tracker.init(&run).unwrap();
        let mut metrics = Metrics::new();
        metrics.insert("train/loss".to_string(), 0.5);
        tracker.log(3, &metrics).unwrap();
        tracker.finish().unwrap();

        let path = dir.path().join("brats").join("run-a.jsonl");
        assert_eq!(tracker.path(), Some(path.as_path()));
        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "init");
        assert_eq!(lines[0]["run"]["config"]["lr"], 0.1);
        assert_eq!(lines[1]["step"], 3);
        assert_eq!(lines[1]["metrics"]["train/loss"], 0.5);
        assert_eq!(lines[2]["event"], "finish");
    }

    #[test]
    fn test_log_before_init_fails() {
        let dir = tempdir().unwrap();
        let mut tracker = JsonlTracker::new(dir.path());
        assert!(matches!(
            tracker.log(0, &Metrics::new()),
            Err(Error::Tracking(_))
        ));
    }

    #[test]
    fn test_default_run_id_is_timestamped() {
        let run = RunInfo::new("p", None, serde_json::Value::Null);
        assert!(run.run_id.starts_with("run-"));
    }
}
