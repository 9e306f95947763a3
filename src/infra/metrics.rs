// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Appends training and evaluation metrics to a CSV file in the
// output directory, next to the checkpoints.
//
//   step,epoch,split,loss,learning_rate
//   100,1,train,2.413201,0.000987
//   250,1,eval,2.298870,
//
// `train` rows are written every `logging_steps` optimizer steps,
// `eval` rows once per epoch. The header is only written when the
// file is new, so a resumed run keeps appending to the same log.
//
// Reference: Rust Book §12 (I/O and File Handling)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Eval,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Eval => "eval",
        }
    }
}

/// One logged measurement. Also kept in the trainer state's log history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step:  usize,
    pub epoch: usize,
    pub split: Split,
    /// Mean loss over the logging window (train) or the test split (eval)
    pub loss:  f64,
    /// Only set for train rows
    pub learning_rate: Option<f64>,
}

impl MetricRecord {
    pub fn train(step: usize, epoch: usize, loss: f64, learning_rate: f64) -> Self {
        Self { step, epoch, split: Split::Train, loss, learning_rate: Some(learning_rate) }
    }

    pub fn eval(step: usize, epoch: usize, loss: f64) -> Self {
        Self { step, epoch, split: Split::Eval, loss, learning_rate: None }
    }

    fn csv_row(&self) -> String {
        let lr = self.learning_rate.map(|lr| format!("{lr:.8}")).unwrap_or_default();
        format!("{},{},{},{:.6},{}", self.step, self.epoch, self.split.as_str(), self.loss, lr)
    }
}

pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let csv_path = dir.join("metrics.csv");

        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "step,epoch,split,loss,learning_rate")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }
        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &MetricRecord) -> Result<()> {
        let mut f = OpenOptions::new().append(true).open(&self.csv_path)?;
        writeln!(f, "{}", m.csv_row())?;
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_appended_after_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log(&MetricRecord::train(100, 1, 2.5, 1e-3)).unwrap();
        logger.log(&MetricRecord::eval(120, 1, 2.25)).unwrap();

        // reopening does not rewrite the header
        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log(&MetricRecord::train(200, 2, 2.0, 5e-4)).unwrap();

        let text = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "step,epoch,split,loss,learning_rate");
        assert_eq!(lines[1], "100,1,train,2.500000,0.00100000");
        assert_eq!(lines[2], "120,1,eval,2.250000,");
        assert!(lines[3].starts_with("200,2,train"));
    }
}
