use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeProgress {
    pub label: String,
    pub percent: f32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ProgressReporter {
    label: String,
    tx: mpsc::Sender<TranscodeProgress>,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, tx: mpsc::Sender<TranscodeProgress>) -> Self {
        Self {
            label: label.into(),
            tx,
        }
    }

    pub fn noop(label: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::channel::<TranscodeProgress>(1);
        Self::new(label, tx)
    }

    pub fn report(&self, percent: f32) {
        let _ = self.tx.try_send(TranscodeProgress {
            label: self.label.clone(),
            percent,
            updated_at: Utc::now(),
        });
    }
}
