use serde::{Deserialize, Serialize};

/// Message stored in place of a prediction when processing fails
pub const GENERIC_ERROR: &str = "Error processing image";

/// Record written to `<filename>.json` once per processed image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictionResult {
    Success {
        /// Scores with the batch dimension kept, i.e. `[[p0, .., p99]]`
        prediction: Vec<Vec<f32>>,
        predicted_label: String,
    },
    Failure {
        error: String,
    },
}

impl PredictionResult {
    pub fn success(scores: Vec<f32>, label: &str) -> Self {
        PredictionResult::Success {
            prediction: vec![scores],
            predicted_label: label.to_owned(),
        }
    }

    /// Generic failure record; the underlying cause is only logged.
    pub fn failure() -> Self {
        PredictionResult::Failure {
            error: GENERIC_ERROR.to_owned(),
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            PredictionResult::Success {
                predicted_label, ..
            } => Some(predicted_label),
            PredictionResult::Failure { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PredictionResult::Failure { .. })
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Storage key of the result for `filename`
pub fn result_key(prefix: &str, filename: &str) -> String {
    format!("{}{}.json", prefix, filename)
}
