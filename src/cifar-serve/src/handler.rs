//! Request handling: download, classify, store the result, clean up.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::ImageError;
use log::{error, info, warn};
use tempfile::TempPath;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::classifier::{argmax, ClassifyError, Predict, INPUT_HEIGHT, INPUT_WIDTH};
use crate::labels::LabelSet;
use crate::preprocess;
use crate::result::{result_key, PredictionResult};
use crate::store::{ObjectStore, StoreError};
use crate::timer::Timer;

const RESULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("download failed: {0}")]
    Download(#[source] StoreError),

    #[error("image decode failed: {0}")]
    Decode(#[source] ImageError),

    #[error("inference failed: {0}")]
    Inference(#[source] ClassifyError),

    #[error("no label for class index {index} ({labels} labels known)")]
    Label { index: usize, labels: usize },

    #[error("result upload failed: {0}")]
    Upload(#[source] StoreError),

    #[error("cleanup of {target} failed: {reason}")]
    Cleanup { target: String, reason: String },
}

#[derive(Clone, Debug)]
pub struct HandlerConfig {
    pub bucket: String,
    /// Prepended to `<filename>.json` when storing results
    pub results_prefix: String,
    /// Where downloaded blobs are staged
    pub tmp_dir: PathBuf,
}

impl HandlerConfig {
    pub fn new(bucket: &str) -> Self {
        HandlerConfig {
            bucket: bucket.to_owned(),
            results_prefix: String::new(),
            tmp_dir: std::env::temp_dir(),
        }
    }
}

/// Outcome of one processing cycle
#[derive(Debug)]
pub struct ProcessReport {
    pub filename: String,
    pub result_key: String,
    /// What was (or was meant to be) stored, or why classification failed
    pub outcome: Result<PredictionResult, ProcessError>,
    /// Whether a result object was written under `result_key`
    pub stored: bool,
    pub cleanup_errors: Vec<ProcessError>,
}

/// Classifies blobs from one bucket, sharing a single loaded model.
pub struct ImageProcessor {
    store: Arc<dyn ObjectStore>,
    model: Arc<dyn Predict>,
    labels: LabelSet,
    config: HandlerConfig,
}

impl ImageProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        model: Arc<dyn Predict>,
        labels: LabelSet,
        config: HandlerConfig,
    ) -> Self {
        ImageProcessor {
            store,
            model,
            labels,
            config,
        }
    }

    pub fn result_key(&self, filename: &str) -> String {
        result_key(&self.config.results_prefix, filename)
    }

    /// Starts processing in the background. Completion is only observable
    /// through the result object in the store.
    pub fn spawn(self: &Arc<Self>, filename: String) -> JoinHandle<ProcessReport> {
        let processor = Arc::clone(self);
        tokio::spawn(async move { processor.process(&filename).await })
    }

    pub async fn process(&self, filename: &str) -> ProcessReport {
        let mut t = Timer::new_start(&format!("Processing {}", filename));
        let key = self.result_key(filename);

        let mut local = None;
        let outcome = self.classify(filename, &key, &mut local).await;

        let mut stored = outcome.is_ok();
        if let Err(err) = &outcome {
            error!("Processing {} failed: {}", filename, err);
            stored = self.store_failure(&key).await;
        }

        let cleanup_errors = self.cleanup(filename, local).await;

        t.stop();

        ProcessReport {
            filename: filename.to_owned(),
            result_key: key,
            outcome,
            stored,
            cleanup_errors,
        }
    }

    async fn classify(
        &self,
        filename: &str,
        key: &str,
        local: &mut Option<TempPath>,
    ) -> Result<PredictionResult, ProcessError> {
        let staged = self
            .stage_file(filename)
            .map_err(|e| ProcessError::Download(StoreError::Io(e)))?;
        let path: &Path = local.insert(staged);

        self.store
            .download(&self.config.bucket, filename, path)
            .await
            .map_err(ProcessError::Download)?;

        let scores = self.predict_file(path.to_path_buf()).await?;

        let index = argmax(&scores).ok_or(ProcessError::Inference(
            ClassifyError::NoFiniteScore {
                classes: scores.len(),
            },
        ))?;
        let label = self.labels.get(index).ok_or(ProcessError::Label {
            index,
            labels: self.labels.len(),
        })?;

        info!("{} classified as {} (class {})", filename, label, index);

        let result = PredictionResult::success(scores, label);
        self.upload(key, &result).await?;

        Ok(result)
    }

    /// Decodes and classifies off the async workers; both are CPU-bound.
    async fn predict_file(&self, path: PathBuf) -> Result<Vec<f32>, ProcessError> {
        let model = Arc::clone(&self.model);

        let task = tokio::task::spawn_blocking(move || {
            let tensor = preprocess::load(&path, INPUT_WIDTH, INPUT_HEIGHT)
                .map_err(ProcessError::Decode)?;

            model.predict(&tensor).map_err(ProcessError::Inference)
        });

        task.await.map_err(|e| {
            ProcessError::Inference(ClassifyError::Model(format!(
                "inference task failed: {}",
                e
            )))
        })?
    }

    fn stage_file(&self, filename: &str) -> io::Result<TempPath> {
        let suffix = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();

        let file = tempfile::Builder::new()
            .prefix("cifar-")
            .suffix(&suffix)
            .tempfile_in(&self.config.tmp_dir)?;

        Ok(file.into_temp_path())
    }

    async fn upload(&self, key: &str, result: &PredictionResult) -> Result<(), ProcessError> {
        let body = result
            .to_json()
            .map_err(|e| ProcessError::Upload(StoreError::Backend(e.to_string())))?;

        self.store
            .upload(&self.config.bucket, key, body, RESULT_CONTENT_TYPE)
            .await
            .map_err(ProcessError::Upload)
    }

    async fn store_failure(&self, key: &str) -> bool {
        match self.upload(key, &PredictionResult::failure()).await {
            Ok(()) => true,
            Err(e) => {
                error!("Could not store error result {}: {}", key, e);
                false
            }
        }
    }

    /// Removes the staged file and the source blob. Never fails the cycle.
    async fn cleanup(&self, filename: &str, local: Option<TempPath>) -> Vec<ProcessError> {
        let mut errors = Vec::new();

        if let Some(path) = local {
            let target = path.display().to_string();
            if let Err(e) = path.close() {
                errors.push(ProcessError::Cleanup {
                    target,
                    reason: e.to_string(),
                });
            }
        }

        if let Err(e) = self.store.delete(&self.config.bucket, filename).await {
            errors.push(ProcessError::Cleanup {
                target: format!("{}/{}", self.config.bucket, filename),
                reason: e.to_string(),
            });
        }

        for err in &errors {
            warn!("{}", err);
        }

        errors
    }
}
