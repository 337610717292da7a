//! Object-store backed CIFAR-100 image classification.
//!
//! An [`ImageProcessor`] downloads an image from a bucket, normalizes it to the
//! 32×32 RGB input of a TensorFlow SavedModel, stores the prediction next to
//! the source as `<key>.json` and removes the source blob.

pub mod classifier;
pub mod config;
pub mod handler;
pub mod labels;
pub mod preprocess;
pub mod result;
pub mod store;
mod timer;

pub use classifier::{argmax, ClassifyError, ImageClassifier, Predict};
pub use config::{ConfigError, StoreConfig};
pub use handler::{HandlerConfig, ImageProcessor, ProcessError, ProcessReport};
pub use labels::LabelSet;
pub use preprocess::ImageTensor;
pub use result::PredictionResult;
pub use store::{DirStore, ObjectStore, S3Store, StoreError};
pub use timer::Timer;
