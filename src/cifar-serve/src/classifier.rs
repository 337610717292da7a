use std::path::Path;

use log::debug;
use tensorflow::{Graph, SavedModelBundle, Session, SessionOptions, SessionRunArgs, Status, Tensor};
use thiserror::Error;

use crate::preprocess::{ImageTensor, CHANNELS};
use crate::timer::Timer;

/// Input resolution the network is trained at
pub const INPUT_WIDTH: u32 = 32;
pub const INPUT_HEIGHT: u32 = 32;

/// Size of the output probability vector
pub const NUM_CLASSES: usize = 100;

/// SavedModel tag the exported graph is stored under
pub const SERVE_TAG: &str = "serve";

pub const SIGNATURE_KEY: &str = "serving_default";
pub const PREDICT_METHOD: &str = "tensorflow/serving/predict";
pub const INPUT_KEY: &str = "images";
pub const OUTPUT_KEY: &str = "probabilities";

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("model error: {0}")]
    Model(String),

    #[error("unexpected output size: expected {expected} scores, got {got}")]
    Shape { expected: usize, got: usize },

    #[error("none of the {classes} scores is a number")]
    NoFiniteScore { classes: usize },
}

impl From<Status> for ClassifyError {
    fn from(status: Status) -> Self {
        ClassifyError::Model(status.to_string())
    }
}

/// Maps a normalized image to a probability distribution over the label set.
pub trait Predict: Send + Sync {
    fn predict(&self, image: &ImageTensor) -> Result<Vec<f32>, ClassifyError>;
}

/// Index of the highest score. Ties go to the lowest index; NaN never wins.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;

    for (idx, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }

        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((idx, score)),
        }
    }

    best.map(|(idx, _)| idx)
}

/// Feed/fetch endpoint resolved from the model signature
struct Endpoint {
    op: String,
    index: i32,
}

/// CIFAR-100 classifier backed by a TensorFlow SavedModel.
pub struct ImageClassifier {
    /// TensorFlow model graph
    graph: Graph,

    /// TensorFlow session
    session: Session,

    input: Endpoint,

    output: Endpoint,

    classes: usize,
}

impl ImageClassifier {
    pub fn new(export_dir: &Path) -> Result<Self, ClassifyError> {
        Self::with_classes(export_dir, NUM_CLASSES)
    }

    pub fn with_classes(export_dir: &Path, classes: usize) -> Result<Self, ClassifyError> {
        let mut t = Timer::new_start("Loading session");

        let mut graph = Graph::new();
        let bundle =
            SavedModelBundle::load(&SessionOptions::new(), &[SERVE_TAG], &mut graph, export_dir)?;

        let signature = bundle.meta_graph_def().get_signature(SIGNATURE_KEY)?;
        let input_info = signature.get_input(INPUT_KEY)?;
        let output_info = signature.get_output(OUTPUT_KEY)?;

        let input = Endpoint {
            op: input_info.name().name.clone(),
            index: input_info.name().index,
        };
        let output = Endpoint {
            op: output_info.name().name.clone(),
            index: output_info.name().index,
        };

        // Fail at startup rather than on the first request.
        graph.operation_by_name_required(&input.op)?;
        graph.operation_by_name_required(&output.op)?;

        debug!(
            "Model signature: {}:{} -> {}:{}",
            input.op, input.index, output.op, output.index
        );

        t.stop();

        Ok(ImageClassifier {
            graph,
            session: bundle.session,
            input,
            output,
            classes,
        })
    }

    pub fn run(&self, image: &ImageTensor) -> Result<Vec<f32>, ClassifyError> {
        let mut t = Timer::new_start("Running session");

        let (height, width, channels) = image.shape();
        let input = Tensor::new(&[1, height as u64, width as u64, channels as u64])
            .with_values(image.data())?;

        let input_op = self.graph.operation_by_name_required(&self.input.op)?;
        let output_op = self.graph.operation_by_name_required(&self.output.op)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_op, self.input.index, &input);
        let result = args.request_fetch(&output_op, self.output.index);

        self.session.run(&mut args)?;
        let output: Tensor<f32> = args.fetch(result)?;

        t.stop();

        if output.len() != self.classes {
            return Err(ClassifyError::Shape {
                expected: self.classes,
                got: output.len(),
            });
        }

        Ok(output.to_vec())
    }
}

impl Predict for ImageClassifier {
    fn predict(&self, image: &ImageTensor) -> Result<Vec<f32>, ClassifyError> {
        debug_assert_eq!(image.shape().2, CHANNELS);
        self.run(image)
    }
}

#[cfg(test)]
mod tests {
    use super::argmax;

    #[test]
    fn argmax_picks_highest() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some(1));
    }

    #[test]
    fn argmax_ties_go_to_lowest_index() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4, 0.0]), Some(1));
        assert_eq!(argmax(&[0.01; 100]), Some(0));
    }

    #[test]
    fn argmax_skips_nan() {
        assert_eq!(argmax(&[f32::NAN, 0.3, 0.2]), Some(1));
        assert_eq!(argmax(&[f32::NAN, f32::NAN]), None);
    }

    #[test]
    fn argmax_of_empty_is_none() {
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn argmax_stays_in_range() {
        let scores: Vec<f32> = (0..100).map(|i| ((i * 37) % 101) as f32).collect();
        let idx = argmax(&scores).unwrap();
        assert!(idx < 100);
        assert_eq!(idx, 30);
    }
}
