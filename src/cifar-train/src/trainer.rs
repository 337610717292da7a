use std::fs;
use std::path::Path;

use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tensorflow::{SavedModelSaver, Scope, Session, SessionOptions, SessionRunArgs, Status, Tensor};
use thiserror::Error;

use cifar_serve::classifier::{INPUT_HEIGHT, INPUT_WIDTH, NUM_CLASSES};
use cifar_serve::{argmax, ClassifyError, ImageClassifier, ImageTensor, LabelSet, Timer};

use crate::dataset::{Dataset, DatasetError, IMAGE_SIDE};
use crate::network::{Network, HIDDEN_UNITS, KEEP_PROB};

pub const LABELS_FILE: &str = "labels.txt";

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("tensorflow: {0}")]
    Tensorflow(#[from] Status),

    #[error("export directory {0:?} already exists")]
    ExportExists(std::path::PathBuf),

    #[error("could not write {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("exported model failed to load: {0}")]
    Reload(#[from] ClassifyError),

    #[error("exported model returned probabilities summing to {0}")]
    BadDistribution(f32),
}

#[derive(Clone, Debug)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            epochs: 20,
            batch_size: 128,
            seed: None,
        }
    }
}

/// Metrics for one epoch, training then held-out
#[derive(Clone, Debug, Default)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
}

/// Running loss/accuracy over the batches of one pass
#[derive(Default)]
struct Tally {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl Tally {
    fn add(&mut self, batch_loss: f32, probabilities: &[f32], dataset: &Dataset, indices: &[usize]) {
        self.loss_sum += batch_loss as f64 * indices.len() as f64;
        self.seen += indices.len();
        self.correct += probabilities
            .chunks(NUM_CLASSES)
            .zip(indices)
            .filter(|(scores, i)| argmax(scores) == Some(dataset.label(**i)))
            .count();
    }

    fn loss(&self) -> f32 {
        if self.seen == 0 {
            return 0.0;
        }
        (self.loss_sum / self.seen as f64) as f32
    }

    fn accuracy(&self) -> f32 {
        if self.seen == 0 {
            return 0.0;
        }
        self.correct as f32 / self.seen as f32
    }
}

/// Owns the graph, the session and the network being fitted.
pub struct Trainer {
    scope: Scope,
    network: Network,
    saver: SavedModelSaver,
    session: Session,
    rng: StdRng,
}

impl Trainer {
    pub fn new(seed: Option<u64>) -> Result<Self, TrainError> {
        let mut t = Timer::new_start("Building graph");

        let mut scope = Scope::new_root_scope();
        let network = Network::build(&mut scope)?;
        let saver = network.saver(&mut scope)?;

        let session = Session::new(&SessionOptions::new(), &scope.graph_mut())?;

        let mut init = SessionRunArgs::new();
        for var in network.variables.iter().chain(&network.optimizer_variables) {
            init.add_target(var.initializer());
        }
        session.run(&mut init)?;

        t.stop();

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Trainer {
            scope,
            network,
            saver,
            session,
            rng,
        })
    }

    fn images(dataset: &Dataset, indices: &[usize]) -> Result<Tensor<f32>, Status> {
        let side = IMAGE_SIDE as u64;
        Tensor::new(&[indices.len() as u64, side, side, 3]).with_values(&dataset.images(indices))
    }

    fn labels(dataset: &Dataset, indices: &[usize]) -> Result<Tensor<f32>, Status> {
        Tensor::new(&[indices.len() as u64, NUM_CLASSES as u64])
            .with_values(&dataset.one_hot(indices))
    }

    /// Inverted dropout: kept units are scaled by `1 / KEEP_PROB`
    fn dropout_mask(&mut self, rows: usize) -> Result<Tensor<f32>, Status> {
        let scale = 1.0 / KEEP_PROB;
        let values: Vec<f32> = (0..rows * HIDDEN_UNITS as usize)
            .map(|_| {
                if self.rng.gen_bool(KEEP_PROB as f64) {
                    scale
                } else {
                    0.0
                }
            })
            .collect();

        Tensor::new(&[rows as u64, HIDDEN_UNITS]).with_values(&values)
    }

    fn train_epoch(&mut self, dataset: &Dataset, batch_size: usize) -> Result<Tally, TrainError> {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(&mut self.rng);

        let mut tally = Tally::default();

        for batch in order.chunks(batch_size) {
            let images = Self::images(dataset, batch)?;
            let labels = Self::labels(dataset, batch)?;
            let mask = self.dropout_mask(batch.len())?;

            let net = &self.network;
            let mut args = SessionRunArgs::new();
            args.add_feed(&net.images, 0, &images);
            args.add_feed(&net.labels, 0, &labels);
            args.add_feed(&net.dropout_mask, 0, &mask);
            args.add_target(&net.train_step);
            let loss = args.request_fetch(&net.loss, 0);
            let probabilities = args.request_fetch(&net.probabilities, 0);

            self.session.run(&mut args)?;

            let loss: Tensor<f32> = args.fetch(loss)?;
            let probabilities: Tensor<f32> = args.fetch(probabilities)?;
            tally.add(loss[0], &probabilities, dataset, batch);
        }

        Ok(tally)
    }

    fn evaluate(&self, dataset: &Dataset, batch_size: usize) -> Result<Tally, TrainError> {
        let order: Vec<usize> = (0..dataset.len()).collect();
        let mut tally = Tally::default();

        for batch in order.chunks(batch_size) {
            let images = Self::images(dataset, batch)?;
            let labels = Self::labels(dataset, batch)?;

            let net = &self.network;
            let mut args = SessionRunArgs::new();
            args.add_feed(&net.images, 0, &images);
            args.add_feed(&net.labels, 0, &labels);
            let loss = args.request_fetch(&net.loss, 0);
            let probabilities = args.request_fetch(&net.probabilities, 0);

            self.session.run(&mut args)?;

            let loss: Tensor<f32> = args.fetch(loss)?;
            let probabilities: Tensor<f32> = args.fetch(probabilities)?;
            tally.add(loss[0], &probabilities, dataset, batch);
        }

        Ok(tally)
    }

    /// Fits for a fixed number of epochs, evaluating on `test` after each.
    pub fn fit(
        &mut self,
        train: &Dataset,
        test: &Dataset,
        config: &TrainConfig,
    ) -> Result<Vec<EpochStats>, TrainError> {
        let batch_size = config.batch_size.max(1);
        let mut history = Vec::with_capacity(config.epochs);

        for epoch in 1..=config.epochs {
            let mut t = Timer::new_start(&format!("Epoch {}/{}", epoch, config.epochs));

            let fitted = self.train_epoch(train, batch_size)?;
            let held_out = self.evaluate(test, batch_size)?;

            t.stop();

            let stats = EpochStats {
                epoch,
                loss: fitted.loss(),
                accuracy: fitted.accuracy(),
                val_loss: held_out.loss(),
                val_accuracy: held_out.accuracy(),
            };

            info!(
                "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
                epoch,
                config.epochs,
                stats.loss,
                stats.accuracy,
                stats.val_loss,
                stats.val_accuracy
            );

            history.push(stats);
        }

        Ok(history)
    }

    /// Writes the SavedModel and its label file to `export_dir`, which must
    /// not exist yet.
    pub fn export(&mut self, export_dir: &Path, labels: &LabelSet) -> Result<(), TrainError> {
        if export_dir.exists() {
            return Err(TrainError::ExportExists(export_dir.to_path_buf()));
        }

        let mut t = Timer::new_start("Exporting model");

        {
            let graph = self.scope.graph_mut();
            self.saver.save(&self.session, &graph, export_dir)?;
        }

        let labels_path = export_dir.join(LABELS_FILE);
        fs::write(&labels_path, labels.to_text()).map_err(|source| TrainError::Io {
            path: labels_path,
            source,
        })?;

        t.stop();
        info!("Saved model to {:?}", export_dir);

        Ok(())
    }
}

/// Loads an exported model the way the server does and checks it maps a
/// `(1, 32, 32, 3)` input to a distribution over 100 classes.
pub fn verify_export(export_dir: &Path) -> Result<Vec<f32>, TrainError> {
    let classifier = ImageClassifier::new(export_dir)?;

    let (h, w) = (INPUT_HEIGHT as usize, INPUT_WIDTH as usize);
    let blank = ImageTensor::new(h, w, vec![0.5; h * w * 3]).ok_or(ClassifyError::Shape {
        expected: h * w * 3,
        got: 0,
    })?;

    let scores = classifier.run(&blank)?;
    let total: f32 = scores.iter().sum();
    if (total - 1.0).abs() > 1e-3 {
        return Err(TrainError::BadDistribution(total));
    }

    info!("Exported model verified: {} classes, sum {:.6}", scores.len(), total);

    Ok(scores)
}
