mod dataset;
mod network;
mod trainer;

use std::error::Error;
use std::path::PathBuf;
use structopt::StructOpt;

use cifar_serve::LabelSet;
use log::info;

use crate::trainer::{TrainConfig, Trainer};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "cifar-train",
    about = "Train the CIFAR-100 classifier and export it as a TensorFlow SavedModel"
)]
struct CmdArgs {
    #[structopt(help = "Directory with the extracted cifar-100-binary files")]
    data_dir: PathBuf,

    #[structopt(
        default_value = "image_recognition_model",
        help = "Export directory for the SavedModel (must not exist)"
    )]
    export_dir: PathBuf,

    #[structopt(long, default_value = "20")]
    epochs: usize,

    #[structopt(long, default_value = "128")]
    batch_size: usize,

    #[structopt(long, help = "Seed for shuffling and dropout")]
    seed: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CmdArgs::from_args();

    let labels = LabelSet::cifar100();
    dataset::check_label_order(&args.data_dir, &labels)?;

    let (train, test) = dataset::load_splits(&args.data_dir)?;
    info!("{} training / {} test images", train.len(), test.len());

    let config = TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        seed: args.seed,
    };

    let mut trainer = Trainer::new(config.seed)?;
    let history = trainer.fit(&train, &test, &config)?;

    if let Some(last) = history.last() {
        info!(
            "Final val_accuracy {:.4} after {} epochs",
            last.val_accuracy, last.epoch
        );
    }

    trainer.export(&args.export_dir, &labels)?;
    trainer::verify_export(&args.export_dir)?;

    Ok(())
}
