use std::error::Error;
use std::path::PathBuf;
use structopt::StructOpt;

use cifar_serve::classifier::{INPUT_HEIGHT, INPUT_WIDTH};
use cifar_serve::{argmax, preprocess, ImageClassifier, LabelSet, PredictionResult, Timer};

use log::info;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "cifar-classify",
    about = "CLI app to classify a single image with an exported CIFAR-100 model"
)]
struct CmdArgs {
    #[structopt(help = "Export directory of TensorFlow SavedModel")]
    export_dir: PathBuf,

    #[structopt(help = "Image file, or http(s) URL to fetch the image from")]
    image: String,

    #[structopt(long, help = "Label file, one label per line (defaults to CIFAR-100)")]
    labels: Option<PathBuf>,
}

fn fetch(source: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut t = Timer::new_start(&format!("Fetching image from {}", source));

    let bytes = if source.starts_with("http://") || source.starts_with("https://") {
        reqwest::blocking::get(source)?
            .error_for_status()?
            .bytes()?
            .to_vec()
    } else {
        std::fs::read(source)?
    };

    t.stop();

    Ok(bytes)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CmdArgs::from_args();

    let labels = match &args.labels {
        Some(path) => LabelSet::from_file(path)?,
        None => LabelSet::cifar100(),
    };

    let classifier = ImageClassifier::with_classes(&args.export_dir, labels.len())?;

    let raw = fetch(&args.image)?;
    let tensor = preprocess::preprocess(&raw, INPUT_WIDTH, INPUT_HEIGHT)?;
    let scores = classifier.run(&tensor)?;

    let result = match argmax(&scores).and_then(|idx| labels.get(idx)) {
        Some(label) => {
            info!("{} classified as {}", args.image, label);
            PredictionResult::success(scores, label)
        }
        None => PredictionResult::failure(),
    };

    println!("{}", serde_json::to_string(&result)?);

    Ok(())
}
