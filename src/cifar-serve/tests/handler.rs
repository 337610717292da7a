//! End-to-end request handling against a directory-backed store.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cifar_serve::{
    ClassifyError, DirStore, HandlerConfig, ImageProcessor, ImageTensor, LabelSet, ObjectStore,
    Predict, PredictionResult, ProcessError, StoreError,
};
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgba};
use serde_json::{json, Value};
use tempfile::TempDir;

const BUCKET: &str = "images";

/// Puts most of the mass on one class and records what it was fed.
struct FixedModel {
    class: usize,
    calls: AtomicUsize,
}

impl FixedModel {
    fn new(class: usize) -> Self {
        FixedModel {
            class,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Predict for FixedModel {
    fn predict(&self, image: &ImageTensor) -> Result<Vec<f32>, ClassifyError> {
        assert_eq!(image.shape(), (32, 32, 3));
        assert!(image.data().iter().all(|v| (0.0..=1.0).contains(v)));
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut scores = vec![0.005f32; 100];
        scores[self.class] = 1.0 - 0.005 * 99.0;
        Ok(scores)
    }
}

struct BrokenModel;

impl Predict for BrokenModel {
    fn predict(&self, _image: &ImageTensor) -> Result<Vec<f32>, ClassifyError> {
        Err(ClassifyError::Model("graph exploded".into()))
    }
}

/// Returns the same scores for every image.
struct ConstantModel(Vec<f32>);

impl Predict for ConstantModel {
    fn predict(&self, _image: &ImageTensor) -> Result<Vec<f32>, ClassifyError> {
        Ok(self.0.clone())
    }
}

/// Local store whose uploads always fail.
struct ReadOnlyStore {
    inner: Arc<DirStore>,
    uploads: AtomicUsize,
}

#[async_trait]
impl ObjectStore for ReadOnlyStore {
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StoreError> {
        self.inner.download(bucket, key, dest).await
    }

    async fn upload(
        &self,
        _bucket: &str,
        key: &str,
        _body: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StoreError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Backend(format!("{} is read-only", key)))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.inner.delete(bucket, key).await
    }
}

struct Fixture {
    _root: TempDir,
    store_dir: TempDir,
    tmp_dir: TempDir,
    store: Arc<DirStore>,
}

impl Fixture {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let root = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir_in(root.path()).unwrap();
        let tmp_dir = tempfile::tempdir_in(root.path()).unwrap();
        let store = Arc::new(DirStore::new(store_dir.path()));

        Fixture {
            _root: root,
            store_dir,
            tmp_dir,
            store,
        }
    }

    fn processor(&self, model: Arc<dyn Predict>, prefix: &str) -> Arc<ImageProcessor> {
        self.processor_with(self.store.clone(), model, LabelSet::cifar100(), prefix)
    }

    fn processor_with(
        &self,
        store: Arc<dyn ObjectStore>,
        model: Arc<dyn Predict>,
        labels: LabelSet,
        prefix: &str,
    ) -> Arc<ImageProcessor> {
        let mut config = HandlerConfig::new(BUCKET);
        config.results_prefix = prefix.to_owned();
        config.tmp_dir = self.tmp_dir.path().to_path_buf();

        Arc::new(ImageProcessor::new(store, model, labels, config))
    }

    fn object(&self, key: &str) -> std::path::PathBuf {
        self.store_dir.path().join(BUCKET).join(key)
    }

    async fn put(&self, key: &str, body: Vec<u8>) {
        self.store
            .upload(BUCKET, key, body, "application/octet-stream")
            .await
            .unwrap();
    }

    fn read_json(&self, key: &str) -> Value {
        serde_json::from_slice(&std::fs::read(self.object(key)).unwrap()).unwrap()
    }

    fn tmp_is_empty(&self) -> bool {
        is_empty_dir(self.tmp_dir.path())
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

fn rgba_png(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut buf, ImageOutputFormat::Png)
        .unwrap();
    buf.into_inner()
}

#[tokio::test]
async fn successful_run_stores_prediction_and_removes_source() {
    let fx = Fixture::new();
    fx.put("cat.png", rgba_png(500, 500)).await;

    let model = Arc::new(FixedModel::new(3));
    let processor = fx.processor(model.clone(), "");

    let report = processor.process("cat.png").await;

    assert_eq!(report.filename, "cat.png");
    assert_eq!(report.result_key, "cat.png.json");
    assert!(report.stored);
    assert!(report.cleanup_errors.is_empty());
    assert_eq!(report.outcome.unwrap().label(), Some("bear"));
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);

    let stored = fx.read_json("cat.png.json");
    assert_eq!(stored["predicted_label"], json!("bear"));

    let scores = stored["prediction"][0].as_array().unwrap();
    assert_eq!(stored["prediction"].as_array().unwrap().len(), 1);
    assert_eq!(scores.len(), 100);
    let sum: f64 = scores.iter().map(|v| v.as_f64().unwrap()).sum();
    assert!((sum - 1.0).abs() < 1e-3);

    assert!(!fx.object("cat.png").exists());
    assert!(fx.tmp_is_empty());
}

#[tokio::test]
async fn missing_blob_stores_generic_error() {
    let fx = Fixture::new();
    let processor = fx.processor(Arc::new(FixedModel::new(3)), "");

    let report = processor.process("ghost.png").await;

    assert!(matches!(report.outcome, Err(ProcessError::Download(_))));
    assert!(report.stored);
    assert_eq!(
        fx.read_json("ghost.png.json"),
        json!({"error": "Error processing image"})
    );

    // The source was never there, so deleting it is a logged cleanup failure.
    assert_eq!(report.cleanup_errors.len(), 1);
    assert!(matches!(
        report.cleanup_errors[0],
        ProcessError::Cleanup { .. }
    ));
    assert!(fx.tmp_is_empty());
}

#[tokio::test]
async fn corrupt_image_is_reported_and_source_still_deleted() {
    let fx = Fixture::new();
    fx.put("broken.jpg", b"not really a jpeg".to_vec()).await;

    let processor = fx.processor(Arc::new(FixedModel::new(0)), "");
    let report = processor.process("broken.jpg").await;

    assert!(matches!(report.outcome, Err(ProcessError::Decode(_))));
    assert_eq!(
        fx.read_json("broken.jpg.json"),
        json!({"error": "Error processing image"})
    );
    assert!(report.cleanup_errors.is_empty());
    assert!(!fx.object("broken.jpg").exists());
    assert!(fx.tmp_is_empty());
}

#[tokio::test]
async fn inference_failure_stores_generic_error() {
    let fx = Fixture::new();
    fx.put("dog.png", rgba_png(64, 48)).await;

    let processor = fx.processor(Arc::new(BrokenModel), "");
    let report = processor.process("dog.png").await;

    assert!(matches!(report.outcome, Err(ProcessError::Inference(_))));
    let stored: PredictionResult =
        serde_json::from_slice(&std::fs::read(fx.object("dog.png.json")).unwrap()).unwrap();
    assert!(stored.is_failure());
    assert!(!fx.object("dog.png").exists());
}

#[tokio::test]
async fn results_prefix_is_applied() {
    let fx = Fixture::new();
    fx.put("nested/cat.png", rgba_png(40, 40)).await;

    let processor = fx.processor(Arc::new(FixedModel::new(99)), "results/");
    let report = processor.process("nested/cat.png").await;

    assert_eq!(report.result_key, "results/nested/cat.png.json");
    assert_eq!(
        fx.read_json("results/nested/cat.png.json")["predicted_label"],
        json!("worm")
    );
    assert!(!fx.object("nested/cat.png").exists());
}

#[tokio::test]
async fn spawned_processing_completes_in_background() {
    let fx = Fixture::new();
    fx.put("bg.png", rgba_png(32, 32)).await;

    let processor = fx.processor(Arc::new(FixedModel::new(3)), "");
    let handle = processor.spawn("bg.png".to_owned());

    let report = handle.await.unwrap();
    assert!(report.outcome.is_ok());
    assert!(fx.object("bg.png.json").exists());
    assert!(!fx.object("bg.png").exists());
}

#[tokio::test]
async fn failed_result_upload_is_reported_and_source_still_deleted() {
    let fx = Fixture::new();
    fx.put("cat.png", rgba_png(32, 32)).await;

    let store = Arc::new(ReadOnlyStore {
        inner: fx.store.clone(),
        uploads: AtomicUsize::new(0),
    });
    let processor = fx.processor_with(
        store.clone(),
        Arc::new(FixedModel::new(3)),
        LabelSet::cifar100(),
        "",
    );

    let report = processor.process("cat.png").await;

    assert!(matches!(report.outcome, Err(ProcessError::Upload(_))));
    assert!(!report.stored);
    // The prediction, then the generic error.
    assert_eq!(store.uploads.load(Ordering::SeqCst), 2);
    assert!(!fx.object("cat.png.json").exists());
    assert!(report.cleanup_errors.is_empty());
    assert!(!fx.object("cat.png").exists());
    assert!(fx.tmp_is_empty());
}

#[tokio::test]
async fn scores_without_a_number_store_generic_error() {
    for scores in [vec![f32::NAN; 100], Vec::new()] {
        let fx = Fixture::new();
        fx.put("nan.png", rgba_png(32, 32)).await;

        let processor = fx.processor(Arc::new(ConstantModel(scores)), "");
        let report = processor.process("nan.png").await;

        assert!(matches!(
            report.outcome,
            Err(ProcessError::Inference(ClassifyError::NoFiniteScore { .. }))
        ));
        assert!(report.stored);
        assert_eq!(
            fx.read_json("nan.png.json"),
            json!({"error": "Error processing image"})
        );
        assert!(!fx.object("nan.png").exists());
    }
}

#[tokio::test]
async fn class_beyond_label_set_stores_generic_error() {
    let fx = Fixture::new();
    fx.put("cat.png", rgba_png(32, 32)).await;

    let labels = LabelSet::new(vec!["apple".to_owned(), "aquarium_fish".to_owned()]);
    let processor = fx.processor_with(
        fx.store.clone(),
        Arc::new(FixedModel::new(5)),
        labels,
        "",
    );

    let report = processor.process("cat.png").await;

    assert!(matches!(
        report.outcome,
        Err(ProcessError::Label {
            index: 5,
            labels: 2
        })
    ));
    assert_eq!(
        fx.read_json("cat.png.json"),
        json!({"error": "Error processing image"})
    );
    assert!(!fx.object("cat.png").exists());
    assert!(fx.tmp_is_empty());
}
