use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::body::HttpBody;
use hyper::{header, Body, Method, Request, Response, Server, StatusCode, Uri};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::error::Error;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

use cifar_serve::{
    config, DirStore, HandlerConfig, ImageClassifier, ImageProcessor, LabelSet, ObjectStore,
    S3Store, StoreConfig,
};

const PROCESS_ROUTE: &str = "/process_image";
const LEGACY_PROCESS_ROUTE: &str = "/api/process_image";

/// Largest accepted `POST` body; requests only carry a file name
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Bucket used with `--local-store` when `S3_BUCKET` is unset
const LOCAL_BUCKET: &str = "images";

#[derive(StructOpt, Debug)]
#[structopt(
    name = "cifar-server",
    about = "HTTP service classifying images stored in S3 with a CIFAR-100 model"
)]
struct CmdArgs {
    #[structopt(
        long,
        env = "MODEL_DIR",
        default_value = "image_recognition_model",
        help = "Export directory of the TensorFlow SavedModel"
    )]
    model_dir: PathBuf,

    #[structopt(long, help = "Label file, one label per line (defaults to CIFAR-100)")]
    labels: Option<PathBuf>,

    #[structopt(long, default_value = "0.0.0.0")]
    host: String,

    #[structopt(long, env = "PORT", default_value = "5001")]
    port: u16,

    #[structopt(long, default_value = ".env.local", help = "Environment file to load")]
    env_file: PathBuf,

    #[structopt(
        long,
        default_value = "",
        help = "Prefix for result keys, e.g. `results/`"
    )]
    results_prefix: String,

    #[structopt(long, help = "Directory to stage downloads in (defaults to the system temp dir)")]
    tmp_dir: Option<PathBuf>,

    #[structopt(
        long,
        help = "Serve buckets from this local directory instead of S3"
    )]
    local_store: Option<PathBuf>,
}

/// Parses `argv`, then parses again once the env file is loaded so that
/// variables it defines feed the `env` fallbacks.
fn load_args<I>(argv: I) -> CmdArgs
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
    let args = CmdArgs::from_iter(argv.clone());

    if config::load_env_file(&args.env_file) {
        CmdArgs::from_iter(argv)
    } else {
        args
    }
}

#[derive(Deserialize)]
struct ProcessRequest {
    filename: String,
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );

    response
}

fn preflight() -> Response<Body> {
    let mut response = json_response(StatusCode::NO_CONTENT, json!(null));
    *response.body_mut() = Body::empty();

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        header::HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        header::HeaderValue::from_static("*"),
    );

    response
}

fn validate(filename: String) -> Result<String, String> {
    if filename.trim().is_empty() {
        return Err("`filename` must not be empty".to_owned());
    }

    Ok(filename)
}

fn filename_from_body(raw: &[u8]) -> Result<String, String> {
    let request: ProcessRequest =
        serde_json::from_slice(raw).map_err(|e| format!("invalid request body: {}", e))?;

    validate(request.filename)
}

fn filename_from_query(uri: &Uri) -> Result<String, String> {
    let query = uri.query().unwrap_or("");

    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "filename")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| "missing `filename` query parameter".to_owned())
        .and_then(validate)
}

fn start(processor: &Arc<ImageProcessor>, filename: Result<String, String>) -> Response<Body> {
    match filename {
        Err(why) => {
            warn!("Rejected request: {}", why);
            json_response(StatusCode::BAD_REQUEST, json!({ "error": why }))
        }
        Ok(filename) => {
            info!("Accepted {}", filename);
            // Fire and forget: the outcome only shows up in the bucket.
            drop(processor.spawn(filename));
            json_response(StatusCode::OK, json!({ "message": "Processing started" }))
        }
    }
}

async fn read_body(mut body: Body) -> Result<Vec<u8>, Response<Body>> {
    let too_large = || {
        json_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            json!({ "error": format!("request body exceeds {} bytes", MAX_BODY_BYTES) }),
        )
    };

    if body.size_hint().lower() > MAX_BODY_BYTES as u64 {
        return Err(too_large());
    }

    let mut raw = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| {
            json_response(
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("could not read request body: {}", e) }),
            )
        })?;

        if raw.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(too_large());
        }
        raw.extend_from_slice(&chunk);
    }

    Ok(raw)
}

async fn handle(
    req: Request<Body>,
    processor: Arc<ImageProcessor>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, PROCESS_ROUTE) => match read_body(req.into_body()).await {
            Ok(raw) => start(&processor, filename_from_body(&raw)),
            Err(response) => response,
        },
        (&Method::GET, LEGACY_PROCESS_ROUTE) => {
            let filename = filename_from_query(req.uri());
            start(&processor, filename)
        }
        (&Method::OPTIONS, PROCESS_ROUTE) | (&Method::OPTIONS, LEGACY_PROCESS_ROUTE) => {
            preflight()
        }
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })),
    };

    Ok(response)
}

async fn build_store(
    args: &CmdArgs,
) -> Result<(Arc<dyn ObjectStore>, String), Box<dyn Error>> {
    if let Some(root) = &args.local_store {
        let bucket = std::env::var(config::BUCKET_VAR).unwrap_or_else(|_| LOCAL_BUCKET.to_owned());
        info!("Using local store at {:?}, bucket {}", root, bucket);
        return Ok((Arc::new(DirStore::new(root)), bucket));
    }

    let store_config = StoreConfig::from_env()?;
    info!(
        "Using S3 bucket {} in {}",
        store_config.bucket, store_config.region
    );

    let store = S3Store::connect(&store_config).await;
    Ok((Arc::new(store), store_config.bucket))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = load_args(std::env::args_os());

    let labels = match &args.labels {
        Some(path) => LabelSet::from_file(path)?,
        None => LabelSet::cifar100(),
    };

    let classifier = ImageClassifier::with_classes(&args.model_dir, labels.len())?;
    info!("Loaded model from {:?}", args.model_dir);

    let (store, bucket) = build_store(&args).await?;

    let mut handler_config = HandlerConfig::new(&bucket);
    handler_config.results_prefix = args.results_prefix.clone();
    if let Some(tmp_dir) = &args.tmp_dir {
        handler_config.tmp_dir = tmp_dir.clone();
    }

    let processor = Arc::new(ImageProcessor::new(
        store,
        Arc::new(classifier),
        labels,
        handler_config,
    ));

    let make_service = make_service_fn(move |_conn: &AddrStream| {
        let processor = Arc::clone(&processor);

        let service = service_fn(move |req| handle(req, processor.clone()));

        async move { Ok::<_, Infallible>(service) }
    });

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!("Listening on http://{}", addr);

    let server = Server::bind(&addr)
        .serve(make_service)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
            }
        });

    if let Err(e) = server.await {
        error!("server error: {}", e);
    }

    Ok(())
}
