// ABOUTME: Cloud Run compute engine for the image edge
// ABOUTME: Authenticates edge calls, computes variants by canonical key and persists them to GCS

mod engine;
mod single_flight;
mod storage;
mod transform;

use crate::engine::{compute_variant, deliver, EngineError, Variant};
use crate::single_flight::SingleFlight;
use crate::storage::{GcsStore, ObjectStore};
use anyhow::{anyhow, Result};
use axum::{
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::FutureExt;
use google_cloud_storage::client::{Client as GcsClient, ClientConfig};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use image_edge::{AuthFailure, CanonicalKey, SharedSecret, DEFAULT_SECRET_HEADER};
use serde::Serialize;
use std::{env, sync::Arc, time::Duration};
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// Configuration
#[derive(Debug)]
struct Config {
    original_bucket: String,
    /// Persistent store for variants; `None` disables persistence
    transformed_bucket: Option<String>,
    transformed_ttl_days: u64,
    cache_control_max_age: u64,
    max_output_bytes: usize,
    secret: Option<SharedSecret>,
    compute_timeout: Duration,
    coalesce: bool,
    log_timing: bool,
    port: u16,
}

impl Config {
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str| {
            get(key)
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false)
        };

        let original_bucket = get("ORIGINAL_BUCKET").ok_or_else(|| anyhow!("ORIGINAL_BUCKET must be set"))?;

        let secret = match get("ORIGIN_SECRET") {
            Some(value) => {
                let header = get("SECRET_HEADER").unwrap_or_else(|| DEFAULT_SECRET_HEADER.to_string());
                Some(SharedSecret::new(&header, &value)?)
            }
            None => None,
        };

        Ok(Self {
            original_bucket,
            transformed_bucket: get("TRANSFORMED_BUCKET"),
            transformed_ttl_days: get("TRANSFORMED_TTL_DAYS").and_then(|v| v.parse().ok()).unwrap_or(90),
            cache_control_max_age: get("CACHE_CONTROL_MAX_AGE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(31_536_000),
            max_output_bytes: get("MAX_OUTPUT_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4_700_000),
            secret,
            compute_timeout: Duration::from_secs(
                get("COMPUTE_TIMEOUT_SECS").and_then(|v| v.parse().ok()).unwrap_or(30),
            ),
            coalesce: flag("COALESCE_COMPUTE"),
            log_timing: flag("LOG_TIMING"),
            port: get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080),
        })
    }

    /// `Cache-Control` for delivered and stored variants
    fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache_control_max_age)
    }
}

// App state shared across handlers
struct AppState {
    store: Arc<dyn ObjectStore>,
    config: Config,
    flights: SingleFlight<Result<Variant, EngineError>>,
}

impl AppState {
    fn new(store: Arc<dyn ObjectStore>, config: Config) -> Self {
        Self {
            store,
            config,
            flights: SingleFlight::default(),
        }
    }
}

// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    persistent_store: bool,
    coalescing: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("cloud_run_transform=info".parse()?),
        )
        .init();

    let config = Config::from_env()?;
    let port = config.port;

    if config.secret.is_none() {
        warn!("ORIGIN_SECRET not set; every transform request will be refused");
    }
    info!(
        original = %config.original_bucket,
        transformed = ?config.transformed_bucket,
        coalesce = config.coalesce,
        "Configuration loaded"
    );

    // Initialize GCS client
    let gcs_config = ClientConfig::default().with_auth().await?;
    let gcs_client = GcsClient::new(gcs_config);

    let state = Arc::new(AppState::new(Arc::new(GcsStore::new(gcs_client)), config));
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!("Starting transform service on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // Use hyper's auto builder which supports both HTTP/1 and HTTP/2
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let app = app.clone();

        tokio::spawn(async move {
            let builder = Builder::new(hyper_util::rt::TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection(
                    io,
                    hyper::service::service_fn(move |req| {
                        let mut app = app.clone();
                        async move { app.call(req).await }
                    }),
                )
                .await
            {
                error!("Connection error: {}", e);
            }
        });
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .fallback(handle_transform)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        persistent_store: state.config.transformed_bucket.is_some(),
        coalescing: state.config.coalesce,
    })
}

/// GET|HEAD /<canonical-key>
async fn handle_transform(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    match process_transform(state, &method, uri.path(), &headers).await {
        Ok(resp) => resp,
        Err(e) => {
            match &e {
                EngineError::MissingSecret | EngineError::InvalidSecret => {
                    warn!(path = %uri.path(), "Rejected transform request: {}", e)
                }
                EngineError::Storage(_) | EngineError::Internal(_) | EngineError::Timeout => {
                    error!(path = %uri.path(), "Transform error: {}", e)
                }
                _ => info!(path = %uri.path(), "Transform refused: {}", e),
            }
            e.into_response()
        }
    }
}

async fn process_transform(
    state: Arc<AppState>,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
) -> Result<Response, EngineError> {
    if method != Method::GET && method != Method::HEAD {
        return Err(EngineError::MethodNotAllowed);
    }

    // Nothing is read or computed before the caller is authenticated
    authorize(&state.config, headers)?;

    let key = CanonicalKey::parse(path)?;
    let variant = tokio::time::timeout(state.config.compute_timeout, run_compute(state.clone(), key))
        .await
        .map_err(|_| EngineError::Timeout)??;

    deliver(&state, variant)
}

fn authorize(config: &Config, headers: &HeaderMap) -> Result<(), EngineError> {
    let Some(secret) = &config.secret else {
        return Err(EngineError::InvalidSecret);
    };
    secret.verify(headers).map_err(|failure| match failure {
        AuthFailure::Missing => EngineError::MissingSecret,
        AuthFailure::Mismatch => EngineError::InvalidSecret,
    })
}

/// Run the computation on its own task so a dropped request does not abort
/// it halfway; with coalescing on, concurrent requests for a key share it.
async fn run_compute(state: Arc<AppState>, key: CanonicalKey) -> Result<Variant, EngineError> {
    let spawn = {
        let state = state.clone();
        let key = key.clone();
        move || {
            async move {
                tokio::spawn(compute_variant(state, key))
                    .await
                    .map_err(|e| EngineError::Internal(format!("compute task failed: {}", e)))?
            }
            .boxed()
        }
    };

    if state.config.coalesce {
        state.flights.run(key.as_str(), spawn).await
    } else {
        spawn().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transform::fixture;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sha2::Digest;
    use std::collections::HashMap;
    use tower::ServiceExt;

    const SECRET: &str = "s3cr3t";

    fn test_config(overrides: &[(&str, &str)]) -> Config {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("ORIGINAL_BUCKET".into(), "originals".into());
        vars.insert("TRANSFORMED_BUCKET".into(), "variants".into());
        vars.insert("ORIGIN_SECRET".into(), SECRET.into());
        for (k, v) in overrides {
            vars.insert(k.to_string(), v.to_string());
        }
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    fn setup(store: MemoryStore, config: Config) -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(store);
        store.insert(
            "originals",
            "cat.png",
            fixture(64, 32, image::ImageFormat::Png),
            "image/png",
        );
        let state = Arc::new(AppState::new(store.clone(), config));
        (build_router(state), store)
    }

    fn get(path: &str, secret: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(secret) = secret {
            builder = builder.header(DEFAULT_SECRET_HEADER, secret);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(|key| (key == "ORIGINAL_BUCKET").then(|| "originals".to_string())).unwrap();
        assert_eq!(config.transformed_bucket, None);
        assert_eq!(config.transformed_ttl_days, 90);
        assert_eq!(config.cache_control_max_age, 31_536_000);
        assert_eq!(config.max_output_bytes, 4_700_000);
        assert_eq!(config.compute_timeout, Duration::from_secs(30));
        assert_eq!(config.port, 8080);
        assert!(config.secret.is_none());
        assert!(!config.coalesce);
        assert!(!config.log_timing);
        assert_eq!(config.cache_control(), "public, max-age=31536000");

        assert!(Config::from_lookup(|_| None).is_err());
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = setup(MemoryStore::default(), test_config(&[]));
        let resp = app.oneshot(get("/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["persistent_store"], true);
    }

    #[tokio::test]
    async fn test_auth_checked_before_any_read() {
        let (app, store) = setup(MemoryStore::default(), test_config(&[]));

        let resp = app
            .clone()
            .oneshot(get("/cat.png/width=10", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(get("/cat.png/width=10", Some("guess")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(resp.headers()["cache-control"], "no-store");

        // Malformed keys are still refused for auth first
        let resp = app.oneshot(get("/cat.png/bogus", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(store.reads(), 0);
    }

    #[tokio::test]
    async fn test_no_configured_secret_fails_closed() {
        let mut config = test_config(&[]);
        config.secret = None;
        let (app, store) = setup(MemoryStore::default(), config);

        let resp = app.oneshot(get("/cat.png/width=10", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test]
    async fn test_malformed_key_is_bad_request() {
        let (app, store) = setup(MemoryStore::default(), test_config(&[]));
        for path in ["/cat.png/width=300,format=webp", "/cat.png/format=auto", "/original", "/cat.png/"] {
            let resp = app.clone().oneshot(get(path, Some(SECRET))).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", path);
        }
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test]
    async fn test_missing_original_is_not_found() {
        let (app, _) = setup(MemoryStore::default(), test_config(&[]));
        let resp = app.oneshot(get("/dog.png/width=10", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(body["error"], "image not found");
    }

    #[tokio::test]
    async fn test_transform_inline_and_persist() {
        let (app, store) = setup(MemoryStore::default(), test_config(&[]));

        let resp = app
            .oneshot(get("/cat.png/format=webp,width=32,height=32", Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "image/webp");
        assert_eq!(resp.headers()["cache-control"], "public, max-age=31536000");
        assert_eq!(resp.headers()["x-image-edge"], "v1.0");
        assert!(resp.headers().get("server-timing").is_none());
        let etag = resp.headers()["etag"].to_str().unwrap().to_string();

        let body = body_bytes(resp).await;
        let img = image::load_from_memory(&body).unwrap();
        assert_eq!((img.width(), img.height()), (32, 32));
        assert_eq!(etag, format!("\"{}\"", hex::encode(sha2::Sha256::digest(&body))));

        let stored = store
            .object("variants", "cat.png/format=webp,width=32,height=32")
            .expect("variant should be persisted");
        assert_eq!(stored.bytes.as_ref(), body.as_slice());
        assert_eq!(stored.content_type, "image/webp");
        assert_eq!(stored.cache_control, "public, max-age=31536000");
        assert_eq!(stored.metadata["source-path"], "cat.png");
        assert!(stored.metadata.contains_key("expires-at"));
    }

    #[tokio::test]
    async fn test_encoded_asset_name() {
        let (app, store) = setup(MemoryStore::default(), test_config(&[]));
        store.insert(
            "originals",
            "my cat.png",
            fixture(8, 8, image::ImageFormat::Png),
            "image/png",
        );

        let resp = app
            .clone()
            .oneshot(get("/my%20cat.png/width=4", Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let stored = store
            .object("variants", "my cat.png/width=4")
            .expect("variant should be stored under the decoded name");
        assert_eq!(stored.metadata["source-path"], "my cat.png");

        let resp = app.oneshot(get("/bad%FF.png/width=4", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_original_passthrough() {
        let (app, store) = setup(MemoryStore::default(), test_config(&[]));
        let original = store.object("originals", "cat.png").unwrap().bytes;

        let resp = app.oneshot(get("/cat.png/original", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "image/png");
        assert_eq!(body_bytes(resp).await, original.to_vec());
        assert!(store.object("variants", "cat.png/original").is_some());
    }

    #[tokio::test]
    async fn test_oversize_redirects_to_stored_variant() {
        let (app, store) = setup(MemoryStore::default(), test_config(&[("MAX_OUTPUT_BYTES", "10")]));

        let resp = app
            .oneshot(get("/cat.png/format=png,width=64", Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()["location"], "/cat.png?format=png&width=64");
        assert_eq!(resp.headers()["cache-control"], "private, no-store");
        assert!(store.object("variants", "cat.png/format=png,width=64").is_some());
    }

    #[tokio::test]
    async fn test_oversize_without_store_is_payload_too_large() {
        let mut config = test_config(&[("MAX_OUTPUT_BYTES", "10")]);
        config.transformed_bucket = None;
        let (app, _) = setup(MemoryStore::default(), config);

        let resp = app.oneshot(get("/cat.png/width=64", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_oversize_with_failed_persist_is_payload_too_large() {
        let (app, _) = setup(MemoryStore::failing_writes(), test_config(&[("MAX_OUTPUT_BYTES", "10")]));
        let resp = app.oneshot(get("/cat.png/width=64", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_failed_persist_still_serves_inline() {
        let (app, _) = setup(MemoryStore::failing_writes(), test_config(&[]));
        let resp = app.oneshot(get("/cat.png/width=16", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_undecodable_original_is_unprocessable() {
        let (app, store) = setup(MemoryStore::default(), test_config(&[]));
        store.insert("originals", "broken.png", b"not a png".to_vec(), "image/png");

        let resp = app.oneshot(get("/broken.png/width=10", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert!(body["error"].as_str().unwrap().contains("decode"));
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let (app, _) = setup(MemoryStore::default(), test_config(&[]));
        let req = Request::builder()
            .method(Method::POST)
            .uri("/cat.png/width=10")
            .header(DEFAULT_SECRET_HEADER, SECRET)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()["allow"], "GET, HEAD");
    }

    #[tokio::test]
    async fn test_server_timing_when_enabled() {
        let (app, _) = setup(MemoryStore::default(), test_config(&[("LOG_TIMING", "true")]));
        let resp = app.oneshot(get("/cat.png/width=16", Some(SECRET))).await.unwrap();
        let timing = resp.headers()["server-timing"].to_str().unwrap();
        assert!(timing.starts_with("download;dur="));
        assert!(timing.contains("transform;dur="));
        assert!(timing.contains("upload;dur="));
    }

    #[tokio::test]
    async fn test_timeout_is_gateway_timeout() {
        let mut config = test_config(&[]);
        config.compute_timeout = Duration::from_millis(10);
        let (app, _) = setup(MemoryStore::with_read_delay(Duration::from_millis(200)), config);

        let resp = app.oneshot(get("/cat.png/width=16", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_coalesced_requests_share_one_computation() {
        let (app, store) = setup(
            MemoryStore::with_read_delay(Duration::from_millis(50)),
            test_config(&[("COALESCE_COMPUTE", "true")]),
        );

        let (a, b) = tokio::join!(
            app.clone().oneshot(get("/cat.png/width=16", Some(SECRET))),
            app.clone().oneshot(get("/cat.png/width=16", Some(SECRET))),
        );
        assert_eq!(a.unwrap().status(), StatusCode::OK);
        assert_eq!(b.unwrap().status(), StatusCode::OK);
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_coalesced_request_leaves_no_flight() {
        let mut config = test_config(&[("COALESCE_COMPUTE", "true")]);
        config.compute_timeout = Duration::from_millis(10);
        let store = Arc::new(MemoryStore::with_read_delay(Duration::from_millis(100)));
        store.insert(
            "originals",
            "cat.png",
            fixture(16, 16, image::ImageFormat::Png),
            "image/png",
        );
        let state = Arc::new(AppState::new(store.clone(), config));
        let app = build_router(state.clone());

        let resp = app.oneshot(get("/cat.png/width=8", Some(SECRET))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(state.flights.in_flight(), 0);
        assert!(store.object("variants", "cat.png/width=8").is_some());
    }

    #[tokio::test]
    async fn test_without_coalescing_each_request_computes() {
        let (app, store) = setup(
            MemoryStore::with_read_delay(Duration::from_millis(50)),
            test_config(&[]),
        );

        let (a, b) = tokio::join!(
            app.clone().oneshot(get("/cat.png/width=16", Some(SECRET))),
            app.clone().oneshot(get("/cat.png/width=16", Some(SECRET))),
        );
        assert_eq!(a.unwrap().status(), StatusCode::OK);
        assert_eq!(b.unwrap().status(), StatusCode::OK);
        assert_eq!(store.reads(), 2);
    }
}
