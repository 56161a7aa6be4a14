// ABOUTME: Fastly Compute entry point for the image edge
// ABOUTME: Normalizes each request, then routes it to the GCS store or the Cloud Run compute engine

use fastly::http::{header, Method, StatusCode};
use fastly::{Error, Request, Response};
use image_edge::fallback::{ServedBy, EXPIRES_AT_HEADER};
use image_edge::response::{cors_preflight_headers, stamp_response};
use image_edge::{
    normalize, parse_expires_at, EdgeConfig, EdgeError, FallbackRouter, Origin, OriginError, OriginRequest, OriginResponse,
    RawRequest, ResponseHeaders, MARKER_HEADER, PROTOCOL_VERSION,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Fastly config store holding the edge settings
const CONFIG_STORE_NAME: &str = "image_edge_config";
/// Fastly secret store holding the shared secret
const SECRET_STORE_NAME: &str = "image_edge_secrets";
const SECRET_KEY: &str = "origin_secret";

/// Backend serving the transformed-variant bucket
const GCS_BACKEND: &str = "gcs_transformed";
/// Backend for the Cloud Run compute engine
const COMPUTE_BACKEND: &str = "cloud_run_transform";

/// Entry point
#[fastly::main]
fn main(req: Request) -> std::result::Result<Response, Error> {
    init_logging();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Edge configuration invalid");
            return Ok(error_response(&e, false));
        }
    };

    match handle_request(req, &config) {
        Ok(resp) => Ok(resp),
        Err(e) => Ok(error_response(&e, config.cors_enabled)),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("image_edge=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn load_config() -> Result<EdgeConfig, EdgeError> {
    let store = fastly::config_store::ConfigStore::open(CONFIG_STORE_NAME);
    let config = EdgeConfig::from_lookup(|key| store.get(key), get_secret(SECRET_STORE_NAME, SECRET_KEY))?;
    Ok(config)
}

/// Trimmed, non-empty UTF-8 value of `key` in the secret store `store_name`
fn get_secret(store_name: &str, key: &str) -> Option<String> {
    let store = fastly::secret_store::SecretStore::open(store_name).ok()?;
    let plaintext = store.get(key)?.plaintext();
    let value = std::str::from_utf8(&plaintext).ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Route and handle the request
fn handle_request(req: Request, config: &EdgeConfig) -> Result<Response, EdgeError> {
    let method = req.get_method().clone();
    let path = req.get_path().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/version") => Ok(Response::from_status(StatusCode::OK)
            .with_header(MARKER_HEADER, PROTOCOL_VERSION)
            .with_header(header::CACHE_CONTROL, "no-store")
            .with_body(format!("image-edge {}", PROTOCOL_VERSION))),

        (Method::OPTIONS, _) if config.cors_enabled => {
            let mut resp = EdgeResponse(Response::from_status(StatusCode::NO_CONTENT));
            cors_preflight_headers(&mut resp);
            Ok(resp.0)
        }

        (Method::GET, "/") | (Method::HEAD, "/") => Err(EdgeError::NotFound("Not found".into())),

        (Method::GET, _) | (Method::HEAD, _) => handle_image(&req, config),

        (m, _) => Err(EdgeError::MethodNotAllowed(format!("{} not allowed", m))),
    }
}

/// GET|HEAD /<path>?<params> - serve an image variant
fn handle_image(req: &Request, config: &EdgeConfig) -> Result<Response, EdgeError> {
    let accept = req.get_header(header::ACCEPT).and_then(|v| v.to_str().ok());
    let raw = RawRequest::new(req.get_path(), req.get_query_str(), accept);
    let normalized = normalize(&raw, config.auto_format);
    normalized
        .key
        .object_name()
        .map_err(|e| EdgeError::BadRequest(e.to_string()))?;

    let method = req.get_method().clone();
    let primary = config.transformed_bucket.as_deref().map(|bucket| GcsOrigin {
        host: &config.primary_host,
        bucket,
        method: method.clone(),
    });
    let compute = ComputeOrigin {
        host: &config.compute_host,
        method,
    };

    let router = FallbackRouter::new(primary, compute, &config.fallback, &config.secret);
    let routed = router.route(&normalized)?;

    let terminal = routed.terminal();
    let source = routed.source;
    let mut resp = routed.response;
    info!(
        key = %normalized.key,
        status = %resp.status(),
        compute = source == ServedBy::Compute,
        terminal = ?terminal,
        "Served"
    );

    stamp_response(&mut resp, config, normalized.negotiated);
    Ok(resp.0)
}

/// Fastly response seen through the router's response traits
struct EdgeResponse(Response);

impl OriginResponse for EdgeResponse {
    fn status(&self) -> http::StatusCode {
        http::StatusCode::from_u16(self.0.get_status().as_u16()).unwrap_or(http::StatusCode::BAD_GATEWAY)
    }

    fn expires_at(&self) -> Option<u64> {
        self.0
            .get_header(EXPIRES_AT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_expires_at)
    }
}

impl ResponseHeaders for EdgeResponse {
    fn header_str(&self, name: &str) -> Option<String> {
        self.0
            .get_header(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn set_header_str(&mut self, name: &str, value: &str) {
        self.0.set_header(name, value);
    }

    fn remove_header(&mut self, name: &str) {
        self.0.remove_header(name);
    }

    fn header_names(&self) -> Vec<String> {
        self.0
            .get_header_names()
            .map(|name| name.as_str().to_string())
            .collect()
    }
}

/// Transformed bucket on GCS, addressed by object name
struct GcsOrigin<'a> {
    host: &'a str,
    bucket: &'a str,
    method: Method,
}

impl Origin for GcsOrigin<'_> {
    type Response = EdgeResponse;

    fn name(&self) -> &str {
        GCS_BACKEND
    }

    fn fetch(&self, request: OriginRequest<'_>) -> Result<EdgeResponse, OriginError> {
        let object = request
            .key
            .object_url_path()
            .map_err(|e| OriginError::Transport(e.to_string()))?;
        let url = format!("https://{}/{}/{}", self.host, self.bucket, object);
        let mut backend_req = Request::new(self.method.clone(), url);
        backend_req.set_header("Host", self.host);
        apply_headers(&mut backend_req, &request.headers);
        backend_req.send(GCS_BACKEND).map(EdgeResponse).map_err(send_error)
    }
}

/// Cloud Run compute engine, addressed by canonical path
struct ComputeOrigin<'a> {
    host: &'a str,
    method: Method,
}

impl Origin for ComputeOrigin<'_> {
    type Response = EdgeResponse;

    fn name(&self) -> &str {
        COMPUTE_BACKEND
    }

    fn fetch(&self, request: OriginRequest<'_>) -> Result<EdgeResponse, OriginError> {
        let url = format!("https://{}{}", self.host, request.key);
        let mut backend_req = Request::new(self.method.clone(), url);
        backend_req.set_header("Host", self.host);
        apply_headers(&mut backend_req, &request.headers);
        backend_req.send(COMPUTE_BACKEND).map(EdgeResponse).map_err(send_error)
    }
}

fn apply_headers(req: &mut Request, headers: &http::HeaderMap) {
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            req.set_header(name.as_str(), value);
        }
    }
}

fn send_error(e: fastly::http::request::SendError) -> OriginError {
    let msg = e.to_string();
    if msg.to_ascii_lowercase().contains("timeout") {
        OriginError::Timeout(msg)
    } else {
        OriginError::Transport(msg)
    }
}

/// Create error response
fn error_response(error: &EdgeError, cors: bool) -> Response {
    let mut resp = EdgeResponse(Response::from_status(error.status_code().as_u16()));
    resp.set_header_str(header::CONTENT_TYPE.as_str(), "application/json");
    resp.set_header_str(header::CACHE_CONTROL.as_str(), "no-store");
    resp.set_header_str(MARKER_HEADER, PROTOCOL_VERSION);
    if matches!(error, EdgeError::MethodNotAllowed(_)) {
        resp.set_header_str(header::ALLOW.as_str(), "GET, HEAD, OPTIONS");
    }
    if cors {
        image_edge::response::add_cors_headers(&mut resp);
    }
    resp.0.set_body(error.to_json());
    resp.0
}
