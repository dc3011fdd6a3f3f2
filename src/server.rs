//! Request orchestrator: routing, admission control, the cache-first read
//! path and the upload path with its eager fan-out.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use image::DynamicImage;
use tokio::sync::Semaphore;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;

use crate::auth::{self, Permissions, GET_PERMISSION, UPLOAD_PERMISSION};
use crate::cache::CacheManager;
use crate::codec::{self, ImageFormat};
use crate::config::Config;
use crate::error::Error;
use crate::metadata::MetaStore;
use crate::params::{self, Params};
use crate::storage::Storage;
use crate::transform::Engine;

/// Multipart field carrying the uploaded file.
pub const UPLOAD_FIELD_NAME: &str = "photo";

/// Cap on concurrent eager upload transformations.
pub const UPLOAD_WORKERS: usize = 4;

/// Process-wide application context, constructed at startup and shared by
/// every handler. Reconfiguration requires a restart.
pub struct App {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub meta: Arc<dyn MetaStore>,
    pub cache: CacheManager,
    pub engine: Engine,
    pub permissions: Permissions,
    pub upload_pool: Arc<Semaphore>,
}

pub type SharedApp = Arc<App>;

/// Builds the service router. Throttling is keyed by remote address and
/// skipped entirely when the configured rate is 0.
pub fn router(app: SharedApp) -> Router {
    let mut router = Router::new()
        .route("/image/:parameters/*path", get(serve_image))
        .route("/:apikey/image/:parameters/*path", get(serve_image_with_key))
        .route("/upload", post(upload))
        .route("/:apikey/upload", post(upload_with_key))
        .with_state(app.clone())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // The upload cap is enforced by the streaming reader, not
                // the framework body limit.
                .layer(DefaultBodyLimit::disable()),
        );

    let rate = app.config.throttling_rate;
    if rate > 0 {
        let governor_config = GovernorConfigBuilder::default()
            .period(Duration::from_secs(60) / rate)
            .burst_size(rate)
            .finish();
        match governor_config {
            Some(config) => {
                tracing::info!(rate, "throttling enabled per remote address");
                router = router.layer(GovernorLayer {
                    config: Box::leak(Box::new(config)),
                });
            }
            None => tracing::warn!("invalid throttling configuration, throttling disabled"),
        }
    }

    router
}

async fn serve_image(
    State(app): State<SharedApp>,
    UrlPath((parameters, path)): UrlPath<(String, String)>,
) -> Result<Response, Error> {
    handle_image(app, "", &parameters, &path).await
}

async fn serve_image_with_key(
    State(app): State<SharedApp>,
    UrlPath((apikey, parameters, path)): UrlPath<(String, String, String)>,
) -> Result<Response, Error> {
    if !auth::looks_like_key(&apikey) {
        return Err(Error::Unauthorized);
    }
    handle_image(app, &apikey, &parameters, &path).await
}

async fn upload(State(app): State<SharedApp>, multipart: Multipart) -> Result<Response, Error> {
    handle_upload(app, "", multipart).await
}

async fn upload_with_key(
    State(app): State<SharedApp>,
    UrlPath(apikey): UrlPath<String>,
    multipart: Multipart,
) -> Result<Response, Error> {
    if !auth::looks_like_key(&apikey) {
        return Err(Error::Unauthorized);
    }
    handle_upload(app, &apikey, multipart).await
}

/// The read path: permission gate, descriptor resolution, cache-first
/// lookup, then transform-and-respond with a background cache insert.
async fn handle_image(
    app: SharedApp,
    key: &str,
    parameters: &str,
    path: &str,
) -> Result<Response, Error> {
    if !app.permissions.has_permission(key, GET_PERMISSION) {
        return Err(Error::Unauthorized);
    }

    let (base_path, scale) = base_and_scale(&app.config, path);
    let mut params = resolve_params(&app.config, parameters)?;
    params.scale = scale;

    let derived_path = params::derived_path(&base_path, &params.fingerprint());

    if let Some((bytes, format)) = app.cache.lookup(&derived_path).await {
        tracing::debug!(path = %derived_path, "cache hit");
        return Ok(image_response(bytes, format));
    }

    if !app.storage.exists(&base_path).await {
        return Err(Error::NotFound(base_path));
    }

    // The transformation runs in its own task so that a client hanging up
    // cannot abandon it half way: the cache still gets populated, only the
    // response write is lost.
    let task = {
        let app = app.clone();
        tokio::spawn(async move {
            let source = app.storage.get(&base_path).await?;
            // A stored source that no longer decodes is a server-side
            // fault, not a client error.
            let (img, format) =
                codec::decode(&source).map_err(|e| Error::Internal(e.to_string()))?;
            let output = app.engine.apply(img, &params).await?;
            let body = codec::encode(&output, format, app.config.jpeg_quality)?;

            // The response does not wait for the cache to be populated.
            let cache = app.cache.clone();
            let insert_path = derived_path.clone();
            tokio::spawn(async move {
                if let Err(e) = cache.insert(&insert_path, &output, format).await {
                    tracing::warn!(path = %insert_path, "background cache insert failed: {e}");
                }
            });

            Ok::<_, Error>((body, format))
        })
    };
    let (body, format) = task
        .await
        .map_err(|e| Error::Internal(format!("transformation task failed: {e}")))??;

    Ok(image_response(Bytes::from(body), format))
}

/// The upload path: permission gate, size-capped multipart read, decode
/// validation, source store and eager fan-out.
async fn handle_upload(app: SharedApp, key: &str, multipart: Multipart) -> Result<Response, Error> {
    if !app.permissions.has_permission(key, UPLOAD_PERMISSION) {
        return Err(Error::Unauthorized);
    }

    let data = read_photo_field(multipart, app.config.upload_max_file_size).await?;
    let (img, format) = codec::decode(&data)?;

    let base_path = format!("{}.{}", Utc::now().timestamp(), format.ext());

    if app.config.async_uploads {
        let storage = app.storage.clone();
        let path = base_path.clone();
        let bytes = data.clone();
        tokio::spawn(async move {
            if let Err(e) = storage.put(&path, &bytes, format.content_type()).await {
                tracing::error!(path = %path, "async source store failed: {e}");
            }
        });
    } else {
        app.storage
            .put(&base_path, &data, format.content_type())
            .await?;
    }

    spawn_eager_transformations(&app, base_path, img, format);

    Ok(StatusCode::OK.into_response())
}

/// Materialises every configured eager transformation in the background,
/// bounded by the upload worker pool. Failures are logged and dropped.
fn spawn_eager_transformations(
    app: &SharedApp,
    base_path: String,
    img: DynamicImage,
    format: ImageFormat,
) {
    for eager_params in app.config.eager_transformations() {
        let app = app.clone();
        let base_path = base_path.clone();
        let img = img.clone();
        tokio::spawn(async move {
            let _permit = match app.upload_pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let derived_path = params::derived_path(&base_path, &eager_params.fingerprint());
            match app.engine.apply(img, &eager_params).await {
                Ok(output) => {
                    if let Err(e) = app.cache.insert(&derived_path, &output, format).await {
                        tracing::warn!(path = %derived_path, "eager cache insert failed: {e}");
                    }
                }
                Err(e) => tracing::warn!(path = %derived_path, "eager transformation failed: {e}"),
            }
        });
    }
}

/// Resolves the parameter segment: a configured named transformation wins,
/// an unknown name is rejected, anything else parses as a custom
/// descriptor when those are allowed.
fn resolve_params(config: &Config, parameters: &str) -> Result<Params, Error> {
    if let Some(params) = config.preset(parameters) {
        return Ok(params);
    }
    if params::is_transformation_name(parameters) {
        return Err(Error::UnknownPreset(parameters.to_string()));
    }
    if !config.allow_custom_transformations {
        return Err(Error::InvalidParameter(
            "custom transformations are disabled".to_string(),
        ));
    }
    Params::parse(parameters)
}

/// Splits the scale suffix off the path; the suffix is always parsed, but
/// clamps to 1 when custom scaling is disabled.
fn base_and_scale(config: &Config, path: &str) -> (String, u32) {
    let (base, scale) = params::parse_base_path_and_scale(path);
    if config.allow_custom_scale {
        (base, scale)
    } else {
        (base, 1)
    }
}

/// Reads the upload's file part through a size cap; at most one chunk past
/// the limit is ever buffered.
async fn read_photo_field(mut multipart: Multipart, max_bytes: u64) -> Result<Bytes, Error> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidParameter(e.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD_NAME) {
            continue;
        }
        let mut data = BytesMut::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| Error::InvalidParameter(e.to_string()))?
        {
            append_limited(&mut data, &chunk, max_bytes)?;
        }
        return Ok(data.freeze());
    }
    Err(Error::InvalidParameter("missing photo field".to_string()))
}

fn append_limited(data: &mut BytesMut, chunk: &[u8], max_bytes: u64) -> Result<(), Error> {
    if data.len() as u64 + chunk.len() as u64 > max_bytes {
        return Err(Error::OversizeUpload);
    }
    data.extend_from_slice(chunk);
    Ok(())
}

fn image_response(bytes: Bytes, format: ImageFormat) -> Response {
    ([(header::CONTENT_TYPE, format.content_type())], bytes).into_response()
}
