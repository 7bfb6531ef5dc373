#![allow(clippy::needless_for_each)]

use crate::{
    storage::Storage,
    validation::{Response as VerifyResponse, Status, Validator},
    ykval::handlers::{health, verify},
};
use anyhow::Result;
use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, Method, Request, Response, StatusCode},
    routing::get,
    Extension, Router,
};
use std::{any::Any, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any as AnyOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug_span, error, info, Span};
use ulid::Ulid;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;

/// Path of the protocol 2.0 endpoint.
pub const VERIFY_PATH: &str = "/wsapi/2.0/verify";

#[derive(OpenApi)]
#[openapi(
    paths(health::health, verify::verify),
    components(schemas(health::Health)),
    tags(
        (name = "ykval", description = "YubiKey OTP validation API"),
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Build the application router.
pub fn router(validator: Arc<Validator>, storage: Arc<dyn Storage>) -> Router {
    let cors = CorsLayer::new()
        // allow `GET` and `POST` when accessing the resource
        .allow_methods([Method::GET, Method::POST])
        // allow requests from any origin
        .allow_origin(AnyOrigin);

    Router::new()
        .route(VERIFY_PATH, get(verify::verify).post(verify::verify))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(cors)
                .layer(Extension(validator)),
        )
        .route("/health", get(health::health).options(health::health))
        .layer(Extension(storage))
}

/// Serve until SIGINT or SIGTERM.
///
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn new(port: u16, validator: Arc<Validator>, storage: Arc<dyn Storage>) -> Result<()> {
    let app = router(validator, storage);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}

// a panic inside a request still answers with a protocol status line
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("request handler panicked: {detail}");

    let mut response = Response::new(Body::from(
        VerifyResponse::unsigned(Status::BackendError).body(),
    ));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let headers = request.headers();
    let path = request.uri().path();
    let request_id = headers
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, ?headers, request_id)
}
