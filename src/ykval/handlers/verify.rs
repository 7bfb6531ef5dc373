use crate::validation::{RequestParams, Validator};
use axum::{
    // aliased so utoipa's axum_extras does not infer a request body schema for it
    body::Bytes as RawBody,
    extract::{Extension, RawQuery},
    http::{header, Method},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::debug;

#[utoipa::path(
    method(get, post),
    path= "/wsapi/2.0/verify",
    params(
        ("id" = i32, Query, description = "Client id"),
        ("otp" = String, Query, description = "One-time password, public name followed by 32 modhex characters"),
        ("nonce" = String, Query, description = "16 to 40 alphanumeric characters"),
        ("h" = Option<String>, Query, description = "Base64 HMAC-SHA1 signature of the other parameters"),
        ("timestamp" = Option<i32>, Query, description = "1 to include token counters in the answer"),
        ("sl" = Option<String>, Query, description = "Sync level 0-100, fast or secure"),
        ("timeout" = Option<i32>, Query, description = "Seconds to wait for peers, accepted and ignored")
    ),
    responses (
        (status = 200, description = "Signed CRLF separated key=value lines, the outcome is the status line", body = String, content_type = "text/plain")
    ),
    tag= "ykval"
)]
// axum handler for verify, POST parameters come as a form body
pub async fn verify(
    method: Method,
    RawQuery(query): RawQuery,
    validator: Extension<Arc<Validator>>,
    body: RawBody,
) -> impl IntoResponse {
    let params = RequestParams::extract(method == Method::POST, query.as_deref(), &body);

    let response = validator.0.verify(&params).await;

    debug!("status={}", response.status);

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        response.body(),
    )
}
