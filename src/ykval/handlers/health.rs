use crate::{storage::Storage, GIT_COMMIT_HASH};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info_span, Instrument};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Database is healthy", body = [Health]),
        (status = 503, description = "Database is unhealthy", body = [Health])
    ),
    tag= "health"
)]
// axum handler for health
pub async fn health(method: Method, storage: Extension<Arc<dyn Storage>>) -> impl IntoResponse {
    let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
    let result = storage.0.ping().instrument(ping_span).await.map_err(|error| {
        error!("Failed to ping database: {}", error);

        StatusCode::SERVICE_UNAVAILABLE
    });

    // Create a health struct
    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if result.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let headers = format!("{}:{}:{}", health.name, health.version, short_hash)
        .parse::<HeaderValue>()
        .map(|x_app_header_value| {
            debug!("X-App header: {:?}", x_app_header_value);

            let mut headers = HeaderMap::new();

            headers.insert("X-App", x_app_header_value);

            headers
        })
        .map_err(|err| {
            error!("Failed to parse X-App header: {}", err);
        });

    let headers = headers.unwrap_or_else(|()| HeaderMap::new());

    match result {
        Ok(()) => {
            debug!("Database connection is healthy");
            (StatusCode::OK, headers, body)
        }
        Err(status) => {
            debug!("Database connection is unhealthy");
            (status, headers, body)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use axum::{body::to_bytes, response::Response};

    async fn call(method: Method, storage: Arc<MemoryStorage>) -> Response {
        let storage: Arc<dyn Storage> = storage;
        health(method, Extension(storage)).await.into_response()
    }

    #[tokio::test]
    async fn healthy_store_answers_ok() {
        let response = call(Method::GET, Arc::new(MemoryStorage::new())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let x_app = response.headers().get("X-App").unwrap().to_str().unwrap();
        assert!(x_app.starts_with(concat!(env!("CARGO_PKG_NAME"), ":", env!("CARGO_PKG_VERSION"))));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: Health = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.database, "ok");
        assert_eq!(health.name, env!("CARGO_PKG_NAME"));
    }

    #[tokio::test]
    async fn failing_store_is_unavailable() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_unavailable(true);

        let response = call(Method::GET, storage).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: Health = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.database, "error");
    }

    #[tokio::test]
    async fn options_has_empty_body() {
        let response = call(Method::OPTIONS, Arc::new(MemoryStorage::new())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("X-App"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }
}
