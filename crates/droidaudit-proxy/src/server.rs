use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::service::{ActionService, RequestBody};

/// All routing happens in [`ActionService::handle`]; the router only adapts HTTP.
pub fn router(service: Arc<ActionService>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    service: Arc<ActionService>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn dispatch(State(service): State<Arc<ActionService>>, request: Request) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let bytes = axum::body::to_bytes(request.into_body(), service.max_body_bytes()).await;
    let body = match &bytes {
        Ok(b) => RequestBody::Bytes(b),
        Err(_) => RequestBody::TooLarge,
    };
    match service.handle(&method, &path, body) {
        Ok(reply) => {
            let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
            (status, Json(reply.body)).into_response()
        }
        Err(err) => {
            tracing::error!(target: "droidaudit.proxy", error = %err, %path, "trace write failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": "trace_unavailable"})),
            )
                .into_response()
        }
    }
}
