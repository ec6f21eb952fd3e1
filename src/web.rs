//! HTTP boundary: every request is mapped to an app before it reaches a
//! handler, and handlers read the resolved snapshot from request extensions.
use crate::errors::ConfigSourceError;
use crate::model::AppContext;
use crate::settings::Settings;
use crate::source::{ConfigSource, Controller};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use miette::IntoDiagnostic;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config_source: ConfigSource,
}

async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );

    response
}

fn error_response(err: &ConfigSourceError) -> Response {
    let (status, code) = match err {
        ConfigSourceError::AppNotFound(_) => (StatusCode::NOT_FOUND, "app_not_found"),
        ConfigSourceError::NotOpen => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "config_unavailable"),
    };
    (status, Json(json!({ "error": code }))).into_response()
}

/// Resolve the app for the request and attach its `AppContext`.
async fn resolve_app(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    match state.config_source.provide_context(&parts).await {
        Ok(ctx) => {
            let mut request = Request::from_parts(parts, body);
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(e) => {
            if matches!(e, ConfigSourceError::AppNotFound(_)) {
                tracing::debug!(path = %parts.uri.path(), error = %e, "No app for request");
            } else {
                tracing::error!(path = %parts.uri.path(), error = %e, "Failed to resolve app config");
            }
            error_response(&e)
        }
    }
}

async fn app_info(Extension(ctx): Extension<Arc<AppContext>>) -> impl IntoResponse {
    let secrets: Vec<&str> = ctx
        .secret_config()
        .secrets
        .iter()
        .map(|item| item.key.as_str())
        .collect();
    Json(json!({
        "app_id": ctx.app_id,
        "public_origin": ctx.app_config().http.public_origin,
        "domains": ctx.domains,
        "plan_name": ctx.plan_name,
        "secret_keys": secrets,
    }))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    let app_routes = Router::new()
        .route("/_meridian/app", get(app_info))
        .route("/{app_id}/_meridian/app", get(app_info))
        .layer(middleware::from_fn_with_state(state.clone(), resolve_app));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(app_routes)
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

pub async fn serve(settings: Settings, controller: Arc<Controller>) -> miette::Result<()> {
    let state = AppState {
        config_source: controller.config_source(),
    };

    let addr: SocketAddr = settings
        .listen_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;
    let router = router(state);

    tracing::info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
