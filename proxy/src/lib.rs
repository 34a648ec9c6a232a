//! Caching HTTP front for the RUZ schedule API.
//!
//! Serves `/api/*` from a response cache in front of the upstream, group
//! suggestions from the snapshot written by `build-index`, and the frontend
//! bundle for every other path.

pub mod api;
pub mod cache;
pub mod config;
pub mod errors;
pub mod metrics_defs;

use crate::api::ApiState;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::errors::ProxyError;
use axum::Router;
use groups::{GroupSuggest, SnapshotStore};
use http::header::{ACCEPT, HeaderMap};
use http::{HeaderValue, Method};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use shared::upstream::{RetryPolicy, Upstream, UpstreamClient};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};

/// Builds the public router: API routes with CORS, then the frontend with an
/// `index.html` fallback for client-side routes.
pub fn build_app(config: &Config, upstream: Arc<dyn Upstream>) -> Router {
    let cache = ResponseCache::new(
        config.cache.ttl(),
        config.cache.max_entries,
        config.cache.stale_ttl(),
    );

    let groups = GroupSuggest::new(SnapshotStore::new(&config.groups_index_path));
    groups.reload();

    let state = ApiState::new(
        upstream,
        Arc::new(cache),
        Arc::new(groups),
        config.upstream.base_url.clone(),
        config.cache.upstream_cache_secs,
    );

    let frontend = ServeDir::new(&config.frontend_dist)
        .fallback(ServeFile::new(config.frontend_dist.join("index.html")));

    api::routes(state)
        .layer(cors_layer(&config.cors_origins))
        .fallback_service(frontend)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods([Method::GET]);
    if origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(AllowOrigin::any());
    }

    // Origins are checked by `Config::validate`
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    cors.allow_origin(AllowOrigin::list(origins))
}

pub fn upstream_client(config: &Config) -> Result<UpstreamClient, ProxyError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let client = UpstreamClient::new(
        config.upstream.timeout(),
        RetryPolicy::live(config.upstream.max_attempts),
        headers,
    )?;
    Ok(client)
}

pub async fn run(config: Config) -> Result<(), ProxyError> {
    config.validate()?;

    let app = build_app(&config, Arc::new(upstream_client(&config)?));
    let listener =
        TcpListener::bind(format!("{}:{}", config.listener.host, config.listener.port)).await?;
    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        upstream = %config.upstream.base_url,
        "RUZ proxy listening"
    );

    let ready = Arc::new(AtomicBool::new(false));
    let admin_ready = ready.clone();
    let admin_service = AdminService::new(move || admin_ready.load(Ordering::Relaxed));

    let proxy_task = async {
        ready.store(true, Ordering::Relaxed);
        axum::serve(listener, app).await
    };
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::try_join!(proxy_task, admin_task)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Query;
    use axum::routing::get;
    use http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tower::ServiceExt;
    use url::Url;

    /// Minimal RUZ stand-in: echoes the search term, answers 503 for every schedule.
    async fn start_mock_ruz() -> (Url, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let search_hits = hits.clone();
        let schedule_hits = hits.clone();

        let app = Router::new()
            .route(
                "/api/search",
                get(move |Query(params): Query<HashMap<String, String>>| {
                    search_hits.fetch_add(1, Ordering::SeqCst);
                    let term = params.get("term").cloned().unwrap_or_default();
                    async move { axum::Json(serde_json::json!([{"label": term}])) }
                }),
            )
            .route(
                "/api/schedule/group/{id}",
                get(move || {
                    schedule_hits.fetch_add(1, Ordering::SeqCst);
                    async { StatusCode::SERVICE_UNAVAILABLE }
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(), hits)
    }

    fn test_config(base_url: Url, dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.upstream.base_url = base_url;
        config.upstream.max_attempts = 1;
        config.groups_index_path = dir.join("groups_index.json");
        config.frontend_dist = dir.join("dist");
        config
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, http::HeaderMap, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_proxy_against_mock_upstream() {
        let (base_url, hits) = start_mock_ruz().await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(base_url, dir.path());
        let app = build_app(&config, Arc::new(upstream_client(&config).unwrap()));

        let (status, _, body) = send(&app, get_request("/api/search?term=%D0%98%D0%92%D0%A2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"[{"label":"ИВТ"}]"#);

        // Cached for the TTL
        send(&app, get_request("/api/search?term=%D0%98%D0%92%D0%A2")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let uri = "/api/schedule/group/0?start=2026.10.19&finish=2026.10.25";
        let (status, _, body) = send(&app, get_request(uri)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"error":"RUZ schedule 503"}"#);
        send(&app, get_request(uri)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // No snapshot on disk yet
        let (status, _, body) = send(&app, get_request("/api/groups?term=a")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn test_frontend_with_spa_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let dist = dir.path().join("dist");
        fs::create_dir_all(dist.join("assets")).unwrap();
        fs::write(dist.join("index.html"), "<html>app</html>").unwrap();
        fs::write(dist.join("assets/app.js"), "console.log(1)").unwrap();

        let config = test_config(Url::parse("http://127.0.0.1:9").unwrap(), dir.path());
        let app = build_app(&config, Arc::new(upstream_client(&config).unwrap()));

        let (status, _, body) = send(&app, get_request("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<html>app</html>");

        let (status, _, body) = send(&app, get_request("/assets/app.js")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "console.log(1)");

        let (status, _, body) = send(&app, get_request("/schedule/105")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<html>app</html>");
    }

    #[tokio::test]
    async fn test_cors_for_dev_origins() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(Url::parse("http://127.0.0.1:9").unwrap(), dir.path());
        let app = build_app(&config, Arc::new(upstream_client(&config).unwrap()));

        let request = Request::get("/api/health")
            .header(ORIGIN, "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:5173");

        let request = Request::get("/api/health")
            .header(ORIGIN, "https://elsewhere.example")
            .body(Body::empty())
            .unwrap();
        let (_, headers, _) = send(&app, request).await;
        assert!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
