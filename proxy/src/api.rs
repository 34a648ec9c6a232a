use crate::cache::{CachedResponse, ResponseCache};
use crate::errors::ApiError;
use crate::metrics_defs::REQUEST_DURATION;
use axum::extract::rejection::PathRejection;
use axum::extract::{MatchedPath, Path, RawQuery, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use groups::suggest::{DEFAULT_LIMIT, GroupSuggest, MAX_LIMIT};
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde_json::json;
use shared::histogram;
use shared::upstream::{Upstream, UpstreamError, schedule_url, search_url};
use std::sync::Arc;
use std::time::Instant;
use url::{Url, form_urlencoded};

const GROUPS_MAX_AGE_SECS: u64 = 60;
const DEFAULT_LANGUAGE: &str = "1";

/// Shared by all API handlers.
#[derive(Clone)]
pub struct ApiState {
    upstream: Arc<dyn Upstream>,
    cache: Arc<ResponseCache>,
    groups: Arc<GroupSuggest>,
    ruz_base: Url,
    upstream_cache_secs: u64,
}

impl ApiState {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        cache: Arc<ResponseCache>,
        groups: Arc<GroupSuggest>,
        ruz_base: Url,
        upstream_cache_secs: u64,
    ) -> Self {
        ApiState {
            upstream,
            cache,
            groups,
            ruz_base,
            upstream_cache_secs,
        }
    }

    async fn fetch_cached(&self, key: &str, url: Url) -> Result<CachedResponse, UpstreamError> {
        let upstream = self.upstream.clone();
        self.cache
            .get_or_fetch(key, async move { upstream.fetch_json(&url).await })
            .await
    }

    fn upstream_response(&self, response: CachedResponse) -> Response {
        (
            response.status,
            [(CONTENT_TYPE, "application/json")],
            [(CACHE_CONTROL, cache_control(self.upstream_cache_secs))],
            response.body,
        )
            .into_response()
    }
}

pub fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/search", get(search))
        .route("/api/schedule/group/{group_id}", get(schedule_group))
        .route("/api/groups", get(suggest_groups))
        .route_layer(middleware::from_fn(track_duration))
        .with_state(state)
}

async fn track_duration(path: MatchedPath, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let endpoint = path.as_str().to_string();
    let response = next.run(request).await;

    histogram!(
        REQUEST_DURATION,
        "endpoint" => endpoint,
        "status" => response.status().as_u16().to_string()
    )
    .record(started.elapsed().as_secs_f64());
    response
}

fn cache_control(max_age: u64) -> String {
    format!("public, max-age={max_age}")
}

/// Decoded query string. Repeated keys keep their first value.
struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    fn parse(raw: Option<&str>) -> Self {
        let pairs = form_urlencoded::parse(raw.unwrap_or_default().as_bytes())
            .into_owned()
            .collect();
        QueryParams(pairs)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|value| !value.is_empty())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

async fn search(
    State(state): State<ApiState>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let params = QueryParams::parse(query.as_deref());
    let term = params.get("term").unwrap_or_default().trim();
    if term.is_empty() {
        return Err(ApiError::ClientInput("term required"));
    }

    let url = search_url(&state.ruz_base, term).map_err(|e| ApiError::upstream("search", e))?;
    // Keyed by the encoded upstream URL
    let key = format!("search:{url}");
    let response = state
        .fetch_cached(&key, url)
        .await
        .map_err(|e| ApiError::upstream("search", e))?;

    Ok(state.upstream_response(response))
}

async fn schedule_group(
    State(state): State<ApiState>,
    group_id: Result<Path<String>, PathRejection>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let Path(group_id) = group_id.map_err(|_| ApiError::ClientInput("invalid group id"))?;
    let params = QueryParams::parse(query.as_deref());
    let (Some(start), Some(finish)) = (params.non_empty("start"), params.non_empty("finish")) else {
        return Err(ApiError::ClientInput("start & finish required (YYYY.MM.DD)"));
    };
    let lng = params.non_empty("lng").unwrap_or(DEFAULT_LANGUAGE);

    let url = schedule_url(&state.ruz_base, &group_id, start, finish, lng)
        .map_err(|e| ApiError::upstream("schedule", e))?;
    let key = format!("schedule:{url}");
    let response = state
        .fetch_cached(&key, url)
        .await
        .map_err(|e| ApiError::upstream("schedule", e))?;

    Ok(state.upstream_response(response))
}

/// Unparsable limits fall back to the default, others are clamped to `1..=MAX_LIMIT`.
fn parse_limit(raw: Option<&str>) -> usize {
    raw.and_then(|raw| raw.trim().parse::<i64>().ok())
        .map_or(DEFAULT_LIMIT, |limit| limit.clamp(1, MAX_LIMIT as i64) as usize)
}

async fn suggest_groups(State(state): State<ApiState>, RawQuery(query): RawQuery) -> Response {
    let params = QueryParams::parse(query.as_deref());
    let term = params.get("term").unwrap_or_default();
    let limit = parse_limit(params.get("limit"));
    let items = state.groups.suggest(term, limit);

    (
        [(CACHE_CONTROL, cache_control(GROUPS_MAX_AGE_SECS))],
        Json(items),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use groups::{GroupIndexSnapshot, GroupRecord, SnapshotStore};
    use http::{HeaderMap, StatusCode};
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use serde_json::Value;
    use shared::upstream::UpstreamResponse;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Replays scripted results in order and records every requested URL.
    /// Calls beyond the script fail.
    struct ScriptedUpstream {
        script: Mutex<VecDeque<Result<UpstreamResponse, UpstreamError>>>,
        requested: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        fn new(script: Vec<Result<UpstreamResponse, UpstreamError>>) -> Arc<Self> {
            Arc::new(ScriptedUpstream {
                script: Mutex::new(script.into()),
                requested: Mutex::new(Vec::new()),
            })
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().clone()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn fetch_json(&self, url: &Url) -> Result<UpstreamResponse, UpstreamError> {
            self.requested.lock().push(url.to_string());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(UpstreamError::Request(format!("unexpected call to {url}"))))
        }
    }

    struct TestApp {
        router: Router,
        _dir: tempfile::TempDir,
    }

    fn test_app(upstream: Arc<ScriptedUpstream>, groups: Vec<GroupRecord>) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("groups_index.json"));
        store.store(&GroupIndexSnapshot::new("test", groups)).unwrap();

        let state = ApiState::new(
            upstream,
            Arc::new(ResponseCache::new(Duration::from_secs(60), 16, None)),
            Arc::new(GroupSuggest::new(store)),
            Url::parse("https://ruz.test").unwrap(),
            300,
        );
        TestApp {
            router: routes(state),
            _dir: dir,
        }
    }

    async fn get(app: &TestApp, uri: &str) -> (StatusCode, HeaderMap, Value) {
        let response = app
            .router
            .clone()
            .oneshot(http::Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(ScriptedUpstream::new(vec![]), vec![]);
        let (status, _, body) = get(&app, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_search_requires_term() {
        let upstream = ScriptedUpstream::new(vec![]);
        let app = test_app(upstream.clone(), vec![]);

        for uri in ["/api/search", "/api/search?term=", "/api/search?term=%20%20"] {
            let (status, _, body) = get(&app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body, json!({"error": "term required"}));
        }
        assert!(upstream.requested().is_empty());
    }

    #[tokio::test]
    async fn test_search_proxies_and_caches() {
        let upstream = ScriptedUpstream::new(vec![Ok(UpstreamResponse::ok(json!([
            {"id": 105, "label": "ТРПО-22-1"}
        ])))]);
        let app = test_app(upstream.clone(), vec![]);

        let uri = "/api/search?term=%20%D0%A2%D0%A0%D0%9F%D0%9E%20";
        let (status, headers, body) = get(&app, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CACHE_CONTROL], "public, max-age=300");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(body, json!([{"id": 105, "label": "ТРПО-22-1"}]));

        // Served from the cache, the script has nothing left
        let (status, _, cached) = get(&app, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cached, body);
        assert_eq!(
            upstream.requested(),
            vec!["https://ruz.test/api/search?term=%D0%A2%D0%A0%D0%9F%D0%9E"]
        );
    }

    #[tokio::test]
    async fn test_schedule_requires_dates_without_upstream_call() {
        let upstream = ScriptedUpstream::new(vec![]);
        let app = test_app(upstream.clone(), vec![]);

        for uri in [
            "/api/schedule/group/105",
            "/api/schedule/group/105?start=2026.10.19",
            "/api/schedule/group/105?finish=2026.10.25",
            "/api/schedule/group/105?start=&finish=2026.10.25",
        ] {
            let (status, _, body) = get(&app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body, json!({"error": "start & finish required (YYYY.MM.DD)"}));
        }
        assert!(upstream.requested().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_errors_are_not_cached() {
        let upstream = ScriptedUpstream::new(vec![
            Err(UpstreamError::Status(StatusCode::SERVICE_UNAVAILABLE)),
            Ok(UpstreamResponse::ok(json!([{"discipline": "Math"}]))),
        ]);
        let app = test_app(upstream.clone(), vec![]);
        let uri = "/api/schedule/group/105?start=2026.10.19&finish=2026.10.25";

        let (status, _, body) = get(&app, uri).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"error": "RUZ schedule 503"}));

        let (status, headers, body) = get(&app, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CACHE_CONTROL], "public, max-age=300");
        assert_eq!(body, json!([{"discipline": "Math"}]));

        let expected = "https://ruz.test/api/schedule/group/105?start=2026.10.19&finish=2026.10.25&lng=1";
        assert_eq!(upstream.requested(), vec![expected, expected]);
    }

    #[tokio::test]
    async fn test_schedule_passes_language() {
        let upstream = ScriptedUpstream::new(vec![Ok(UpstreamResponse::ok(json!([])))]);
        let app = test_app(upstream.clone(), vec![]);

        let (status, _, _) = get(
            &app,
            "/api/schedule/group/7?start=2026.10.19&finish=2026.10.25&lng=2",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            upstream.requested(),
            vec!["https://ruz.test/api/schedule/group/7?start=2026.10.19&finish=2026.10.25&lng=2"]
        );
    }

    #[tokio::test]
    async fn test_groups_suggest() {
        let app = test_app(
            ScriptedUpstream::new(vec![]),
            vec![
                GroupRecord::new(105, "ТРПО-22-1"),
                GroupRecord::new(9, "ИВТ-9"),
                GroupRecord::new(220, "ЭК-22-4"),
            ],
        );

        let (status, headers, body) = get(&app, "/api/groups?term=22").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CACHE_CONTROL], "public, max-age=60");
        assert_eq!(
            body,
            json!([
                {"id": 105, "label": "ТРПО-22-1"},
                {"id": 220, "label": "ЭК-22-4"}
            ])
        );

        let (_, _, body) = get(&app, "/api/groups?term=").await;
        assert_eq!(body, json!([]));
        let (_, _, body) = get(&app, "/api/groups").await;
        assert_eq!(body, json!([]));

        let (_, _, body) = get(&app, "/api/groups?term=22&limit=-5").await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        let (_, _, body) = get(&app, "/api/groups?term=22&limit=abc").await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cache_keys_do_not_collide_on_separators() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(UpstreamResponse::ok(json!(["first"]))),
            Ok(UpstreamResponse::ok(json!(["second"]))),
        ]);
        let app = test_app(upstream.clone(), vec![]);

        let (_, _, body) = get(
            &app,
            "/api/schedule/group/1?start=2026.10.19:2026.10.25&finish=1",
        )
        .await;
        assert_eq!(body, json!(["first"]));

        let (_, _, body) = get(
            &app,
            "/api/schedule/group/1?start=2026.10.19&finish=2026.10.25:1",
        )
        .await;
        assert_eq!(body, json!(["second"]));

        assert_eq!(
            upstream.requested(),
            vec![
                "https://ruz.test/api/schedule/group/1?start=2026.10.19%3A2026.10.25&finish=1&lng=1",
                "https://ruz.test/api/schedule/group/1?start=2026.10.19&finish=2026.10.25%3A1&lng=1",
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_query_parameters_use_first_value() {
        let upstream = ScriptedUpstream::new(vec![Ok(UpstreamResponse::ok(json!([])))]);
        let app = test_app(upstream.clone(), vec![GroupRecord::new(105, "A-22")]);

        let (status, _, _) = get(&app, "/api/search?term=a&term=b").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(upstream.requested(), vec!["https://ruz.test/api/search?term=a"]);

        let (status, _, body) = get(&app, "/api/groups?term=a&term=zzz&limit=1&limit=x").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{"id": 105, "label": "A-22"}]));

        // Still JSON when the first value is empty
        let (status, _, body) = get(&app, "/api/search?term=&term=b").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "term required"}));
    }

    #[tokio::test]
    async fn test_undecodable_group_id_is_a_json_error() {
        let upstream = ScriptedUpstream::new(vec![]);
        let app = test_app(upstream.clone(), vec![]);

        let (status, _, body) = get(
            &app,
            "/api/schedule/group/%FF?start=2026.10.19&finish=2026.10.25",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "invalid group id"}));
        assert!(upstream.requested().is_empty());
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None), DEFAULT_LIMIT);
        assert_eq!(parse_limit(Some("abc")), DEFAULT_LIMIT);
        assert_eq!(parse_limit(Some("")), DEFAULT_LIMIT);
        assert_eq!(parse_limit(Some("0")), 1);
        assert_eq!(parse_limit(Some("-3")), 1);
        assert_eq!(parse_limit(Some("10")), 10);
        assert_eq!(parse_limit(Some("1000")), MAX_LIMIT);
    }
}
