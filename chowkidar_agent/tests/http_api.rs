//! REST surface exercised in-process through `tower::ServiceExt::oneshot`.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use chowkidar_agent::api::{router, Limiters};
use common::StaticProvider;

async fn get(app: &Router, uri: &str, token: Option<&str>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let mut req = Request::builder().uri(uri);
    if let Some(t) = token {
        req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
    }
    let resp = app
        .clone()
        .oneshot(req.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body, headers)
}

#[tokio::test]
async fn health_is_public_and_carries_security_headers() {
    let (state, _) = common::start(Arc::default(), &[]);
    let app = router(state, Limiters::default());

    let (status, body, headers) = get(&app, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["clients"], 0);
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert!(headers.contains_key("content-security-policy"));
}

#[tokio::test]
async fn metrics_require_a_valid_bearer_token() {
    let (state, token) = common::start(Arc::default(), &[]);
    let app = router(state, Limiters::default());

    let (status, body, _) = get(&app, "/metrics/cpu", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _, _) = get(&app, "/metrics/cpu", Some("garbage")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body, _) = get(&app, "/metrics/cpu", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["usage_percent"], 42.5);
    assert_eq!(body["core_count"], 2);

    let (status, body, _) = get(&app, &format!("/metrics/memory?token={token}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["usage_percent"], 25.0);

    // the query form is percent-decoded the same way /ws decodes it
    let encoded = token.replace('.', "%2E");
    let (status, _, _) = get(&app, &format!("/metrics/memory?token={encoded}"), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn cpu_info_describes_the_processor() {
    let (state, token) = common::start(Arc::default(), &[]);
    let app = router(state, Limiters::default());

    let (status, _, _) = get(&app, "/metrics/cpu/info", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body, _) = get(&app, "/metrics/cpu/info", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model_name"], "Test CPU 3000");
    assert_eq!(body["vendor_id"], "AuthenticAMD");
    assert_eq!(body["cores"], 1);
    assert_eq!(body["threads"], 2);
    assert_eq!(body["max_frequency"], "3.00 GHz");
    assert_eq!(body["is_x86"], true);
}

#[tokio::test]
async fn network_endpoints() {
    let (state, token) = common::start(Arc::default(), &[]);
    let app = router(state, Limiters::default());

    let (_, body, _) = get(&app, "/metrics/network", Some(&token)).await;
    assert_eq!(body.as_array().map(Vec::len), Some(2));

    let (status, body, _) = get(&app, "/metrics/network/aggregated", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bytes_sent"], 1_010);
    assert_eq!(body["bytes_recv"], 2_010);
    assert_eq!(body["bytes_sent_rate"], 0.0);
    assert_eq!(body["interfaces"].as_array().map(Vec::len), Some(2));

    let (_, body, _) = get(&app, "/metrics/", Some(&token)).await;
    assert_eq!(body["cpu"], 42.5);
    assert_eq!(body["disk"], 40.0);
    assert_eq!(body["network"]["bytes_sent"], 1_010);
}

#[tokio::test]
async fn history_validates_metric_and_duration() {
    let (state, token) = common::start(Arc::default(), &[]);
    let app = router(state.clone(), Limiters::default());

    let (status, body, _) = get(&app, "/metrics/history?metric=gpu", Some(&token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("metric"));

    let (status, body, _) = get(&app, "/metrics/history?metric=cpu&duration=ten", Some(&token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("duration"));

    let (status, body, _) = get(&app, "/metrics/history", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metric"], "cpu");
    assert_eq!(body["duration"], "10m");
    assert_eq!(body["data"], Value::Array(vec![]));

    state.history.collect_once().await;
    let (_, body, _) = get(&app, "/metrics/history?metric=memory&duration=1h30m", Some(&token)).await;
    assert_eq!(body["metric"], "memory");
    assert_eq!(body["duration"], "1h30m");
    assert_eq!(body["data"][0]["usage_percent"], 25.0);

    let (status, body, _) = get(&app, "/metrics/history/all?duration=5m", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duration"], "5m");
    for kind in ["cpu", "memory", "disk", "network"] {
        assert_eq!(body["data"][kind].as_array().map(Vec::len), Some(1), "{kind}");
    }
}

#[tokio::test]
async fn dashboard_survives_a_failing_kind() {
    let provider = Arc::new(StaticProvider::default());
    provider.fail_cpu.store(true, Ordering::SeqCst);
    let (state, token) = common::start(provider, &[]);
    state.processes.refresh().await.unwrap();
    let app = router(state, Limiters::default());

    let (status, body, _) = get(&app, "/dashboard", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let current = &body["current"];
    assert!(current["cpu"].is_null());
    assert_eq!(current["memory"]["usage_percent"], 25.0);
    assert_eq!(current["disk"]["total_gb"], 100.0);
    assert_eq!(current["network"]["bytes_recv"], 2_010);
    // db and web tie on score; collection order decides
    assert_eq!(current["top_processes"][0]["name"], "db");
    assert_eq!(current["top_processes"].as_array().map(Vec::len), Some(4));
    assert_eq!(body["disk_partitions"].as_array().map(Vec::len), Some(2));
    assert_eq!(body["top_directories"].as_array().map(Vec::len), Some(3));
    assert!(body["history"]["cpu"].is_array());
}

#[tokio::test]
async fn processes_are_ranked_with_totals() {
    let (state, token) = common::start(Arc::default(), &["--process-limit", "2"]);
    state.processes.refresh().await.unwrap();
    let app = router(state, Limiters::default());

    for uri in ["/processes", "/processes/"] {
        let (status, body, _) = get(&app, uri, Some(&token)).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        let names: Vec<_> = body["processes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["db", "web"]);
        assert_eq!(body["total_cpu"], 70.0);
        assert_eq!(body["total_mem"], 30.0);
    }

    let (_, body, _) = get(&app, "/processes/status", Some(&token)).await;
    assert_eq!(body["total_processes"], 4);
}

#[tokio::test]
async fn auth_status_reports_token_validity() {
    let (state, token) = common::start(Arc::default(), &[]);
    let app = router(state, Limiters::default());

    let (status, _, _) = get(&app, "/auth/status", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = get(&app, "/auth/status?token=nope", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body, _) = get(&app, "/auth/status", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["server"], "test-host");
    assert!(body["expires_at"].is_string());
}

#[tokio::test]
async fn auth_routes_use_the_strict_limiter() {
    let (state, token) = common::start(Arc::default(), &[]);
    let app = router(state, Limiters::default());

    for _ in 0..10 {
        let (status, _, _) = get(&app, "/auth/status", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body, _) = get(&app, "/auth/status", Some(&token)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["retry_after"], 60);

    // The general limiter is separate.
    let (status, _, _) = get(&app, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn general_limiter_rejects_past_burst() {
    let (state, _) = common::start(Arc::default(), &[]);
    let app = router(state, Limiters::new(0.5, 2, 16));

    assert_eq!(get(&app, "/health", None).await.0, StatusCode::OK);
    assert_eq!(get(&app, "/health", None).await.0, StatusCode::OK);
    let (status, body, headers) = get(&app, "/health", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate limit exceeded");
    assert_eq!(headers["x-frame-options"], "DENY");
}

#[tokio::test]
async fn websocket_without_token_is_rejected_before_upgrade() {
    let (state, _) = common::start(Arc::default(), &[]);
    let app = router(state, Limiters::default());

    let (status, body, _) = get(&app, "/ws", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "missing token");

    let (status, _, _) = get(&app, "/ws?token=forged", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

async fn preflight(app: &Router, origin: &str) -> axum::http::Response<Body> {
    let req = Request::builder()
        .method("OPTIONS")
        .uri("/metrics/cpu")
        .header(header::ORIGIN, origin)
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization")
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(req).await.unwrap()
}

#[tokio::test]
async fn cors_admits_configured_origins_only() {
    let (state, token) = common::start(Arc::default(), &["--allowed-origins", "https://ops.example"]);
    let app = router(state, Limiters::default());

    let resp = preflight(&app, "https://ops.example").await;
    assert!(resp.status().is_success());
    let h = resp.headers();
    assert_eq!(h[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://ops.example");
    assert_eq!(h[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert!(h.contains_key("x-frame-options"));

    let resp = preflight(&app, "chowkidar://app").await;
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "chowkidar://app");

    let resp = preflight(&app, "https://evil.example").await;
    assert!(!resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

    // simple request from an allowed origin gets the echo too
    let req = Request::builder()
        .uri("/metrics/cpu")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:3000");
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let (state, _) = common::start(Arc::default(), &[]);
    let app = router(state, Limiters::default());
    let (status, body, _) = get(&app, "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}
