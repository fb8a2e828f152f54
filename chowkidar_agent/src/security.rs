//! Request guards: per-IP token buckets, bearer-token check, CORS and response headers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, request::Parts, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, warn};

use crate::auth::{extract_token, TokenAuthority};
use crate::error::AgentError;

pub const IDLE_EVICT: Duration = Duration::from_secs(300);
const SWEEP_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

struct Buckets {
    map: HashMap<IpAddr, Bucket>,
    last_sweep: Instant,
}

/// Token bucket per client IP. The map is bounded: entries idle for
/// [`IDLE_EVICT`] are swept, and at `max_entries` the least recently seen IP
/// makes room for a new one.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    max_entries: usize,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    /// `rate` tokens per second refill, up to `burst` stored.
    pub fn new(rate: f64, burst: u32, max_entries: usize) -> Self {
        Self {
            rate: rate.max(0.0),
            burst: f64::from(burst.max(1)),
            max_entries: max_entries.max(1),
            buckets: Mutex::new(Buckets {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// One token every 12 seconds, burst of 10.
    pub fn strict(max_entries: usize) -> Self {
        Self::new(1.0 / 12.0, 10, max_entries)
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    pub fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut b = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if now.saturating_duration_since(b.last_sweep) >= SWEEP_EVERY {
            let before = b.map.len();
            b.map
                .retain(|_, v| now.saturating_duration_since(v.last) < IDLE_EVICT);
            b.last_sweep = now;
            if before != b.map.len() {
                debug!(evicted = before - b.map.len(), "swept idle rate limiters");
            }
        }
        if !b.map.contains_key(&ip) && b.map.len() >= self.max_entries {
            if let Some(oldest) = b.map.iter().min_by_key(|(_, v)| v.last).map(|(k, _)| *k) {
                b.map.remove(&oldest);
            }
        }
        let (rate, burst) = (self.rate, self.burst);
        let bucket = b.map.entry(ip).or_insert(Bucket {
            tokens: burst,
            last: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tracked(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map
            .len()
    }
}

fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn rate_limit(State(limiter): State<Arc<RateLimiter>>, req: Request, next: Next) -> Response {
    let ip = client_ip(&req);
    if !limiter.allow(ip) {
        warn!(%ip, path = %req.uri().path(), "rate limit exceeded");
        return AgentError::RateLimited.into_response();
    }
    next.run(req).await
}

/// Requires a valid token in `Authorization: Bearer` or `?token=`.
pub async fn require_token(
    State(auth): State<Arc<TokenAuthority>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_token(req.headers(), req.uri()) else {
        warn!(path = %req.uri().path(), "request without token");
        return AgentError::MissingToken.into_response();
    };
    if let Err(e) = auth.validate(&token) {
        warn!(path = %req.uri().path(), ip = %client_ip(&req), "rejected token: {e}");
        return e.into_response();
    }
    next.run(req).await
}

const SECURITY_HEADERS: [(&str, &str); 5] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    (
        "content-security-policy",
        "default-src 'self'; script-src 'self' 'unsafe-inline'; style-src 'self' 'unsafe-inline'",
    ),
    ("permissions-policy", "geolocation=(), microphone=(), camera=()"),
];

/// Adds the fixed security headers to every response, and `Cache-Control: no-store`
/// unless a handler set its own.
pub fn with_security_headers<S>(mut router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    for (name, value) in SECURITY_HEADERS {
        router = router.layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
    }
    router.layer(SetResponseHeaderLayer::if_not_present(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    ))
}

/// Origins always allowed: local dashboards and the desktop app.
pub const DEFAULT_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://localhost:8080",
    "http://127.0.0.1:8080",
    DESKTOP_ORIGIN,
];
const DESKTOP_ORIGIN: &str = "chowkidar://app";

/// Browser origins allowed to call the API.
///
/// An entry matches an origin exactly (trailing slashes ignored), `*` matches
/// anything, and an entry without a scheme matches on the origin's host. The desktop
/// entry also admits any `chowkidar://` origin and the opaque `null` origin its
/// webview sends.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    origins: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, T>(origins: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for o in origins {
            let o = o.as_ref().trim().trim_end_matches('/');
            if !o.is_empty() && !out.iter().any(|x| x == o) {
                out.push(o.to_string());
            }
        }
        Self { origins: out }
    }

    pub fn origins(&self) -> &[String] {
        &self.origins
    }

    pub fn allows(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        if origin.is_empty() {
            return false;
        }
        self.origins.iter().any(|allowed| {
            if allowed == "*" || allowed == origin {
                return true;
            }
            if allowed == DESKTOP_ORIGIN {
                return origin == "null" || origin.starts_with("chowkidar://");
            }
            !allowed.contains("://") && origin_host(origin) == Some(allowed.as_str())
        })
    }
}

fn origin_host(origin: &str) -> Option<&str> {
    let (_, rest) = origin.split_once("://")?;
    let host = rest.split('/').next().unwrap_or(rest);
    (!host.is_empty()).then_some(host)
}

/// CORS for the allowed origins. The matching origin is echoed back and credentials
/// are permitted.
pub fn cors_layer(policy: Arc<OriginPolicy>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _: &Parts| {
                let allowed = origin.to_str().map(|o| policy.allows(o)).unwrap_or(false);
                if !allowed {
                    debug!(?origin, "cors origin refused");
                }
                allowed
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(86_400))
}
