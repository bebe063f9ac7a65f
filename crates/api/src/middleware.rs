use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};

use backlot_core::Clock as _;
use backlot_infra::rate_limit::RateLimitDecision;

use crate::app::errors::json_error;
use crate::app::services::AppServices;

const CLIENT_ID_HEADER: &str = "x-client-id";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const ORG_ID_HEADER: &str = "x-org-id";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Rate limiter plus the profile a route class is admitted under.
#[derive(Clone)]
pub struct RateLimitState {
    pub services: Arc<AppServices>,
    pub profile: &'static str,
}

impl RateLimitState {
    pub fn new(services: Arc<AppServices>, profile: &'static str) -> Self {
        Self { services, profile }
    }
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let key = caller_key(req.headers());
    let org = header_value(req.headers(), ORG_ID_HEADER).map(str::to_string);

    let decision = match state
        .services
        .limiter
        .check_scoped(state.profile, &key, org.as_deref())
        .await
    {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(profile = state.profile, error = %e, "rate limit misconfigured");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "rate_limit_config", e.to_string());
        }
    };

    if !decision.allowed {
        tracing::debug!(profile = state.profile, caller = %key, org = ?org, "request rate limited");
        let mut resp = json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "too many requests; retry later",
        );
        let headers = resp.headers_mut();
        let retry_after = retry_after_secs(&decision, state.services.clock.now());
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
        return resp;
    }

    let mut resp = next.run(req).await;
    resp.headers_mut()
        .insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    resp
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Caller identity: `x-client-id`, else the first `x-forwarded-for` hop,
/// else a shared anonymous bucket.
fn caller_key(headers: &HeaderMap) -> String {
    if let Some(id) = header_value(headers, CLIENT_ID_HEADER) {
        return id.to_string();
    }
    header_value(headers, FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

/// Whole seconds until the next token, rounded up, at least 1.
fn retry_after_secs(decision: &RateLimitDecision, now: DateTime<Utc>) -> u64 {
    let wait = decision.retry_after(now);
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(*v));
        }
        map
    }

    #[test]
    fn client_id_wins_over_forwarded_for() {
        let h = headers(&[("x-client-id", "svc-a"), ("x-forwarded-for", "10.0.0.1")]);
        assert_eq!(caller_key(&h), "svc-a");
    }

    #[test]
    fn first_forwarded_hop_is_used() {
        let h = headers(&[("x-forwarded-for", " 203.0.113.7, 10.0.0.1")]);
        assert_eq!(caller_key(&h), "203.0.113.7");
    }

    #[test]
    fn missing_identity_is_anonymous() {
        assert_eq!(caller_key(&HeaderMap::new()), "anonymous");
        assert_eq!(caller_key(&headers(&[("x-client-id", " ")])), "anonymous");
    }

    #[test]
    fn org_header_is_trimmed_and_optional() {
        let h = headers(&[("x-org-id", " acme ")]);
        assert_eq!(header_value(&h, ORG_ID_HEADER), Some("acme"));
        assert_eq!(header_value(&headers(&[("x-org-id", "")]), ORG_ID_HEADER), None);
    }

    #[test]
    fn retry_after_rounds_up() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: now + chrono::Duration::milliseconds(2_300),
            limit: 2,
            degraded: false,
        };
        assert_eq!(retry_after_secs(&decision, now), 3);
        assert_eq!(
            retry_after_secs(&decision, now + chrono::Duration::milliseconds(1_300)),
            1
        );

        let now_ready = RateLimitDecision {
            reset_at: now - chrono::Duration::seconds(1),
            ..decision
        };
        assert_eq!(retry_after_secs(&now_ready, now), 1);
    }
}
