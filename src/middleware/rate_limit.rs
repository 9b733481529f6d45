//! Rate limiting middleware.
//!
//! True sliding window per caller IP: each window keeps the timestamps of
//! recent requests and prunes those older than one minute. The execute and
//! batch routes each carry their own limiter instance with its own budget.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone)]
pub struct SlidingWindowLimiter {
    max_requests: u32,
    window: Duration,
    state: Arc<Mutex<HashMap<IpAddr, VecDeque<Instant>>>>,
}

pub enum RateLimitDecision {
    Allowed,
    Exceeded { retry_after: Duration },
}

impl SlidingWindowLimiter {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check and record one request from `ip`.
    pub fn check(&self, ip: IpAddr) -> RateLimitDecision {
        let now = Instant::now();
        let mut state = self.state.lock();
        let hits = state.entry(ip).or_default();

        while let Some(&oldest) = hits.front() {
            if now.duration_since(oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= self.max_requests as usize {
            if let Some(&oldest) = hits.front() {
                let retry_after = self.window.saturating_sub(now.duration_since(oldest));
                return RateLimitDecision::Exceeded { retry_after };
            }
        }

        hits.push_back(now);
        RateLimitDecision::Allowed
    }

    /// Drop idle callers. Run from a background interval.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.window;
        let mut state = self.state.lock();
        state.retain(|_, hits| {
            hits.back()
                .map(|&last| now.duration_since(last) < window)
                .unwrap_or(false)
        });
    }
}

fn caller_ip(request: &Request<Body>) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<SlidingWindowLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = caller_ip(&request);
    match limiter.check(ip) {
        RateLimitDecision::Allowed => next.run(request).await,
        RateLimitDecision::Exceeded { retry_after } => {
            let retry_secs = retry_after.as_secs().max(1);
            warn!(ip = %ip, retry_after_secs = retry_secs, "rate limit exceeded");

            let body = serde_json::json!({
                "error": {
                    "code": "rate_limited",
                    "message": format!("too many requests; retry after {retry_secs}s"),
                }
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_secs.to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter = SlidingWindowLimiter::per_minute(10);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..10 {
            assert!(matches!(limiter.check(ip), RateLimitDecision::Allowed));
        }
        // The 11th call inside the window is rejected.
        match limiter.check(ip) {
            RateLimitDecision::Exceeded { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            RateLimitDecision::Allowed => panic!("should be exceeded"),
        }
    }

    #[test]
    fn callers_have_independent_budgets() {
        let limiter = SlidingWindowLimiter::per_minute(1);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(matches!(limiter.check(a), RateLimitDecision::Allowed));
        assert!(matches!(limiter.check(a), RateLimitDecision::Exceeded { .. }));
        assert!(matches!(limiter.check(b), RateLimitDecision::Allowed));
    }

    #[test]
    fn cleanup_drops_idle_callers() {
        let limiter = SlidingWindowLimiter::per_minute(5);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        limiter.check(ip);
        assert_eq!(limiter.state.lock().len(), 1);

        // Nothing is older than the window yet, so the entry survives.
        limiter.cleanup();
        assert_eq!(limiter.state.lock().len(), 1);
    }
}
