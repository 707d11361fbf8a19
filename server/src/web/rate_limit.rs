use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::engine::rate_limiter::RateLimiter;
use crate::error::CoreError;

/// Per-IP rate limiters for the unauthenticated endpoints.
pub struct ApiRateLimiters {
    /// Register and login: burst of 10, refill 1 per 6 seconds.
    pub auth: RateLimiter,
    /// WebSocket upgrades: burst of 5, refill 1 per 12 seconds.
    pub ws: RateLimiter,
}

impl Default for ApiRateLimiters {
    fn default() -> Self {
        Self {
            auth: RateLimiter::new(10, 6.0),
            ws: RateLimiter::new(5, 12.0),
        }
    }
}

/// Client IP for rate limiting. Proxy headers are trusted only when the
/// direct peer is loopback, so remote clients cannot spoof their key.
fn client_ip(req: &Request<Body>) -> String {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip());

    if peer_ip.is_some_and(|ip| ip.is_loopback()) {
        if let Some(forwarded) = req.headers().get("x-forwarded-for")
            && let Ok(val) = forwarded.to_str()
            && let Some(first) = val.split(',').next()
        {
            return first.trim().to_string();
        }
        if let Some(real_ip) = req.headers().get("x-real-ip")
            && let Ok(val) = real_ip.to_str()
        {
            return val.trim().to_string();
        }
    }

    peer_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn limited(
    req: Request<Body>,
    next: Next,
    pick: fn(&ApiRateLimiters) -> &RateLimiter,
) -> Response {
    if let Some(limiters) = req.extensions().get::<Arc<ApiRateLimiters>>()
        && !pick(limiters).check(&client_ip(&req))
    {
        return CoreError::RateLimited.into_response();
    }
    next.run(req).await
}

/// Middleware for register/login rate limiting.
pub async fn auth_rate_limit(req: Request<Body>, next: Next) -> Response {
    limited(req, next, |l| &l.auth).await
}

/// Middleware for WebSocket upgrade rate limiting.
pub async fn ws_rate_limit(req: Request<Body>, next: Next) -> Response {
    limited(req, next, |l| &l.ws).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn request(peer: IpAddr, forwarded: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/login");
        if let Some(value) = forwarded {
            builder = builder.header("x-forwarded-for", value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::new(peer, 4000)));
        req
    }

    #[test]
    fn test_forwarded_header_trusted_from_loopback_only() {
        let proxied = request(IpAddr::V4(Ipv4Addr::LOCALHOST), Some("203.0.113.7, 10.0.0.1"));
        assert_eq!(client_ip(&proxied), "203.0.113.7");

        let remote = request(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2)), Some("203.0.113.7"));
        assert_eq!(client_ip(&remote), "198.51.100.2");
    }

    #[test]
    fn test_missing_peer_is_unknown() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&req), "unknown");
    }
}
