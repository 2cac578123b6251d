//! Originating client details (address and user agent) for audit trails and
//! rate limiting.

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, header, request::Parts},
};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn from_parts(headers: &HeaderMap, socket: Option<SocketAddr>) -> Self {
        let ip = forwarded_ip(headers)
            .map(|ip| ip.to_string())
            .or_else(|| socket.map(|addr| addr.ip().to_string()));

        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Self { ip, user_agent }
    }
}

/// First entry of the `x-forwarded-for` chain, if it parses as an address.
pub fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

/// Forwarded address first, then the raw socket address.
pub fn client_ip(headers: &HeaderMap, socket: Option<SocketAddr>) -> Option<IpAddr> {
    forwarded_ip(headers).or_else(|| socket.map(|addr| addr.ip()))
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let socket = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(ClientInfo::from_parts(&parts.headers, socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_chain_uses_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8.0"));

        let socket: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let info = ClientInfo::from_parts(&headers, Some(socket));

        assert_eq!(info.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(info.user_agent.as_deref(), Some("curl/8.0"));
    }

    #[test]
    fn falls_back_to_socket_address() {
        let headers = HeaderMap::new();
        let socket: SocketAddr = "192.0.2.10:443".parse().unwrap();

        let info = ClientInfo::from_parts(&headers, Some(socket));

        assert_eq!(info.ip.as_deref(), Some("192.0.2.10"));
        assert!(info.user_agent.is_none());
    }

    #[test]
    fn garbage_forwarded_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("unknown"));

        assert_eq!(client_ip(&headers, None), None);
    }
}
