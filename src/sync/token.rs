//! Token Service - bearer credential acquisition
//!
//! Exchanges client credentials for an access token and keeps it in the
//! injected `TokenCache`. Concurrent callers for the same credentials share
//! one in-flight request.

use serde_json::{json, Value};

use super::models::Token;
use super::transport::{HttpTransport, TransportError};
use crate::cache::TokenCache;
use crate::config::{Credentials, Route};

const NO_CONTENT_MESSAGE: &str = "Token endpoint returned no content";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TokenError {
    #[error("Token request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Token rejected: {0}")]
    Rejected(String),

    #[error("Token route is misconfigured: {0}")]
    Route(String),
}

impl TokenError {
    /// HTTP status of the failure, if the server answered
    pub fn code(&self) -> Option<u16> {
        match self {
            TokenError::Transport(e) => Some(e.code()),
            TokenError::Rejected(_) | TokenError::Route(_) => None,
        }
    }
}

/// Acquires and caches the bearer token of one set of credentials
pub struct TokenService {
    transport: HttpTransport,
    cache: TokenCache,
    credentials: Credentials,
    route: Route,
}

impl TokenService {
    pub fn new(transport: HttpTransport, cache: TokenCache, credentials: Credentials, route: Route) -> Self {
        Self {
            transport,
            cache,
            credentials,
            route,
        }
    }

    /// Cached token, or a new one when nothing valid is cached
    pub async fn get_token(&self) -> Result<Token, TokenError> {
        let token = self.cached_or_request().await?;
        if !token.is_expired() {
            return Ok(token);
        }

        log::info!("Cached token for {} expired, requesting a new one", self.credentials.key());
        self.cache.invalidate_if(self.credentials.key(), &token).await;
        self.cached_or_request().await
    }

    /// Always request a new token and replace the cached one
    pub async fn request_token(&self) -> Result<Token, TokenError> {
        let token = self.fetch_token().await?;
        self.cache.insert(self.credentials.key(), token.clone()).await;
        Ok(token)
    }

    /// Whether the cached token is missing or past its expiry
    pub async fn is_expired(&self) -> bool {
        match self.cache.get(self.credentials.key()).await {
            Some(token) => token.is_expired(),
            None => true,
        }
    }

    /// Mark the cached token as unusable
    pub async fn invalidate(&self) {
        self.cache.invalidate(self.credentials.key()).await;
    }

    async fn cached_or_request(&self) -> Result<Token, TokenError> {
        self.cache
            .get_or_try_insert_with(self.credentials.key(), self.fetch_token())
            .await
            .map_err(|e| (*e).clone())
    }

    async fn fetch_token(&self) -> Result<Token, TokenError> {
        log::debug!("Requesting access token for {}", self.credentials.key());

        let request = self
            .route
            .request()
            .map_err(|e| TokenError::Route(e.to_string()))?
            .with_body(json!({
            "client_id": self.credentials.client_id,
            "client_secret": self.credentials.client_secret,
        }));

        let body = self.transport.send(&request).await?.into_json()?;
        parse_token(body)
    }
}

/// Accepts `{access_token, expires}` either bare or inside a `data` envelope
fn parse_token(body: Value) -> Result<Token, TokenError> {
    let payload = match body.get("data") {
        Some(data) if data.is_object() => data,
        _ => &body,
    };

    let access_token = payload
        .get("access_token")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let expires = match payload.get("expires") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    };

    if access_token.is_empty() || expires <= 0 {
        let message = ["errorMessage", "message", "error"]
            .iter()
            .find_map(|key| body.get(*key).and_then(Value::as_str))
            .unwrap_or(NO_CONTENT_MESSAGE);
        return Err(TokenError::Rejected(message.to_string()));
    }

    Ok(Token {
        access_token: access_token.to_string(),
        expires,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn service(url: &str) -> TokenService {
        service_with(url, TokenCache::new(), Route::new("POST", "/token"))
    }

    fn service_with(url: &str, cache: TokenCache, route: Route) -> TokenService {
        TokenService::new(
            HttpTransport::new(url, Duration::from_secs(5)).unwrap(),
            cache,
            Credentials::new("client", "secret"),
            route,
        )
    }

    fn token_body(token: &str, expires_in: i64) -> String {
        json!({
            "access_token": token,
            "expires": chrono::Utc::now().timestamp() + expires_in,
        })
        .to_string()
    }

    #[test]
    fn test_parse_token_envelope() {
        let token = parse_token(json!({"success": true, "data": {"access_token": "a", "expires": 10}})).unwrap();
        assert_eq!(token.access_token, "a");
        assert_eq!(token.expires, 10);
    }

    #[test]
    fn test_parse_token_rejects_empty() {
        assert_eq!(
            parse_token(json!({"errorMessage": "bad client"})),
            Err(TokenError::Rejected("bad client".into()))
        );
        assert_eq!(
            parse_token(json!({"access_token": "a", "expires": 0})),
            Err(TokenError::Rejected(NO_CONTENT_MESSAGE.into()))
        );
        assert_eq!(
            parse_token(Value::Null),
            Err(TokenError::Rejected(NO_CONTENT_MESSAGE.into()))
        );
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/token")
            .match_body(mockito::Matcher::PartialJson(json!({"client_id": "client", "client_secret": "secret"})))
            .with_status(200)
            .with_body(token_body("cached", 3600))
            .expect(1)
            .create_async()
            .await;

        let service = service(&server.url());
        assert_eq!(service.get_token().await.unwrap().access_token, "cached");
        assert_eq!(service.get_token().await.unwrap().access_token, "cached");
        assert!(!service.is_expired().await);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_get_token_single_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/token")
            .with_status(200)
            .with_body(token_body("shared", 3600))
            .expect(1)
            .create_async()
            .await;

        let service = service(&server.url());
        let (a, b) = tokio::join!(service.get_token(), service.get_token());

        assert_eq!(a.unwrap().access_token, "shared");
        assert_eq!(b.unwrap().access_token, "shared");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_token_bypasses_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/token")
            .with_status(200)
            .with_body(token_body("fresh", 3600))
            .expect(2)
            .create_async()
            .await;

        let service = service(&server.url());
        service.get_token().await.unwrap();
        service.request_token().await.unwrap();
        // Cached again after the forced refresh
        service.get_token().await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_token_is_replaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/token")
            .with_status(200)
            .with_body(token_body("short", -10))
            .expect(2)
            .create_async()
            .await;

        let service = service(&server.url());
        let token = service.get_token().await.unwrap();

        assert!(token.is_expired());
        assert!(service.is_expired().await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_refresh_of_expired_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/token")
            .with_status(200)
            .with_body(token_body("renewed", 3600))
            .expect(1)
            .create_async()
            .await;

        let cache = TokenCache::new();
        let stale = Token {
            access_token: "stale".into(),
            expires: chrono::Utc::now().timestamp() - 10,
        };
        cache.insert("client", stale).await;

        let service = service_with(&server.url(), cache, Route::new("POST", "/token"));
        let (a, b) = tokio::join!(service.get_token(), service.get_token());

        assert_eq!(a.unwrap().access_token, "renewed");
        assert_eq!(b.unwrap().access_token, "renewed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_lookups_are_counted() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/token")
            .with_status(200)
            .with_body(token_body("counted", 3600))
            .create_async()
            .await;

        let cache = TokenCache::new();
        let service = service_with(&server.url(), cache.clone(), Route::new("POST", "/token"));
        service.get_token().await.unwrap();
        service.get_token().await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.total_requests, 2);
    }

    #[tokio::test]
    async fn test_invalid_route_method_is_reported() {
        let service = service_with("http://127.0.0.1:9", TokenCache::new(), Route::new("NOT A METHOD", "/token"));

        let err = service.get_token().await.unwrap_err();

        assert!(matches!(err, TokenError::Route(_)));
        assert_eq!(err.code(), None);
    }

    #[tokio::test]
    async fn test_failed_request_is_not_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"message": "unknown client"}"#)
            .expect(2)
            .create_async()
            .await;

        let service = service(&server.url());
        assert_eq!(service.get_token().await, Err(TokenError::Rejected("unknown client".into())));
        assert!(service.get_token().await.is_err());

        mock.assert_async().await;
    }
}
