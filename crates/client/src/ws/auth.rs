//! Channel authentication: exchanges (channel, socket id) for a signed grant
//! before a private or presence channel can be subscribed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deskline_shared::{ApiError, AuthGrant, AuthRequest, ChannelName};

use crate::api_client::ApiClient;

/// Source of the bearer token used against the auth endpoint.
///
/// Token storage belongs to the application; the real-time core only reads
/// the current token and asks for exactly one refresh after a 401.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn access_token(&self) -> Option<String>;

    /// Obtain a fresh token. `None` means the session cannot be renewed.
    async fn refresh(&self) -> Option<String>;
}

/// A fixed token that cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticToken(pub Option<String>);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Option<String> {
        self.0.clone()
    }

    async fn refresh(&self) -> Option<String> {
        None
    }
}

/// Produces grants for channels that require them. `None` means "do not subscribe".
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync + 'static {
    async fn authorize(&self, channel: &ChannelName, socket_id: &str) -> Option<AuthGrant>;
}

/// HTTP authenticator for `POST /broadcasting/auth`.
#[derive(Clone)]
pub struct HttpChannelAuthenticator {
    api: ApiClient,
    endpoint: String,
    tokens: Arc<dyn TokenSource>,
}

impl HttpChannelAuthenticator {
    pub fn new(endpoint: impl Into<String>, tokens: Arc<dyn TokenSource>, timeout: Duration) -> Self {
        Self {
            api: ApiClient::new().with_timeout(timeout),
            endpoint: endpoint.into(),
            tokens,
        }
    }

    /// One round trip with an explicit bearer token.
    pub async fn request_grant(
        &self,
        channel: &ChannelName,
        socket_id: &str,
        bearer: Option<&str>,
    ) -> Result<AuthGrant, ApiError> {
        let body = AuthRequest {
            channel_name: channel.wire(),
            socket_id: socket_id.to_string(),
        };
        let text = self.api.post_json_text(&self.endpoint, &body, bearer).await?;
        AuthGrant::from_response(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    /// Authenticate, refreshing the token once on 401. Other failures are final.
    pub async fn authenticate(&self, channel: &ChannelName, socket_id: &str) -> Option<AuthGrant> {
        let token = self.tokens.access_token().await;

        let err = match self.request_grant(channel, socket_id, token.as_deref()).await {
            Ok(grant) => return Some(grant),
            Err(err) => err,
        };

        if !err.is_unauthorized() {
            crate::log_warn!("Channel auth for {} failed: {}", channel, err.summary());
            return None;
        }

        crate::log_info!("Channel auth for {} got 401, refreshing token", channel);
        let Some(refreshed) = self.tokens.refresh().await else {
            crate::log_warn!("Token refresh failed; not subscribing to {}", channel);
            return None;
        };

        match self.request_grant(channel, socket_id, Some(&refreshed)).await {
            Ok(grant) => Some(grant),
            Err(err) => {
                crate::log_warn!(
                    "Channel auth for {} failed after refresh: {}",
                    channel,
                    err.summary()
                );
                None
            }
        }
    }
}

#[async_trait]
impl ChannelAuthorizer for HttpChannelAuthenticator {
    async fn authorize(&self, channel: &ChannelName, socket_id: &str) -> Option<AuthGrant> {
        self.authenticate(channel, socket_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RefreshingToken {
        current: &'static str,
        next: Option<&'static str>,
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for RefreshingToken {
        async fn access_token(&self) -> Option<String> {
            Some(self.current.to_string())
        }

        async fn refresh(&self) -> Option<String> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.next.map(str::to_string)
        }
    }

    fn authenticator(server: &MockServer, tokens: Arc<dyn TokenSource>) -> HttpChannelAuthenticator {
        HttpChannelAuthenticator::new(
            format!("{}/broadcasting/auth", server.uri()),
            tokens,
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn grant_from_bare_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/broadcasting/auth"))
            .and(header("Authorization", "Bearer t1"))
            .and(body_json(serde_json::json!({
                "channel_name": "private-conversation.42",
                "socket_id": "123.456",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "auth": "key:signature",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = authenticator(&server, Arc::new(StaticToken(Some("t1".into()))));
        let grant = auth
            .authenticate(&ChannelName::conversation(42), "123.456")
            .await
            .unwrap();
        assert_eq!(grant.auth, "key:signature");
    }

    #[tokio::test]
    async fn refreshes_once_on_401_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": { "auth": "key:fresh-sig" },
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = Arc::new(RefreshingToken {
            current: "stale",
            next: Some("fresh"),
            refreshes: AtomicUsize::new(0),
        });
        let auth = authenticator(&server, tokens.clone());
        let grant = auth.authenticate(&ChannelName::conversation(42), "1.2").await;

        assert_eq!(grant.unwrap().auth, "key:fresh-sig");
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_401_gives_up_without_more_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "message": "Unauthenticated.",
            })))
            .expect(2)
            .mount(&server)
            .await;

        let tokens = Arc::new(RefreshingToken {
            current: "stale",
            next: Some("still-bad"),
            refreshes: AtomicUsize::new(0),
        });
        let auth = authenticator(&server, tokens.clone());

        assert!(auth
            .authenticate(&ChannelName::conversation(42), "1.2")
            .await
            .is_none());
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = Arc::new(RefreshingToken {
            current: "t",
            next: Some("t2"),
            refreshes: AtomicUsize::new(0),
        });
        let auth = authenticator(&server, tokens.clone());

        assert!(auth
            .authenticate(&ChannelName::inbox(7), "1.2")
            .await
            .is_none());
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "auth": "late" }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let auth = HttpChannelAuthenticator::new(
            format!("{}/broadcasting/auth", server.uri()),
            Arc::new(StaticToken(None)),
            Duration::from_millis(50),
        );
        let err = auth
            .request_grant(&ChannelName::conversation(1), "1.2", None)
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Timeout);
    }
}
