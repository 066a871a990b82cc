//! Remote HTTP endpoint: snapshot pushes and magic-link requests.
//!
//! The engine only sees [`RemoteTransport`]; [`Backend`] decides once, at
//! configuration time, whether a real endpoint exists at all.
//!
//! Endpoints:
//! - `POST <base>/api/projects`        body `{ userId, data, updatedAt }`
//! - `POST <base>/api/auth/magic-link` body `{ email }`

use crate::config::SyncConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const PROJECTS_PATH: &str = "/api/projects";
const MAGIC_LINK_PATH: &str = "/api/auth/magic-link";

/// Body of a snapshot push.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub user_id: String,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl PushRequest {
    /// Build a push for an opaque project payload.
    ///
    /// JSON payloads are embedded as-is; anything else is sent as a string.
    pub fn new(user_id: impl Into<String>, payload: &[u8], updated_at: DateTime<Utc>) -> Self {
        let data = serde_json::from_slice(payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(payload).into_owned())
        });
        Self {
            user_id: user_id.into(),
            data,
            updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct MagicLinkRequest<'a> {
    email: &'a str,
}

/// A remote snapshot/auth endpoint.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn push_project(&self, request: &PushRequest) -> Result<(), TransportError>;

    async fn request_magic_link(&self, email: &str) -> Result<(), TransportError>;
}

/// `reqwest`-based transport.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(base_url: &str, config: &SyncConfig) -> Result<Self, TransportError> {
        Self::new(
            base_url,
            config.api_key.clone(),
            config.connect_timeout,
            config.push_timeout,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        authorize: bool,
    ) -> Result<(), TransportError> {
        let mut request = self.client.post(self.url(path)).json(body);
        if authorize {
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

/// Map a `reqwest` failure onto the transport taxonomy.
///
/// A connect timeout is still "could not connect".
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Unreachable(err.to_string())
    } else if err.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = err.status() {
        TransportError::Rejected {
            status: status.as_u16(),
        }
    } else if err.is_builder() || err.is_body() {
        TransportError::Encode(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn push_project(&self, request: &PushRequest) -> Result<(), TransportError> {
        log::debug!("Pushing project for {} to {}", request.user_id, self.base_url);
        self.post(PROJECTS_PATH, request, true).await
    }

    async fn request_magic_link(&self, email: &str) -> Result<(), TransportError> {
        log::debug!("Requesting magic link for {email}");
        self.post(MAGIC_LINK_PATH, &MagicLinkRequest { email }, false)
            .await
    }
}

/// Remote backend strategy, chosen once from configuration.
#[derive(Clone)]
pub enum Backend {
    /// No remote configured: everything stays local
    Null,
    Real(Arc<dyn RemoteTransport>),
}

impl Backend {
    /// `Real` over HTTP when a base URL is configured.
    pub fn from_config(config: &SyncConfig) -> Result<Self, TransportError> {
        match &config.remote_base_url {
            Some(base) => {
                let transport = HttpTransport::from_config(base, config)?;
                log::info!("Remote sync endpoint: {base}");
                Ok(Backend::Real(Arc::new(transport)))
            }
            None => {
                log::info!("No remote endpoint configured, running local-only");
                Ok(Backend::Null)
            }
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Backend::Real(_))
    }

    pub fn transport(&self) -> Option<&Arc<dyn RemoteTransport>> {
        match self {
            Backend::Real(transport) => Some(transport),
            Backend::Null => None,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Null => f.write_str("Backend::Null"),
            Backend::Real(_) => f.write_str("Backend::Real"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport_for(server: &MockServer) -> HttpTransport {
        HttpTransport::new(
            server.uri(),
            Some("secret".into()),
            Duration::from_millis(500),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_push_request_embeds_json_payload() {
        let at = Utc::now();
        let req = PushRequest::new("u1", br#"{"title":"Draft"}"#, at);
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["userId"], "u1");
        assert_eq!(body["data"]["title"], "Draft");
        assert_eq!(body["updatedAt"], serde_json::json!(at));
    }

    #[test]
    fn test_push_request_non_json_payload_is_string() {
        let req = PushRequest::new("u1", b"plain text", Utc::now());
        assert_eq!(req.data, serde_json::Value::String("plain text".into()));
    }

    #[test]
    fn test_backend_from_config() {
        assert!(!Backend::from_config(&SyncConfig::for_testing()).unwrap().is_real());
        let config = SyncConfig::for_testing().with_remote("http://127.0.0.1:9", None);
        assert!(Backend::from_config(&config).unwrap().is_real());
    }

    #[tokio::test]
    async fn test_push_sends_bearer_and_body() {
        let server = MockServer::start().await;
        let at = Utc::now();
        let request = PushRequest::new("u1", br#"{"v":1}"#, at);

        Mock::given(method("POST"))
            .and(path("/api/projects"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(serde_json::json!({
                "userId": "u1",
                "data": {"v": 1},
                "updatedAt": at,
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        transport_for(&server).push_project(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/projects"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = transport_for(&server)
            .push_project(&PushRequest::new("u1", b"{}", Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Rejected { status: 500 });
    }

    #[tokio::test]
    async fn test_slow_endpoint_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/magic-link"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let err = transport_for(&server)
            .request_magic_link("writer@example.com")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout);
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(
            format!("http://127.0.0.1:{port}"),
            None,
            Duration::from_millis(500),
            Duration::from_secs(1),
        )
        .unwrap();
        let err = transport.request_magic_link("a@b.co").await.unwrap_err();
        assert!(err.is_unreachable(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_magic_link_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/magic-link"))
            .and(body_json(serde_json::json!({"email": "writer@example.com"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        transport_for(&server)
            .request_magic_link("writer@example.com")
            .await
            .unwrap();
    }
}
