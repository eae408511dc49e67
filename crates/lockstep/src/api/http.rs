//! reqwest client for the sync API.

use std::time::Duration;

use async_trait::async_trait;
use lockconf::ApiConfig;
use lockproto::{
    ApiErrorBody, ApiResponse, CreateProfileRequest, CreateSessionRequest, PositionAck,
    PositionReport, Profile, Session, SessionId, ShareLink, TimestampRequest,
    UpdateSessionRequest,
};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::{ApiError, SessionApi};

pub struct HttpSessionApi {
    base_url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpSessionApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            auth_token: None,
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self, ApiError> {
        let api = Self::new(&config.base_url, Duration::from_millis(config.timeout_ms))?;
        Ok(match &config.auth_token {
            Some(token) => api.with_token(token.clone()),
            None => api,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let body = Self::checked_body(builder).await?;
        // A refusal may carry `"data": null`, so check `success` first.
        let envelope: ApiResponse<serde_json::Value> =
            serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
        if !envelope.success {
            return Err(ApiError::Rejected(envelope.message));
        }
        serde_json::from_value(envelope.data).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<(), ApiError> {
        Self::checked_body(builder).await.map(|_| ())
    }

    async fn checked_body(builder: RequestBuilder) -> Result<Vec<u8>, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        if status.is_success() {
            return Ok(body);
        }

        let message = serde_json::from_slice::<ApiErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        tracing::debug!(status = status.as_u16(), %message, "sync api error");

        if status == StatusCode::NOT_FOUND {
            Err(ApiError::NotFound(message))
        } else {
            Err(ApiError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    #[tracing::instrument(skip(self, request))]
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, ApiError> {
        self.send(self.request(Method::POST, "/sync/sessions").json(request))
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn create_session_from_profile(&self, profile_id: &str) -> Result<Session, ApiError> {
        let path = format!("/sync/profiles/{profile_id}/create-session");
        self.send(self.request(Method::POST, &path)).await
    }

    #[tracing::instrument(skip(self))]
    async fn get_session(&self, id: &SessionId) -> Result<Session, ApiError> {
        self.send(self.request(Method::GET, &format!("/sync/sessions/{id}")))
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn get_shared_session(&self, share_code: &str) -> Result<Session, ApiError> {
        let code = super::share_code(share_code);
        self.send(self.request(Method::GET, &format!("/sync/shared/{code}")))
            .await
    }

    #[tracing::instrument(skip(self, update))]
    async fn update_session(
        &self,
        id: &SessionId,
        update: &UpdateSessionRequest,
    ) -> Result<Session, ApiError> {
        let path = format!("/sync/sessions/{id}");
        self.send(self.request(Method::PUT, &path).json(update)).await
    }

    #[tracing::instrument(skip(self))]
    async fn delete_session(&self, id: &SessionId) -> Result<(), ApiError> {
        self.send_empty(self.request(Method::DELETE, &format!("/sync/sessions/{id}")))
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn start_countdown(&self, id: &SessionId) -> Result<Session, ApiError> {
        let path = format!("/sync/sessions/{id}/countdown");
        self.send(self.request(Method::POST, &path)).await
    }

    #[tracing::instrument(skip(self))]
    async fn set_timestamp(&self, id: &SessionId, timestamp: f64) -> Result<Session, ApiError> {
        let path = format!("/sync/sessions/{id}/timestamp");
        self.send(
            self.request(Method::POST, &path)
                .json(&TimestampRequest { timestamp }),
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn report_positions(
        &self,
        id: &SessionId,
        report: PositionReport,
    ) -> Result<PositionAck, ApiError> {
        let path = format!("/sync/sessions/{id}/positions");
        self.send(self.request(Method::POST, &path).json(&report))
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn generate_share_link(&self, id: &SessionId) -> Result<String, ApiError> {
        let path = format!("/sync/sessions/{id}/share");
        let link: ShareLink = self.send(self.request(Method::POST, &path)).await?;
        Ok(link.shareable_link)
    }

    #[tracing::instrument(skip(self, request))]
    async fn create_profile(&self, request: &CreateProfileRequest) -> Result<Profile, ApiError> {
        self.send(self.request(Method::POST, "/sync/profiles").json(request))
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn get_profile(&self, id: &str) -> Result<Profile, ApiError> {
        self.send(self.request(Method::GET, &format!("/sync/profiles/{id}")))
            .await
    }

    #[tracing::instrument(skip(self, request))]
    async fn update_profile(
        &self,
        id: &str,
        request: &CreateProfileRequest,
    ) -> Result<Profile, ApiError> {
        let path = format!("/sync/profiles/{id}");
        self.send(self.request(Method::PUT, &path).json(request))
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn delete_profile(&self, id: &str) -> Result<(), ApiError> {
        self.send_empty(self.request(Method::DELETE, &format!("/sync/profiles/{id}")))
            .await
    }
}
