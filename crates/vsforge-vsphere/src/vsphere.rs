//! vSphere HTTP client with session-based authentication.
//!
//! Talks to vCenter on `https://{host}:{port}`: the Automation API under
//! `/api/...`, the VI/JSON API under `/sdk/vim25/{release}/...` and the
//! datastore file-access endpoint under `/folder/...`. All three accept the
//! `vmware-api-session-id` header obtained from `POST /api/session`.

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::types::VsphereConfig;

use reqwest::{Body, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// VI/JSON release addressed by [`VsphereClient::vim_path`].
pub const VIM_RELEASE: &str = "8.0.1.0";

const SESSION_HEADER: &str = "vmware-api-session-id";

pub struct VsphereClient {
    client: Client,
    base_url: String,
    session_id: Option<String>,
    config: VsphereConfig,
}

impl VsphereClient {
    /// Build a client from config. No session is created until [`login`](Self::login).
    pub fn new(config: &VsphereConfig) -> VsphereResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VsphereError::connection(format!("Failed to build HTTP client: {e}")))?;

        let base_url = format!("https://{}:{}", config.host, config.port);

        Ok(Self {
            client,
            base_url,
            session_id: None,
            config: config.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_connected(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn config(&self) -> &VsphereConfig {
        &self.config
    }

    /// `/sdk/vim25/{release}/{Type}/{moid}/{member}`
    pub fn vim_path(kind: &str, moid: &str, member: &str) -> String {
        format!("/sdk/vim25/{VIM_RELEASE}/{kind}/{moid}/{member}")
    }

    // ── Session management ──────────────────────────────────────────

    /// POST /api/session
    pub async fn login(&mut self) -> VsphereResult<String> {
        let url = format!("{}/api/session", self.base_url);

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(VsphereError::auth("Invalid credentials"));
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VsphereError::api(status.as_u16(), format!("Login failed: {body}")));
        }

        // returned as a quoted JSON string
        let session_id: String = resp
            .json()
            .await
            .map_err(|e| VsphereError::parse(format!("Failed to parse session response: {e}")))?;

        log::debug!("logged in to {} as {}", self.config.host, self.config.username);
        self.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    /// DELETE /api/session. Failures are ignored; the server expires idle sessions anyway.
    pub async fn logout(&self) -> VsphereResult<()> {
        if let Some(ref sid) = self.session_id {
            let url = format!("{}/api/session", self.base_url);
            if let Err(e) = self.client.delete(&url).header(SESSION_HEADER, sid.as_str()).send().await {
                log::warn!("logout from {} failed: {e}", self.config.host);
            }
        }
        Ok(())
    }

    // ── HTTP helpers ────────────────────────────────────────────────

    fn require_session(&self) -> VsphereResult<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| VsphereError::auth("Not logged in: no active session"))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> VsphereResult<T> {
        self.get_with_params(path, &[]).await
    }

    pub async fn get_with_params<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> VsphereResult<T> {
        let sid = self.require_session()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header(SESSION_HEADER, sid)
            .query(params)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Self::parse_response(resp).await
    }

    /// POST with JSON body, return parsed response.
    pub async fn post<B: serde::Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> VsphereResult<T> {
        let resp = self.post_raw(path, body).await?;
        Self::parse_response(resp).await
    }

    pub async fn post_raw<B: serde::Serialize + ?Sized>(&self, path: &str, body: &B) -> VsphereResult<Response> {
        let sid = self.require_session()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header(SESSION_HEADER, sid)
            .json(body)
            .send()
            .await?;
        Self::check_status(resp).await
    }

    /// POST with no body, discarding the response.
    pub async fn post_empty(&self, path: &str) -> VsphereResult<()> {
        let sid = self.require_session()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).header(SESSION_HEADER, sid).send().await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    pub async fn delete_with_params(&self, path: &str, params: &[(&str, &str)]) -> VsphereResult<()> {
        let sid = self.require_session()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .delete(&url)
            .header(SESSION_HEADER, sid)
            .query(params)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    /// HEAD request; returns the status without mapping it to an error.
    pub async fn head_status(&self, path: &str, params: &[(&str, &str)]) -> VsphereResult<StatusCode> {
        let sid = self.require_session()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .head(&url)
            .header(SESSION_HEADER, sid)
            .query(params)
            .send()
            .await?;
        Ok(resp.status())
    }

    /// PUT a streamed body. `host` replaces the endpoint host so the
    /// transfer goes straight to an ESXi host.
    pub async fn put_stream(
        &self,
        host: Option<&str>,
        path: &str,
        params: &[(&str, &str)],
        len: u64,
        body: Body,
    ) -> VsphereResult<()> {
        let sid = self.require_session()?;
        let base = match host {
            Some(h) => format!("https://{h}"),
            None => self.base_url.clone(),
        };
        let mut url = url::Url::parse(&base)
            .map_err(|e| VsphereError::config(format!("invalid endpoint '{base}': {e}")))?;
        url.set_path(path);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        let resp = self
            .client
            .put(url)
            .header(SESSION_HEADER, sid)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .timeout(Duration::from_secs(3600))
            .body(body)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn check_status(resp: Response) -> VsphereResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let code = status.as_u16();
        let body = resp.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => Err(VsphereError::auth(format!("Session expired or invalid: {body}"))),
            StatusCode::FORBIDDEN => Err(VsphereError::new(
                VsphereErrorKind::AccessDenied,
                format!("Access denied: {body}"),
            )),
            StatusCode::NOT_FOUND => Err(VsphereError::not_found(format!("Resource not found: {body}"))),
            _ => Err(VsphereError::api(code, format!("API error {code}: {}", fault_message(&body)))),
        }
    }

    async fn parse_response<T: DeserializeOwned>(resp: Response) -> VsphereResult<T> {
        let text = resp
            .text()
            .await
            .map_err(|e| VsphereError::parse(format!("Failed to read response body: {e}")))?;

        if text.is_empty() {
            // some endpoints answer success with an empty body
            return serde_json::from_str("null")
                .map_err(|e| VsphereError::parse(format!("Cannot deserialise empty response: {e}")));
        }

        serde_json::from_str(&text).map_err(|e| {
            let end = text.char_indices().nth(500).map(|(i, _)| i).unwrap_or(text.len());
            VsphereError::parse(format!("JSON parse error: {e}; body: {}", &text[..end]))
        })
    }
}

/// Pull the human-readable text out of an Automation or VI/JSON error body.
fn fault_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    let automation = value
        .get("messages")
        .and_then(|m| m.get(0))
        .and_then(|m| m.get("default_message"))
        .and_then(|m| m.as_str());
    let vim = value
        .get("localizedMessage")
        .or_else(|| value.get("faultMessage").and_then(|m| m.get(0)).and_then(|m| m.get("message")))
        .and_then(|m| m.as_str());
    automation.or(vim).map(str::to_string).unwrap_or_else(|| body.to_string())
}
