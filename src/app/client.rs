//! qBittorrent Web API client.
//!
//! Authentication is a cookie session: `POST /api/v2/auth/login` answers
//! `Ok.` and sets `SID`. A 403 on any later call drops the session so the
//! next call logs in again. Calls are never retried here.

use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::error::{AppError, AppResult};
use super::{ApplicationPortConfig, PreferencesApi};
use crate::config::QbittorrentConfig;

const LOGIN: &str = "/api/v2/auth/login";
const VERSION: &str = "/api/v2/app/version";
const PREFERENCES: &str = "/api/v2/app/preferences";
const SET_PREFERENCES: &str = "/api/v2/app/setPreferences";

/// The subset of preferences portkeeper manages.
#[derive(Debug, Deserialize)]
struct Preferences {
    #[serde(default)]
    listen_port: u16,
    #[serde(default)]
    current_network_interface: String,
}

/// Client for the qBittorrent Web API.
pub struct QbittorrentClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    authenticated: bool,
}

impl QbittorrentClient {
    /// Build a client from configuration.
    pub fn new(config: &QbittorrentConfig) -> AppResult<Self> {
        Self::with_base_url(
            config.base_url(),
            &config.username,
            &config.password,
            config.verify_ssl,
            Duration::from_secs(config.request_timeout),
        )
    }

    /// Build a client against an explicit base URL.
    pub fn with_base_url(
        base_url: String,
        username: &str,
        password: &str,
        verify_ssl: bool,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .map_err(AppError::ClientBuild)?;

        Ok(Self {
            http,
            base_url,
            username: username.to_string(),
            password: password.to_string(),
            authenticated: false,
        })
    }

    async fn ensure_authenticated(&mut self) -> AppResult<()> {
        if self.username.is_empty() || self.authenticated {
            return Ok(());
        }

        let response = self
            .http
            .post(format!("{}{}", self.base_url, LOGIN))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|source| AppError::Unreachable {
                endpoint: LOGIN.to_string(),
                source,
            })?;
        let response = check_status(LOGIN, response)?;
        let body = text(LOGIN, response).await?;

        if body.trim() == "Ok." {
            info!("Authenticated with qBittorrent");
            self.authenticated = true;
            Ok(())
        } else {
            Err(AppError::AuthFailed(body.trim().to_string()))
        }
    }

    async fn request(
        &mut self,
        method: Method,
        endpoint: &'static str,
        form: Option<&[(&str, String)]>,
    ) -> AppResult<Response> {
        self.ensure_authenticated().await?;

        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, endpoint));
        if let Some(form) = form {
            builder = builder.form(form);
        }
        let response = builder.send().await.map_err(|source| AppError::Unreachable {
            endpoint: endpoint.to_string(),
            source,
        })?;

        if response.status() == StatusCode::FORBIDDEN && !self.username.is_empty() {
            debug!("qBittorrent session rejected, will re-authenticate");
            self.authenticated = false;
        }
        check_status(endpoint, response)
    }
}

impl PreferencesApi for QbittorrentClient {
    async fn version(&mut self) -> AppResult<String> {
        let response = self.request(Method::GET, VERSION, None).await?;
        Ok(text(VERSION, response).await?.trim().to_string())
    }

    async fn listen_settings(&mut self) -> AppResult<ApplicationPortConfig> {
        let response = self.request(Method::GET, PREFERENCES, None).await?;
        let prefs: Preferences =
            response
                .json()
                .await
                .map_err(|source| AppError::InvalidResponse {
                    endpoint: PREFERENCES.to_string(),
                    source,
                })?;
        Ok(ApplicationPortConfig {
            listen_port: prefs.listen_port,
            bound_interface: prefs.current_network_interface,
        })
    }

    async fn set_listen_settings(&mut self, config: &ApplicationPortConfig) -> AppResult<()> {
        let payload = json!({
            "listen_port": config.listen_port,
            "current_network_interface": config.bound_interface,
        });
        let form = [("json", payload.to_string())];
        self.request(Method::POST, SET_PREFERENCES, Some(&form[..]))
            .await?;
        Ok(())
    }
}

fn check_status(endpoint: &str, response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(AppError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        })
    }
}

async fn text(endpoint: &str, response: Response) -> AppResult<String> {
    response
        .text()
        .await
        .map_err(|source| AppError::InvalidResponse {
            endpoint: endpoint.to_string(),
            source,
        })
}
