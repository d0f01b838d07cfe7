//! HTTP(S) 设备传输
//!
//! 认证方式按设备配置；Digest 在收到 401 质询后自动重试一次。

use crate::error::TransportError;
use crate::transport::{Timeouts, Transport};
use crate::types::{Reply, Request};
use async_trait::async_trait;
use devgw_auth::{Credentials, HttpAuth};
use domain::HttpMethod;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, info, warn};

/// HTTP 传输
pub struct HttpTransport {
    base_url: String,
    credentials: Credentials,
    probe_path: Option<String>,
    timeouts: Timeouts,
    client: Option<Client>,
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

/// 请求行里的 request-target（path 与 query），Digest 的 `uri` 取它。
fn request_target(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        },
        Err(_) => url.to_string(),
    }
}

impl HttpTransport {
    pub fn new(
        base_url: String,
        auth: HttpAuth,
        probe_path: Option<String>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: Credentials::new(auth),
            probe_path,
            timeouts,
            client: None,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn send_once(
        &self,
        client: &Client,
        method: HttpMethod,
        path: &str,
        body: Option<&str>,
    ) -> Result<reqwest::Response, TransportError> {
        let url = self.url(path);
        let target = request_target(&url);
        let mut builder = client.request(to_method(method), url.as_str());
        if let Some((name, value)) = self.credentials.authorization(method.as_str(), &target) {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            let trimmed = body.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                builder = builder.header(reqwest::header::CONTENT_TYPE, "application/json");
            }
            builder = builder.body(body.to_string());
        }
        builder.send().await.map_err(map_reqwest)
    }

    /// 发送请求；401 且为 Digest 时更新质询后重试一次。
    async fn exchange(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&str>,
    ) -> Result<Vec<u8>, TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotOpen)?;
        let mut response = self.send_once(client, method, path, body).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            if let Some(challenge) = challenge {
                match self.credentials.accept_challenge(&challenge) {
                    Ok(true) => {
                        debug!(target: "devgw.protocol", path = %path, "digest_challenge_accepted");
                        response = self.send_once(client, method, path, body).await?;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(target: "devgw.protocol", path = %path, error = %err, "digest_challenge_rejected");
                    }
                }
            }
        }

        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest)?;
        if status.is_server_error() {
            return Err(TransportError::Io(format!("{} {}: {}", method.as_str(), path, status)));
        }
        if !status.is_success() {
            return Err(TransportError::Protocol(format!(
                "{} {}: {}",
                method.as_str(),
                path,
                status
            )));
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.client.is_some() {
            return Ok(());
        }
        let client = Client::builder()
            .connect_timeout(self.timeouts.connect)
            .timeout(self.timeouts.request)
            .build()
            .map_err(|e| TransportError::ConfigParse(e.to_string()))?;
        self.client = Some(client);

        if let Some(probe) = self.probe_path.clone() {
            if let Err(err) = self.exchange(HttpMethod::Get, &probe, None).await {
                self.client = None;
                return Err(match err {
                    TransportError::Protocol(reason) => TransportError::Connect(reason),
                    other => other,
                });
            }
        }
        info!(target: "devgw.protocol", base_url = %self.base_url, "http_ready");
        Ok(())
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            info!(target: "devgw.protocol", base_url = %self.base_url, "http_closed");
        }
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }

    async fn request(&mut self, request: Request) -> Result<Reply, TransportError> {
        match request {
            Request::Http { method, path, body } => {
                let bytes = self.exchange(method, &path, body.as_deref()).await?;
                Ok(Reply::Frame(bytes))
            }
            other => Err(TransportError::Unsupported(format!(
                "http cannot {}",
                other.describe()
            ))),
        }
    }
}
