//! 上传完成后的 Webhook 通知：独立 TLS 信任策略、短超时、失败只记录日志。

use axum::http::{Method, StatusCode};
use reqwest::{Certificate, Client, Url};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NOTIFY_TIMEOUT_SECS;

pub const USER_AGENT: &str = concat!("axo-upload/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid notify url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("option '{option}' makes no sense without scheme https")]
    InsecureScheme { option: &'static str },
    #[error("failed to read capath {path:?}: {source}")]
    ReadCaBundle { path: PathBuf, source: io::Error },
    #[error("failed to parse ca certificate {path:?} as PEM: {source}")]
    ParseCaBundle { path: PathBuf, source: reqwest::Error },
    #[error("no PEM certificate found in capath {path:?}")]
    EmptyCaBundle { path: PathBuf },
    #[error("failed to build notify client: {0}")]
    BuildClient(#[source] reqwest::Error),
    #[error("failed to build notify request: {0}")]
    BuildRequest(#[source] reqwest::Error),
    #[error("notify request failed: {0}")]
    Request(#[source] reqwest::Error),
}

/// Trust policy for the notify call; only valid for `https` targets.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    pub insecure_skip_verify: bool,
    pub ca_path: Option<PathBuf>,
}

impl TlsOptions {
    pub fn is_set(&self) -> bool {
        self.insecure_skip_verify || self.ca_path.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct NotifierClient {
    url: String,
    method: Method,
    tls: TlsOptions,
    timeout: Duration,
}

impl NotifierClient {
    pub fn new(url: impl Into<String>, method: Method, tls: TlsOptions) -> Self {
        Self {
            url: url.into(),
            method,
            tls,
            timeout: Duration::from_secs(NOTIFY_TIMEOUT_SECS),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// 解析 URL 并校验 TLS 选项只用于 https。
    pub fn check_target(&self) -> Result<Url, NotifyError> {
        let url = Url::parse(&self.url).map_err(|err| NotifyError::InvalidUrl {
            url: self.url.clone(),
            reason: err.to_string(),
        })?;
        let secure = url.scheme() == "https";
        if self.tls.insecure_skip_verify && !secure {
            return Err(NotifyError::InsecureScheme { option: "insecure" });
        }
        if self.tls.ca_path.is_some() && !secure {
            return Err(NotifyError::InsecureScheme { option: "capath" });
        }
        Ok(url)
    }

    async fn build_client(&self) -> Result<Client, NotifyError> {
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .user_agent(USER_AGENT);

        if self.tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(path) = self.tls.ca_path.as_ref() {
            let pem = tokio::fs::read(path).await.map_err(|source| NotifyError::ReadCaBundle {
                path: path.clone(),
                source,
            })?;
            let certificates =
                Certificate::from_pem_bundle(&pem).map_err(|source| NotifyError::ParseCaBundle {
                    path: path.clone(),
                    source,
                })?;
            if certificates.is_empty() {
                return Err(NotifyError::EmptyCaBundle { path: path.clone() });
            }
            builder = builder.tls_built_in_root_certs(false);
            for certificate in certificates {
                builder = builder.add_root_certificate(certificate);
            }
        }

        builder.build().map_err(NotifyError::BuildClient)
    }

    /// 发送一次无请求体的通知，返回对端状态码。
    pub async fn notify(&self, request_id: &str) -> Result<StatusCode, NotifyError> {
        let url = self.check_target()?;
        let client = self.build_client().await?;
        let request = client
            .request(self.method.clone(), url)
            .build()
            .map_err(NotifyError::BuildRequest)?;

        debug!(request_id, method = %request.method(), url = %request.url(), "sending notify");
        let response = client.execute(request).await.map_err(NotifyError::Request)?;
        let status = response.status();
        if !status.is_success() {
            warn!(
                request_id,
                status = status.as_u16(),
                url = %self.url,
                "notify endpoint returned non-success"
            );
        }
        Ok(status)
    }
}

/// 以独立任务发送通知，结果只写入日志，不影响上传响应。
pub fn dispatch(notifier: Arc<NotifierClient>, request_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.notify(&request_id).await {
            Ok(status) => info!(request_id = %request_id, status = status.as_u16(), "notify delivered"),
            Err(err) => error!(request_id = %request_id, url = notifier.url(), error = %err, "notify error"),
        }
    })
}
