//! TLS 证书加载：同时提供证书与私钥时启用 HTTPS。

use axum_server::tls_rustls::RustlsConfig;
use std::io::{Error, ErrorKind};
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 安装进程级 rustls 加密后端（aws-lc-rs），重复调用无副作用。
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// 构建 Rustls 配置；未配置证书时返回 `None`，只配置一半视为错误。
pub async fn build_rustls_config(args: &Args) -> Result<Option<RustlsConfig>, Error> {
    let (cert_path, key_path) = match (args.tls_cert.as_deref(), args.tls_key.as_deref()) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => return Ok(None),
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "--tls-cert and --tls-key must be given together",
            ));
        }
    };

    install_crypto_provider();
    let cert = fs::read(cert_path).await?;
    let key = fs::read(key_path).await?;
    info!(cert = cert_path, "loaded tls certificate");
    RustlsConfig::from_pem(cert, key).await.map(Some)
}
