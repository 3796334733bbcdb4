//! axo-upload server binary.
//!
//! Accepts single-file multipart uploads on one route, stores them under a
//! configured directory and either answers with a response template or hands
//! the upload result to the default JSON handler. The entry point validates
//! configuration, builds the Axum router and starts an HTTP or HTTPS listener.

mod atomic;
mod config;
mod error;
mod etag;
mod form;
mod http;
mod logging;
mod notify;
mod paths;
mod spool;
mod template;
mod tls;
mod upload;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum::middleware;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span};

use crate::config::Args;
use crate::http::{REQUEST_ID_HEADER, build_cors_layer, resolve_client_ip};
use crate::upload::{UploadPipeline, upload_router};

shadow!(build);

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), Error> {
    logging::init_logging();
    tls::install_crypto_provider();

    let args = Args::parse();
    if !args.upload_route.starts_with('/') {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("upload route {:?} must start with '/'", args.upload_route),
        ));
    }

    let pipeline = args
        .upload_settings()
        .and_then(UploadPipeline::new)
        .map_err(|err| {
            error!(error = %err, "invalid upload configuration");
            Error::new(ErrorKind::InvalidInput, err)
        })?;
    pipeline.prepare().await.map_err(|err| {
        error!(error = %err, "failed to prepare upload directories");
        Error::other(err)
    })?;

    let upload_config = pipeline.config();
    info!(
        root = %upload_config.root_dir.display(),
        field = %upload_config.file_field_name,
        max_filesize = upload_config.max_filesize,
        isolation = upload_config.create_uuid_dir,
        notify = upload_config.notify.as_ref().map(|notifier| notifier.url()),
        notify_method = upload_config.notify.as_ref().map(|notifier| notifier.method().as_str()),
        "upload pipeline configured"
    );

    let mut app = upload_router(Arc::new(pipeline), &args.upload_route)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    let request_id = request
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default();

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        request_id,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| Error::new(ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let tls_config = tls::build_rustls_config(&args).await?;
    let handle = Handle::new();
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    tokio::spawn(shutdown_signal(handle.clone()));
    match tls_config {
        Some(tls_config) => {
            info!("🔒 Starting HTTPS server at {}{}", addr, args.upload_route);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(service)
                .await?;
        }
        None => {
            info!("🚀 Starting HTTP server at {}{}", addr, args.upload_route);
            axum_server::bind(addr).handle(handle).serve(service).await?;
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
