//! CLI arguments, JSON config file loading and upload configuration validation.

use axum::http::Method;
use clap::Parser;
use serde::Deserialize;
use shadow_rs::formatcp;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::build;
use crate::notify::{NotifierClient, NotifyError, TlsOptions};
use crate::paths::{PathError, PathResolver, sanitize_file_name};

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_HTTP_PORT: u16 = 5005;
pub const DEFAULT_UPLOAD_ROUTE: &str = "/upload";
pub const DEFAULT_FILE_FIELD_NAME: &str = "myFile";
pub const DEFAULT_MAX_FILESIZE: u64 = 1_000_000_000;
pub const DEFAULT_MAX_FORM_BUFFER: u64 = 32 * 1024 * 1024;
pub const NOTIFY_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a destination is required: set dest_dir, or root_dir with dest_dir_field_name")]
    MissingDestination,
    #[error("option '{option}' must be a positive byte count")]
    InvalidSize { option: &'static str },
    #[error("option '{option}' is invalid: {source}")]
    InvalidPath {
        option: &'static str,
        source: PathError,
    },
    #[error("invalid notify method {0:?}")]
    InvalidNotifyMethod(String),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-upload", version = VERSION_INFO, about = "Single-file multipart upload server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "AXO_UPLOAD_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_UPLOAD_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "Listen port"
    )]
    pub port: u16,
    #[arg(
        short = 'c',
        long,
        env = "AXO_UPLOAD_TLS_CERT",
        help = "TLS cert path (serves HTTPS together with --tls-key)"
    )]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_UPLOAD_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "AXO_UPLOAD_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_UPLOAD_ROUTE",
        default_value = DEFAULT_UPLOAD_ROUTE,
        help = "Route path accepting uploads"
    )]
    pub upload_route: String,
    #[arg(long, env = "AXO_UPLOAD_CONFIG", help = "JSON file with upload options")]
    pub config: Option<PathBuf>,
    #[command(flatten)]
    pub upload: UploadSettings,
}

impl Args {
    /// 合并命令行/环境变量与配置文件中的上传选项（命令行优先）。
    pub fn upload_settings(&self) -> Result<UploadSettings, ConfigError> {
        match self.config.as_deref() {
            Some(path) => Ok(self.upload.clone().or(UploadSettings::from_file(path)?)),
            None => Ok(self.upload.clone()),
        }
    }
}

/// Raw upload options as given on the command line, in the environment or in
/// the JSON config file. Validated into [`UploadConfig`].
#[derive(clap::Args, Deserialize, Debug, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct UploadSettings {
    #[arg(short = 'd', long, env = "AXO_UPLOAD_DEST_DIR", help = "Directory uploads are stored in")]
    pub dest_dir: Option<String>,
    #[arg(
        long,
        env = "AXO_UPLOAD_DEST_DIR_FIELD_NAME",
        help = "Form field supplying the destination subdirectory per request"
    )]
    pub dest_dir_field_name: Option<String>,
    #[arg(
        long,
        env = "AXO_UPLOAD_ROOT_DIR",
        help = "Base directory destination and template paths are resolved against"
    )]
    pub root_dir: Option<PathBuf>,
    #[arg(long, env = "AXO_UPLOAD_FILE_FIELD_NAME", help = "Multipart field holding the file [default: myFile]")]
    pub file_field_name: Option<String>,
    #[arg(long, env = "AXO_UPLOAD_FILE_NAME", help = "Fixed name for stored files")]
    pub file_name: Option<String>,
    #[arg(long, env = "AXO_UPLOAD_MAX_FILESIZE", help = "Max request body size in bytes [default: 1000000000]")]
    pub max_filesize: Option<u64>,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_FORM_BUFFER",
        help = "Max bytes of a part kept in memory [default: 33554432]"
    )]
    pub max_form_buffer: Option<u64>,
    #[arg(long, env = "AXO_UPLOAD_RESPONSE_TEMPLATE", help = "File served after a successful upload")]
    pub response_template: Option<String>,
    #[arg(long, env = "AXO_UPLOAD_NOTIFY_URL", help = "URL called after a successful upload")]
    pub notify_url: Option<String>,
    #[arg(long, env = "AXO_UPLOAD_NOTIFY_METHOD", help = "HTTP method of the notify call [default: GET]")]
    pub notify_method: Option<String>,
    #[arg(
        long,
        env = "AXO_UPLOAD_INSECURE",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Skip TLS verification for the notify call (--insecure=false to override the config file)"
    )]
    pub insecure: Option<bool>,
    #[arg(long, env = "AXO_UPLOAD_CAPATH", help = "PEM CA bundle trusted by the notify call")]
    pub capath: Option<PathBuf>,
    #[arg(
        long,
        env = "AXO_UPLOAD_CREATE_UUID_DIR",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Store each upload in a fresh random subdirectory"
    )]
    pub create_uuid_dir: Option<bool>,
    #[arg(long, env = "AXO_UPLOAD_SPOOL_DIR", help = "Directory for oversized multipart parts")]
    pub spool_dir: Option<PathBuf>,
}

impl UploadSettings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 以 `self` 为准，缺省项取 `fallback`。
    pub fn or(self, fallback: UploadSettings) -> UploadSettings {
        UploadSettings {
            dest_dir: self.dest_dir.or(fallback.dest_dir),
            dest_dir_field_name: self.dest_dir_field_name.or(fallback.dest_dir_field_name),
            root_dir: self.root_dir.or(fallback.root_dir),
            file_field_name: self.file_field_name.or(fallback.file_field_name),
            file_name: self.file_name.or(fallback.file_name),
            max_filesize: self.max_filesize.or(fallback.max_filesize),
            max_form_buffer: self.max_form_buffer.or(fallback.max_form_buffer),
            response_template: self.response_template.or(fallback.response_template),
            notify_url: self.notify_url.or(fallback.notify_url),
            notify_method: self.notify_method.or(fallback.notify_method),
            insecure: self.insecure.or(fallback.insecure),
            capath: self.capath.or(fallback.capath),
            create_uuid_dir: self.create_uuid_dir.or(fallback.create_uuid_dir),
            spool_dir: self.spool_dir.or(fallback.spool_dir),
        }
    }
}

/// Validated upload configuration, read-only after startup.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Absolute directory every destination is confined to.
    pub root_dir: PathBuf,
    /// Static destination relative to `root_dir`; empty means the root itself.
    pub dest_dir: String,
    pub dest_dir_field_name: Option<String>,
    pub file_field_name: String,
    pub file_name: Option<String>,
    pub max_filesize: u64,
    pub max_form_buffer: usize,
    pub response_template: Option<PathBuf>,
    pub notify: Option<NotifierClient>,
    pub create_uuid_dir: bool,
    pub spool_dir: PathBuf,
}

impl UploadConfig {
    /// 补全默认值并校验全部选项，任何问题都在启动时报错。
    pub fn from_settings(settings: UploadSettings) -> Result<Self, ConfigError> {
        let dest_dir_field_name = non_empty(settings.dest_dir_field_name);
        let (root, dest_dir) = match (non_empty_path(settings.root_dir), non_empty(settings.dest_dir)) {
            (Some(root), Some(dest)) => (root, dest),
            (Some(root), None) if dest_dir_field_name.is_some() => (root, String::new()),
            (None, Some(dest)) => (PathBuf::from(dest), String::new()),
            _ => return Err(ConfigError::MissingDestination),
        };

        let root_dir = std::path::absolute(&root).map_err(|err| ConfigError::InvalidPath {
            option: "root_dir",
            source: PathError::Io(err),
        })?;
        let resolver = PathResolver::new(root_dir.clone());
        resolver
            .sanitize_join(&dest_dir)
            .map_err(|source| ConfigError::InvalidPath {
                option: "dest_dir",
                source,
            })?;

        let response_template = non_empty(settings.response_template)
            .map(|template| {
                resolver
                    .sanitize_join(&template)
                    .map_err(|source| ConfigError::InvalidPath {
                        option: "response_template",
                        source,
                    })
            })
            .transpose()?;

        let file_name = non_empty(settings.file_name)
            .map(|name| match sanitize_file_name(&name) {
                Ok(clean) if clean == name => Ok(clean),
                Ok(_) => Err(ConfigError::InvalidPath {
                    option: "file_name",
                    source: PathError::InvalidName(name),
                }),
                Err(source) => Err(ConfigError::InvalidPath {
                    option: "file_name",
                    source,
                }),
            })
            .transpose()?;

        let max_filesize = settings.max_filesize.unwrap_or(DEFAULT_MAX_FILESIZE);
        if max_filesize == 0 {
            return Err(ConfigError::InvalidSize {
                option: "max_filesize",
            });
        }
        let max_form_buffer = settings
            .max_form_buffer
            .unwrap_or(DEFAULT_MAX_FORM_BUFFER);
        let max_form_buffer = usize::try_from(max_form_buffer)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(ConfigError::InvalidSize {
                option: "max_form_buffer",
            })?;

        let tls = TlsOptions {
            insecure_skip_verify: settings.insecure.unwrap_or(false),
            ca_path: non_empty_path(settings.capath),
        };
        let notify = match non_empty(settings.notify_url) {
            Some(url) => {
                let method = parse_method(settings.notify_method.as_deref())?;
                let notifier = NotifierClient::new(url, method, tls);
                notifier.check_target()?;
                Some(notifier)
            }
            None => {
                if tls.is_set() {
                    warn!("insecure/capath are set without notify_url and will be ignored");
                }
                None
            }
        };

        Ok(Self {
            root_dir,
            dest_dir,
            dest_dir_field_name,
            file_field_name: non_empty(settings.file_field_name)
                .unwrap_or_else(|| DEFAULT_FILE_FIELD_NAME.to_string()),
            file_name,
            max_filesize,
            max_form_buffer,
            response_template,
            notify,
            create_uuid_dir: settings.create_uuid_dir.unwrap_or(false),
            spool_dir: non_empty_path(settings.spool_dir).unwrap_or_else(std::env::temp_dir),
        })
    }
}

fn parse_method(raw: Option<&str>) -> Result<Method, ConfigError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(Method::GET);
    };
    Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
        .map_err(|_| ConfigError::InvalidNotifyMethod(raw.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn non_empty_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|value| !value.as_os_str().is_empty())
}
