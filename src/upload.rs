//! 单文件 multipart 上传流水线：解码、定位目标目录、原子写入、通知与响应。

use axum::Router;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{Json, Response};
use axum::routing::any;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::atomic::AtomicFile;
use crate::config::{ConfigError, UploadConfig, UploadSettings};
use crate::error::UploadError;
use crate::form::{FormLimits, decode_upload_form};
use crate::http::request_id;
use crate::notify::{self, NotifierClient};
use crate::paths::{PathError, PathResolver, sanitize_file_name};
use crate::template::serve_template;

/// Outcome of one stored upload, handed to the next handler.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub file_name: String,
    pub file_size: u64,
    pub bytes_written: u64,
    pub directory: String,
    pub isolation_dir: Option<String>,
    pub request_id: String,
    pub content_type: Option<String>,
}

/// Flat `upload.*` variables derived from [`UploadResult`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadVars(BTreeMap<&'static str, String>);

impl UploadVars {
    pub const FILENAME: &'static str = "upload.filename";
    pub const FILESIZE: &'static str = "upload.filesize";
    pub const BYTES_WRITTEN: &'static str = "upload.bytes_written";
    pub const DIRECTORY: &'static str = "upload.directory";
    pub const MAX_FILESIZE: &'static str = "upload.max_filesize";
    pub const REQUEST_ID: &'static str = "upload.request_id";
    pub const ISOLATION_DIR: &'static str = "upload.isolation_dir";

    pub fn from_result(result: &UploadResult, max_filesize: u64) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(Self::FILENAME, result.file_name.clone());
        vars.insert(Self::FILESIZE, result.file_size.to_string());
        vars.insert(Self::BYTES_WRITTEN, result.bytes_written.to_string());
        vars.insert(Self::DIRECTORY, result.directory.clone());
        vars.insert(Self::MAX_FILESIZE, max_filesize.to_string());
        vars.insert(Self::REQUEST_ID, result.request_id.clone());
        if let Some(dir) = &result.isolation_dir {
            vars.insert(Self::ISOLATION_DIR, dir.clone());
        }
        Self(vars)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(key, value)| (*key, value.as_str()))
    }
}

/// Validated configuration plus the helpers every request shares.
#[derive(Debug)]
pub struct UploadPipeline {
    config: UploadConfig,
    resolver: PathResolver,
    notifier: Option<Arc<NotifierClient>>,
}

impl UploadPipeline {
    pub fn new(settings: UploadSettings) -> Result<Self, ConfigError> {
        UploadConfig::from_settings(settings).map(Self::from_config)
    }

    pub fn from_config(config: UploadConfig) -> Self {
        let resolver = PathResolver::new(config.root_dir.clone());
        let notifier = config.notify.clone().map(Arc::new);
        Self {
            config,
            resolver,
            notifier,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 启动时创建静态目标目录与暂存目录。
    pub async fn prepare(&self) -> Result<(), UploadError> {
        let destination = self.resolver.resolve_checked(&self.config.dest_dir).await?;
        for dir in [&destination, &self.config.spool_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| UploadError::DirectoryCreation {
                    path: dir.clone(),
                    source,
                })?;
        }
        info!(
            destination = %destination.display(),
            spool_dir = %self.config.spool_dir.display(),
            "upload destination ready"
        );
        Ok(())
    }

    /// 处理一次上传直至文件落盘，返回结果元数据。
    pub async fn process(
        &self,
        headers: &HeaderMap,
        body: AxumBody,
        request_id: &str,
    ) -> Result<UploadResult, UploadError> {
        let config = &self.config;
        let mut form = decode_upload_form(
            headers,
            body,
            FormLimits {
                file_field: &config.file_field_name,
                max_body: config.max_filesize,
                memory_limit: config.max_form_buffer,
                spool_dir: &config.spool_dir,
            },
        )
        .await?;
        let part = form.file.take().ok_or_else(|| {
            UploadError::FileRetrieval(format!(
                "no file part named {:?}",
                config.file_field_name
            ))
        })?;

        let requested = config
            .dest_dir_field_name
            .as_deref()
            .and_then(|field| form.field(field))
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let relative = requested.unwrap_or(&config.dest_dir);
        let mut directory = self.resolver.resolve_checked(relative).await?;
        create_directory(&directory).await?;

        let mut isolation_dir = None;
        if config.create_uuid_dir {
            let (name, path) = self
                .resolver
                .fresh_subdirectory(&directory)
                .await
                .map_err(|err| match err {
                    PathError::Io(source) => UploadError::DirectoryCreation {
                        path: directory.clone(),
                        source,
                    },
                    other => UploadError::PathResolution(other),
                })?;
            debug!(request_id, isolation_dir = %name, "created isolation directory");
            isolation_dir = Some(name);
            directory = path;
        }

        let file_name = match &config.file_name {
            Some(name) => name.clone(),
            None => sanitize_file_name(&part.file_name)?,
        };
        let target = directory.join(&file_name);
        let file_size = part.data.len();

        let mut atomic = AtomicFile::new(&target)
            .await
            .map_err(|source| write_error(&target, source))?;
        let bytes_written = match part.data.copy_into(atomic.file_mut()).await {
            Ok(written) => written,
            Err(source) => {
                atomic.cleanup().await;
                return Err(write_error(&target, source));
            }
        };
        atomic
            .finalize()
            .await
            .map_err(|source| write_error(&target, source))?;

        Ok(UploadResult {
            file_name,
            file_size,
            bytes_written,
            directory: directory.display().to_string(),
            isolation_dir,
            request_id: request_id.to_string(),
            content_type: part.content_type,
        })
    }
}

async fn create_directory(path: &Path) -> Result<(), UploadError> {
    fs::create_dir_all(path)
        .await
        .map_err(|source| UploadError::DirectoryCreation {
            path: path.to_path_buf(),
            source,
        })
}

fn write_error(target: &Path, source: std::io::Error) -> UploadError {
    UploadError::Write {
        path: target.to_path_buf(),
        source,
    }
}

/// 上传中间件：成功后派发通知，再返回模板或交给下一个处理器。
pub async fn upload_middleware(
    State(pipeline): State<Arc<UploadPipeline>>,
    request: Request,
    next: Next,
) -> Result<Response, UploadError> {
    let (mut parts, body) = request.into_parts();
    let request_id = request_id(&parts.headers);

    let result = match pipeline.process(&parts.headers, body, &request_id).await {
        Ok(result) => result,
        Err(err) => {
            error!(
                request_id = %request_id,
                status = err.status().as_u16(),
                error = %err,
                "upload failed"
            );
            return Err(err);
        }
    };

    info!(
        request_id = %request_id,
        file_name = %result.file_name,
        bytes_written = result.bytes_written,
        directory = %result.directory,
        "upload stored"
    );
    if result.bytes_written != result.file_size {
        warn!(
            request_id = %request_id,
            file_size = result.file_size,
            bytes_written = result.bytes_written,
            "stored size differs from decoded part size"
        );
    }

    if let Some(notifier) = &pipeline.notifier {
        notify::dispatch(notifier.clone(), request_id.clone());
    }

    if let Some(template) = &pipeline.config.response_template {
        return serve_template(template, &parts.method, &parts.headers)
            .await
            .inspect_err(|err| error!(request_id = %request_id, error = %err, "response template failed"));
    }

    parts.extensions.insert(UploadVars::from_result(
        &result,
        pipeline.config.max_filesize,
    ));
    parts.extensions.insert(result);
    Ok(next.run(Request::from_parts(parts, AxumBody::empty())).await)
}

/// 默认的后续处理器：以 JSON 返回上传结果。
pub async fn upload_complete(Extension(result): Extension<UploadResult>) -> Json<UploadResult> {
    Json(result)
}

/// 在 `route` 上挂载上传流水线与默认处理器。
pub fn upload_router(pipeline: Arc<UploadPipeline>, route: &str) -> Router {
    Router::new().route(
        route,
        any(upload_complete).layer(middleware::from_fn_with_state(pipeline, upload_middleware)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::tests::{multipart_body, multipart_content_type};
    use crate::notify::USER_AGENT;
    use crate::notify::tests::spawn_endpoint;
    use axum::http::{Method, StatusCode, header};
    use axum::routing::post;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::collections::HashSet;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::net::TcpListener;
    use tokio::task::JoinSet;
    use tower::ServiceExt;

    fn settings(dest: &Path) -> UploadSettings {
        UploadSettings {
            dest_dir: Some(dest.display().to_string()),
            max_filesize: Some(10 * 1024 * 1024),
            ..UploadSettings::default()
        }
    }

    fn app(settings: UploadSettings) -> Router {
        let pipeline = UploadPipeline::new(settings).expect("pipeline");
        upload_router(Arc::new(pipeline), "/upload")
    }

    fn upload_request(parts: &[(&str, Option<&str>, &[u8])]) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(header::CONTENT_TYPE, multipart_content_type())
            .body(AxumBody::from(multipart_body(parts)))
            .expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|iter| iter.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn stores_file_and_runs_next_handler() {
        let temp = tempdir().expect("tempdir");
        let response = app(settings(temp.path()))
            .oneshot(upload_request(&[("myFile", Some("a.txt"), b"abc")]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["fileName"], "a.txt");
        assert_eq!(body["fileSize"], 3);
        assert_eq!(body["bytesWritten"], 3);
        assert_eq!(body["directory"], temp.path().display().to_string());
        assert_eq!(std::fs::read(temp.path().join("a.txt")).expect("stored"), b"abc");
    }

    #[tokio::test]
    async fn wrong_field_is_a_server_error() {
        let temp = tempdir().expect("tempdir");
        let response = app(settings(temp.path()))
            .oneshot(upload_request(&[("wrongField", Some("a.txt"), b"abc")]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(entries(temp.path()), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_without_writing() {
        let temp = tempdir().expect("tempdir");
        let mut settings = settings(temp.path());
        settings.max_filesize = Some(10);
        let response = app(settings)
            .oneshot(upload_request(&[("myFile", Some("big.txt"), b"0123456789abc")]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(entries(temp.path()), 0);
    }

    #[tokio::test]
    async fn per_request_destination_is_confined_to_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        let settings = UploadSettings {
            root_dir: Some(root.clone()),
            dest_dir_field_name: Some("folder".into()),
            ..UploadSettings::default()
        };
        let app = app(settings);

        let response = app
            .clone()
            .oneshot(upload_request(&[
                ("folder", None, b"reports/2024"),
                ("myFile", Some("a.txt"), b"abc"),
            ]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(root.join("reports/2024/a.txt").is_file());

        for folder in ["../escape", "reports/../../escape", "..\\escape"] {
            let response = app
                .clone()
                .oneshot(upload_request(&[
                    ("folder", None, folder.as_bytes()),
                    ("myFile", Some("a.txt"), b"abc"),
                ]))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR, "{folder}");
        }
        assert!(!temp.path().join("escape").exists());
    }

    #[tokio::test]
    async fn empty_destination_field_falls_back_to_static_destination() {
        let temp = tempdir().expect("tempdir");
        let settings = UploadSettings {
            root_dir: Some(temp.path().to_path_buf()),
            dest_dir: Some("inbox".into()),
            dest_dir_field_name: Some("folder".into()),
            ..UploadSettings::default()
        };
        let response = app(settings)
            .oneshot(upload_request(&[
                ("folder", None, b"  "),
                ("myFile", Some("a.txt"), b"abc"),
            ]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(temp.path().join("inbox/a.txt").is_file());
    }

    #[tokio::test]
    async fn client_file_name_is_reduced_to_last_component() {
        let temp = tempdir().expect("tempdir");
        let response = app(settings(temp.path()))
            .oneshot(upload_request(&[("myFile", Some("../../etc/passwd"), b"x")]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(temp.path().join("passwd").is_file());
    }

    #[tokio::test]
    async fn concurrent_isolated_uploads_use_distinct_directories() {
        let temp = tempdir().expect("tempdir");
        let mut settings = settings(temp.path());
        settings.create_uuid_dir = Some(true);
        let app = app(settings);

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let app = app.clone();
            tasks.spawn(async move {
                let response = app
                    .oneshot(upload_request(&[("myFile", Some("b.txt"), b"same name")]))
                    .await
                    .expect("response");
                assert_eq!(response.status(), StatusCode::OK);
                json_body(response).await
            });
        }

        let mut names = HashSet::new();
        while let Some(body) = tasks.join_next().await {
            let body = body.expect("task");
            let name = body["isolationDir"].as_str().expect("isolation dir").to_string();
            assert!(temp.path().join(&name).join("b.txt").is_file());
            names.insert(name);
        }
        assert_eq!(names.len(), 8);
    }

    #[tokio::test]
    async fn fixed_file_name_last_write_wins() {
        let temp = tempdir().expect("tempdir");
        let mut settings = settings(temp.path());
        settings.file_name = Some("latest.bin".into());
        let app = app(settings);

        for content in [&b"first"[..], &b"second"[..]] {
            let response = app
                .clone()
                .oneshot(upload_request(&[("myFile", Some("ignored.txt"), content)]))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(std::fs::read(temp.path().join("latest.bin")).expect("stored"), b"second");
        assert_eq!(entries(temp.path()), 1);
    }

    #[tokio::test]
    async fn unreachable_notify_endpoint_does_not_fail_upload() {
        let temp = tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let mut settings = settings(temp.path());
        settings.notify_url = Some(format!("http://{addr}/hook"));
        let response = app(settings)
            .oneshot(upload_request(&[("myFile", Some("a.txt"), b"abc")]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(temp.path().join("a.txt").is_file());
    }

    #[tokio::test]
    async fn successful_upload_notifies_endpoint() {
        let temp = tempdir().expect("tempdir");
        let (url, mut rx) = spawn_endpoint().await;
        let mut settings = settings(temp.path());
        settings.notify_url = Some(url);
        settings.notify_method = Some("PUT".into());

        let response = app(settings)
            .oneshot(upload_request(&[("myFile", Some("a.txt"), b"abc")]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let (method, agent) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("notify within timeout")
            .expect("request received");
        assert_eq!(method, Method::PUT);
        assert_eq!(agent, USER_AGENT);

        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err(), "exactly one notification per upload");
    }

    #[tokio::test]
    async fn failed_uploads_do_not_notify() {
        let temp = tempdir().expect("tempdir");
        let (url, mut rx) = spawn_endpoint().await;
        let mut settings = settings(temp.path());
        settings.notify_url = Some(url);
        settings.max_filesize = Some(64);
        let app = app(settings);

        let response = app
            .clone()
            .oneshot(upload_request(&[("myFile", Some("big.txt"), &[b'x'; 256])]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = app
            .oneshot(upload_request(&[("wrongField", Some("a.txt"), b"abc")]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let received = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(received.is_err(), "no notification after failed uploads");
    }

    #[tokio::test]
    async fn response_template_is_served_with_ranges() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("done.txt"), b"upload complete").expect("template");
        let settings = UploadSettings {
            root_dir: Some(temp.path().to_path_buf()),
            dest_dir: Some("files".into()),
            response_template: Some("done.txt".into()),
            ..UploadSettings::default()
        };
        let app = app(settings);

        let response = app
            .clone()
            .oneshot(upload_request(&[("myFile", Some("a.txt"), b"abc")]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&bytes[..], b"upload complete");

        let mut request = upload_request(&[("myFile", Some("b.txt"), b"abc")]);
        request
            .headers_mut()
            .insert(header::RANGE, "bytes=0-5".parse().expect("range"));
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&bytes[..], b"upload");
        assert!(temp.path().join("files/b.txt").is_file());
    }

    #[tokio::test]
    async fn missing_template_is_a_server_error_after_write() {
        let temp = tempdir().expect("tempdir");
        let settings = UploadSettings {
            root_dir: Some(temp.path().to_path_buf()),
            dest_dir: Some("files".into()),
            response_template: Some("missing.html".into()),
            ..UploadSettings::default()
        };
        let response = app(settings)
            .oneshot(upload_request(&[("myFile", Some("a.txt"), b"abc")]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(temp.path().join("files/a.txt").is_file());
    }

    #[tokio::test]
    async fn next_handler_sees_upload_vars() {
        let temp = tempdir().expect("tempdir");
        let mut settings = settings(temp.path());
        settings.create_uuid_dir = Some(true);
        let pipeline = Arc::new(UploadPipeline::new(settings).expect("pipeline"));

        async fn echo_vars(Extension(vars): Extension<UploadVars>) -> String {
            vars.iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("\n")
        }
        let app = Router::new().route(
            "/upload",
            post(echo_vars).layer(middleware::from_fn_with_state(pipeline, upload_middleware)),
        );

        let mut request = upload_request(&[("myFile", Some("a.txt"), b"abc")]);
        request
            .headers_mut()
            .insert("x-request-id", "req-42".parse().expect("request id"));
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let text = String::from_utf8(bytes.to_vec()).expect("utf-8");

        assert!(text.contains("upload.filename=a.txt"));
        assert!(text.contains("upload.filesize=3"));
        assert!(text.contains("upload.bytes_written=3"));
        assert!(text.contains("upload.max_filesize=10485760"));
        assert!(text.contains("upload.request_id=req-42"));
        assert!(text.contains("upload.isolation_dir="));
        assert!(text.contains(&format!("upload.directory={}", temp.path().display())));
    }

    #[test]
    fn upload_vars_include_isolation_dir_only_when_set() {
        let mut result = UploadResult {
            file_name: "a.txt".into(),
            file_size: 3,
            bytes_written: 3,
            directory: "/srv/uploads".into(),
            isolation_dir: None,
            request_id: "req-1".into(),
            content_type: None,
        };
        let vars = UploadVars::from_result(&result, 1024);
        assert_eq!(vars.get(UploadVars::DIRECTORY), Some("/srv/uploads"));
        assert_eq!(vars.get(UploadVars::MAX_FILESIZE), Some("1024"));
        assert_eq!(vars.get(UploadVars::ISOLATION_DIR), None);

        result.isolation_dir = Some("0b6f".into());
        let vars = UploadVars::from_result(&result, 1024);
        assert_eq!(vars.get(UploadVars::ISOLATION_DIR), Some("0b6f"));
        assert_eq!(vars.iter().count(), 7);
    }

    #[tokio::test]
    async fn prepare_creates_static_destination() {
        let temp = tempdir().expect("tempdir");
        let dest = temp.path().join("nested/uploads");
        let pipeline = UploadPipeline::new(UploadSettings {
            dest_dir: Some(dest.display().to_string()),
            spool_dir: Some(temp.path().join("spool")),
            ..UploadSettings::default()
        })
        .expect("pipeline");
        pipeline.prepare().await.expect("prepare");
        assert!(dest.is_dir());
        assert!(temp.path().join("spool").is_dir());
    }
}
