//! 上传成功后的响应模板：按静态文件语义返回（Last-Modified、条件请求、Range）。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::UploadError;
use crate::etag::{etag_from_metadata, if_range_matches, is_not_modified};

#[derive(Debug, PartialEq, Eq)]
enum RangeRequest {
    Full,
    Partial(u64, u64),
    Unsatisfiable,
}

/// 打开模板文件并按请求头返回 200/206/304/416 响应。
pub async fn serve_template(
    path: &Path,
    method: &Method,
    request_headers: &HeaderMap,
) -> Result<Response, UploadError> {
    let file = File::open(path)
        .await
        .map_err(|err| UploadError::Template(format!("open {}: {err}", path.display())))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| UploadError::Template(format!("stat {}: {err}", path.display())))?;
    if metadata.is_dir() {
        return Err(UploadError::Template(format!(
            "{} is a directory",
            path.display()
        )));
    }

    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }

    if is_not_modified(method, request_headers, &etag, modified) {
        response_headers.remove(header::CONTENT_TYPE);
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let range = if if_range_matches(request_headers, &etag, modified) {
        parse_range(request_headers.get(header::RANGE), file_size)
    } else {
        RangeRequest::Full
    };
    let send_body = *method != Method::HEAD;

    match range {
        RangeRequest::Unsatisfiable => {
            response_headers.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes */{file_size}"))?,
            );
            Ok((StatusCode::RANGE_NOT_SATISFIABLE, response_headers).into_response())
        }
        RangeRequest::Partial(start, end) => {
            let length = end - start + 1;
            debug!(path = %path.display(), start, end, length, "template range request");
            response_headers.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {start}-{end}/{file_size}"))?,
            );
            response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
            let body = if send_body {
                let mut file = file;
                file.seek(SeekFrom::Start(start))
                    .await
                    .map_err(|err| UploadError::Template(err.to_string()))?;
                AxumBody::from_stream(ReaderStream::new(file.take(length)))
            } else {
                AxumBody::empty()
            };
            Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response())
        }
        RangeRequest::Full => {
            response_headers.insert(
                header::CONTENT_LENGTH,
                header_value(&file_size.to_string())?,
            );
            let body = if send_body {
                AxumBody::from_stream(ReaderStream::new(file))
            } else {
                AxumBody::empty()
            };
            Ok((StatusCode::OK, response_headers, body).into_response())
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, UploadError> {
    HeaderValue::from_str(value)
        .map_err(|_| UploadError::Template(format!("invalid header value {value:?}")))
}

/// 解析单个 `bytes=` 区间；多区间与无法识别的单位按整文件返回。
fn parse_range(value: Option<&HeaderValue>, file_size: u64) -> RangeRequest {
    let Some(value) = value.and_then(|value| value.to_str().ok()) else {
        return RangeRequest::Full;
    };
    let Some(range) = value.trim().strip_prefix("bytes=") else {
        return RangeRequest::Full;
    };
    if range.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start_part, end_part)) = range.split_once('-') else {
        return RangeRequest::Unsatisfiable;
    };
    let (start_part, end_part) = (start_part.trim(), end_part.trim());

    if start_part.is_empty() {
        let Ok(suffix) = end_part.parse::<u64>() else {
            return RangeRequest::Unsatisfiable;
        };
        if suffix == 0 || file_size == 0 {
            return RangeRequest::Unsatisfiable;
        }
        return RangeRequest::Partial(file_size.saturating_sub(suffix), file_size - 1);
    }

    let Ok(start) = start_part.parse::<u64>() else {
        return RangeRequest::Unsatisfiable;
    };
    if start >= file_size {
        return RangeRequest::Unsatisfiable;
    }
    let end = if end_part.is_empty() {
        file_size - 1
    } else {
        match end_part.parse::<u64>() {
            Ok(end) if end >= start => end.min(file_size - 1),
            _ => return RangeRequest::Unsatisfiable,
        }
    };
    RangeRequest::Partial(start, end)
}
