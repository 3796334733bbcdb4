//! ETag 计算与条件 GET 校验。

use axum::http::{HeaderMap, Method, header};
use httpdate::parse_http_date;
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

/// 根据文件元数据生成弱 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    let modified = metadata.modified().ok();
    if let Some(modified) = modified
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{}\"", size)
}

/// GET/HEAD 请求命中缓存时返回 true（If-None-Match 优先于 If-Modified-Since）。
pub fn is_not_modified(
    method: &Method,
    headers: &HeaderMap,
    etag: &str,
    modified: Option<SystemTime>,
) -> bool {
    if *method != Method::GET && *method != Method::HEAD {
        return false;
    }

    if let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        return value.trim() == "*" || etag_matches(value, etag);
    }

    let Some(modified) = modified else {
        return false;
    };
    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_http_date(v).ok())
        .is_some_and(|since| unix_secs(modified) <= unix_secs(since))
}

/// 校验 If-Range：缺省视为匹配，日期或 ETag 不一致时忽略 Range。
pub fn if_range_matches(headers: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    let Some(value) = headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    else {
        return true;
    };
    let value = value.trim();
    // weak validators never satisfy If-Range
    if value.starts_with("W/") {
        return false;
    }
    if value.starts_with('"') {
        return value == etag;
    }
    match (parse_http_date(value), modified) {
        (Ok(date), Some(ts)) => unix_secs(ts) == unix_secs(date),
        _ => false,
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn etag_matches(header_value: &str, current: &str) -> bool {
    let current = current.trim_start_matches("W/");
    header_value
        .split(',')
        .map(|item| item.trim().trim_start_matches("W/"))
        .any(|item| item == current)
}
