//! 限长的 multipart 解码：文件分段暂存，文本字段受内存上限约束。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, header};
use http_body_util::{LengthLimitError, Limited};
use multer::Multipart;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::path::Path;
use tracing::debug;

use crate::error::UploadError;
use crate::spool::SpooledUpload;

/// Limits applied while decoding one request.
#[derive(Clone, Copy, Debug)]
pub struct FormLimits<'a> {
    pub file_field: &'a str,
    pub max_body: u64,
    pub memory_limit: usize,
    pub spool_dir: &'a Path,
}

#[derive(Debug)]
pub struct FilePart {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: SpooledUpload,
}

#[derive(Debug, Default)]
pub struct UploadForm {
    pub file: Option<FilePart>,
    pub fields: HashMap<String, String>,
}

impl UploadForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// 解码请求体；只保留第一个匹配字段名且带文件名的分段。
pub async fn decode_upload_form(
    headers: &HeaderMap,
    body: AxumBody,
    limits: FormLimits<'_>,
) -> Result<UploadForm, UploadError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| UploadError::FileRetrieval("request is not multipart/form-data".into()))?;
    let boundary = multer::parse_boundary(content_type)
        .map_err(|err| UploadError::FileRetrieval(err.to_string()))?;

    let max_body = usize::try_from(limits.max_body).unwrap_or(usize::MAX);
    let stream = AxumBody::new(Limited::new(body, max_body)).into_data_stream();
    let mut multipart = Multipart::new(stream, boundary);
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| map_multer_error(err, &limits))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);

        match file_name {
            Some(file_name) if form.file.is_none() && name == limits.file_field => {
                let content_type = field.content_type().map(|mime| mime.to_string());
                let mut data =
                    SpooledUpload::new(limits.memory_limit, limits.spool_dir.to_path_buf());
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| map_multer_error(err, &limits))?
                {
                    data.write_chunk(&chunk)
                        .await
                        .map_err(|source| UploadError::Write {
                            path: limits.spool_dir.to_path_buf(),
                            source,
                        })?;
                }
                if data.is_empty() {
                    debug!(file_name = %file_name, "file part is empty");
                }
                debug!(file_name = %file_name, size = data.len(), spilled = data.is_spilled(), "file part decoded");
                form.file = Some(FilePart {
                    file_name,
                    content_type,
                    data,
                });
            }
            Some(_) => {
                // extra file parts are read and discarded
                while field
                    .chunk()
                    .await
                    .map_err(|err| map_multer_error(err, &limits))?
                    .is_some()
                {}
            }
            None => {
                let mut value = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| map_multer_error(err, &limits))?
                {
                    if value.len() + chunk.len() > limits.memory_limit {
                        return Err(UploadError::SizeLimitExceeded {
                            limit: limits.memory_limit as u64,
                        });
                    }
                    value.extend_from_slice(&chunk);
                }
                form.fields
                    .entry(name)
                    .or_insert_with(|| String::from_utf8_lossy(&value).into_owned());
            }
        }
    }

    Ok(form)
}

fn map_multer_error(err: multer::Error, limits: &FormLimits<'_>) -> UploadError {
    let too_large = match &err {
        multer::Error::StreamSizeExceeded { .. } | multer::Error::FieldSizeExceeded { .. } => true,
        multer::Error::StreamReadFailed(source) => caused_by_length_limit(source.as_ref()),
        _ => false,
    };
    if too_large {
        UploadError::SizeLimitExceeded {
            limit: limits.max_body,
        }
    } else {
        UploadError::FileRetrieval(err.to_string())
    }
}

fn caused_by_length_limit(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<LengthLimitError>() {
            return true;
        }
        current = err.source();
    }
    false
}
