//! 目标路径解析：根目录约束、文件名清理与隔离子目录分配。

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::ErrorKind;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path {0:?} escapes the root directory")]
    Escape(String),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Joins caller-supplied relative paths under a fixed root.
#[derive(Clone, Debug)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// 词法拼接：拒绝 `..`、绝对前缀等任何可能逃逸根目录的组件。
    pub fn sanitize_join(&self, relative: &str) -> Result<PathBuf, PathError> {
        let unified = relative.replace('\\', "/");
        let trimmed = unified.trim().trim_start_matches('/');
        let mut normalized = PathBuf::new();

        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(PathError::Escape(relative.to_string()));
                }
            }
        }

        if normalized.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }
        Ok(self.root.join(normalized))
    }

    /// 拼接后逐级检查已存在的组件，拒绝符号链接与非目录的中间节点。
    pub async fn resolve_checked(&self, relative: &str) -> Result<PathBuf, PathError> {
        let target = self.sanitize_join(relative)?;
        let below_root = target
            .strip_prefix(&self.root)
            .map_err(|_| PathError::Escape(relative.to_string()))?;
        let mut current = self.root.clone();

        for component in below_root.components() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() || !metadata.is_dir() {
                        return Err(PathError::Escape(relative.to_string()));
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(target),
                Err(err) => return Err(PathError::Io(err)),
            }
        }

        Ok(target)
    }

    /// 在 `parent` 下原子地创建一个随机命名的子目录，名称冲突时换名重试。
    pub async fn fresh_subdirectory(&self, parent: &Path) -> Result<(String, PathBuf), PathError> {
        fs::create_dir_all(parent).await?;
        loop {
            let name = Uuid::new_v4().to_string();
            let candidate = parent.join(&name);
            match fs::create_dir(&candidate).await {
                Ok(()) => return Ok((name, candidate)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(PathError::Io(err)),
            }
        }
    }
}

/// 将客户端提供的文件名裁剪为最后一个路径组件。
pub fn sanitize_file_name(name: &str) -> Result<String, PathError> {
    let unified = name.replace('\\', "/");
    let base = unified.rsplit('/').next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(PathError::InvalidName(name.to_string()));
    }
    Ok(base.to_string())
}
