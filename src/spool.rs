//! 上传分段的暂存：内存缓冲超过上限后溢出到匿名临时文件。

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// A multipart file part held in memory until it outgrows `memory_limit`.
///
/// Spilled data lives in an unnamed temp file, so dropping the spool on any
/// exit path releases the disk space.
#[derive(Debug)]
pub struct SpooledUpload {
    memory: Vec<u8>,
    file: Option<File>,
    len: u64,
    memory_limit: usize,
    spool_dir: PathBuf,
}

impl SpooledUpload {
    pub fn new(memory_limit: usize, spool_dir: PathBuf) -> Self {
        Self {
            memory: Vec::new(),
            file: None,
            len: 0,
            memory_limit,
            spool_dir,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        self.file.is_some()
    }

    /// 追加一段数据，必要时把已缓冲内容转存到磁盘。
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
        } else if self.memory.len() + chunk.len() > self.memory_limit {
            let mut file = create_spill_file(self.spool_dir.clone()).await?;
            file.write_all(&self.memory).await?;
            file.write_all(chunk).await?;
            self.memory = Vec::new();
            self.file = Some(file);
        } else {
            self.memory.extend_from_slice(chunk);
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// 将全部暂存内容复制到 `dest`，返回写入的字节数。
    pub async fn copy_into<W>(self, dest: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let written = match self.file {
            Some(mut file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                tokio::io::copy(&mut file, dest).await?
            }
            None => {
                dest.write_all(&self.memory).await?;
                self.memory.len() as u64
            }
        };
        dest.flush().await?;
        Ok(written)
    }
}

async fn create_spill_file(dir: PathBuf) -> io::Result<File> {
    let file = tokio::task::spawn_blocking(move || tempfile::tempfile_in(dir))
        .await
        .map_err(|err| io::Error::other(err.to_string()))??;
    Ok(File::from_std(file))
}
