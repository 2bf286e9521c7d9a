//! Appending file sink with size-based rotation.
//!
//! When the base file grows past `maxBytes`, rotated files shift outward
//! (`name.1` → `name.2`, …), the just-filled base becomes `name.1`, and a
//! fresh base file starts. At most `backupFiles` rotated files are kept.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::output::{Sink, SinkError};
use crate::pipeline::OutQueueItem;

#[derive(Default)]
pub struct FileSink {
    size: u64,
    initialized: bool,
}

fn numbered(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

impl FileSink {
    async fn rotate(&mut self, base: &Path, backup_files: u32) -> Result<(), SinkError> {
        debug!(file = %base.display(), "rotating output file");
        let last = numbered(base, backup_files);
        if fs::metadata(&last).await.is_ok() {
            fs::remove_file(&last).await?;
        }
        for n in (1..backup_files).rev() {
            let from = numbered(base, n);
            if fs::metadata(&from).await.is_ok() {
                fs::rename(&from, numbered(base, n + 1)).await?;
            }
        }
        if backup_files > 0 {
            fs::rename(base, numbered(base, 1)).await?;
        } else {
            fs::remove_file(base).await?;
        }
        self.size = 0;
        Ok(())
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn send(&mut self, item: &OutQueueItem, payload: Bytes) -> Result<u64, SinkError> {
        let cfg = &item.sample.output;
        if !self.initialized {
            self.size = fs::metadata(&cfg.file_name).await.map(|m| m.len()).unwrap_or(0);
            self.initialized = true;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.file_name)
            .await?;
        file.write_all(&payload).await?;
        file.flush().await?;
        self.size += payload.len() as u64;

        if self.size > cfg.max_bytes {
            self.rotate(&cfg.file_name, cfg.backup_files).await?;
        }
        Ok(payload.len() as u64)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
