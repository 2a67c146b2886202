//! 文件持久化（FilePersistor）
//!
//! 每条流对应目录下的一个 JSON Lines 文件（`<stream_id>.jsonl`），一行一条快照。
//! 读取时按行惰性解析；裁剪时先写临时文件再原子替换。
//! 不同流 ID 可能映射到同一文件名，读取与裁剪只作用于 `xc_id` 完全相同的记录。
//!
use crate::error::{RuntimeError, RuntimeResult};
use crate::store::{EventPersistor, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, stream};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_stream::wrappers::LinesStream;

pub struct FilePersistor {
    dir: PathBuf,
    /// 单写者：追加与裁剪互斥
    write_lock: Mutex<()>,
}

impl FilePersistor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stream_path(&self, stream_id: &str) -> PathBuf {
        let safe: String = stream_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}

fn parse_line(line: &str) -> RuntimeResult<Snapshot> {
    serde_json::from_str(line)
        .map_err(|err| RuntimeError::persistence(format!("parse snapshot record: {err}")))
}

#[async_trait]
impl EventPersistor for FilePersistor {
    async fn append(&self, snapshot: &Snapshot) -> RuntimeResult<()> {
        let mut line = serde_json::to_string(snapshot)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.stream_path(snapshot.xc_id()))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load(&self, stream_id: &str) -> BoxStream<'static, RuntimeResult<Snapshot>> {
        let path = self.stream_path(stream_id);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return stream::empty().boxed();
            }
            Err(err) => {
                return stream::once(async move { Err::<Snapshot, RuntimeError>(err.into()) })
                    .boxed();
            }
        };

        let stream_id = stream_id.to_string();
        LinesStream::new(BufReader::new(file).lines())
            .filter_map(move |line| {
                let record = match line {
                    Ok(line) if line.trim().is_empty() => None,
                    Ok(line) => match parse_line(&line) {
                        Ok(snapshot) if snapshot.xc_id() != stream_id => None,
                        parsed => Some(parsed),
                    },
                    Err(err) => Some(Err(err.into())),
                };
                async move { record }
            })
            .boxed()
    }

    async fn prune(&self, stream_id: &str, before: DateTime<Utc>) -> RuntimeResult<usize> {
        let path = self.stream_path(stream_id);
        let _guard = self.write_lock.lock().await;

        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        let mut kept = String::with_capacity(raw.len());
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let snapshot = parse_line(line)?;
            if snapshot.xc_id() == stream_id && snapshot.ts() < before {
                removed += snapshot.events().len();
            } else {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, kept.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;
        Ok(removed)
    }
}
