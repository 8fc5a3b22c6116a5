//! Durable checkpoint storage + HTTP fetch utilities for ELH.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use elh_core::CheckpointFile;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "elh-storage";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("serializing checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CheckpointError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// A new file was written.
    Written,
    /// The serialized snapshot matched the last write byte for byte.
    Unchanged,
    /// A write that started after this call already covered its changes.
    Coalesced,
}

#[derive(Debug, Default)]
struct WriterState {
    persisted_generation: u64,
    last_hash: Option<String>,
}

/// Owns the in-memory checkpoint and its file on disk.
///
/// Mutations go through [`CheckpointStore::update`], which bumps a generation counter under
/// the state lock. [`CheckpointStore::persist`] serializes physical writes behind a second
/// lock; a caller whose generation was already written by someone else returns without
/// touching the disk.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<CheckpointFile>,
    generation: AtomicU64,
    writer: Mutex<WriterState>,
}

impl CheckpointStore {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = Self::load(&path).await;
        Self::with_state(path, state)
    }

    pub fn with_state(path: impl Into<PathBuf>, state: CheckpointFile) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(state),
            generation: AtomicU64::new(0),
            writer: Mutex::new(WriterState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a checkpoint. Missing, unreadable and malformed files all yield an empty
    /// checkpoint; a malformed one is first moved aside to `<path>.corrupt`.
    pub async fn load(path: &Path) -> CheckpointFile {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no checkpoint found, starting fresh");
                return CheckpointFile::default();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "checkpoint unreadable, starting fresh");
                return CheckpointFile::default();
            }
        };

        match serde_json::from_slice::<CheckpointFile>(&bytes) {
            Ok(file) => {
                info!(
                    path = %path.display(),
                    collections = file.collections.len(),
                    deferred = file.deferred.len(),
                    "loaded checkpoint"
                );
                file
            }
            Err(err) => {
                let quarantine = corrupt_path(path);
                warn!(
                    path = %path.display(),
                    error = %err,
                    quarantine = %quarantine.display(),
                    "checkpoint malformed, starting fresh"
                );
                if let Err(err) = fs::rename(path, &quarantine).await {
                    warn!(error = %err, "could not move malformed checkpoint aside");
                }
                CheckpointFile::default()
            }
        }
    }

    pub async fn snapshot(&self) -> CheckpointFile {
        self.state.lock().await.clone()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&CheckpointFile) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut CheckpointFile) -> R) -> R {
        let mut state = self.state.lock().await;
        let out = f(&mut state);
        self.generation.fetch_add(1, Ordering::SeqCst);
        out
    }

    /// Writes the current in-memory checkpoint. Every change made through `update` before
    /// this call is on disk when it returns `Ok`.
    pub async fn persist(&self) -> Result<PersistOutcome, CheckpointError> {
        let wanted = self.generation.load(Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        if writer.persisted_generation >= wanted {
            return Ok(PersistOutcome::Coalesced);
        }

        let (bytes, generation) = {
            let state = self.state.lock().await;
            let bytes = serde_json::to_vec_pretty(&*state)?;
            (bytes, self.generation.load(Ordering::SeqCst))
        };

        let hash = sha256_hex(&bytes);
        if writer.last_hash.as_deref() == Some(hash.as_str()) {
            writer.persisted_generation = generation;
            return Ok(PersistOutcome::Unchanged);
        }

        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), generation, "checkpoint written");
        writer.persisted_generation = generation;
        writer.last_hash = Some(hash);
        Ok(PersistOutcome::Written)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".corrupt");
    PathBuf::from(name)
}

/// Writes to a temp file next to `path` and renames it over the target, so readers see
/// either the old file or the new one.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| CheckpointError::io(format!("creating {}", parent.display()), e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result: Result<(), CheckpointError> = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| CheckpointError::io(format!("opening {}", temp_path.display()), e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| CheckpointError::io(format!("writing {}", temp_path.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| CheckpointError::io(format!("syncing {}", temp_path.display()), e))?;
        drop(file);
        fs::rename(&temp_path, path).await.map_err(|e| {
            CheckpointError::io(
                format!("renaming {} -> {}", temp_path.display(), path.display()),
                e,
            )
        })
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            max_in_flight: 30,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        })
    }

    /// GETs `url` and returns the body as text. Non-2xx statuses are errors.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.text().await?;
            Ok::<_, FetchError>(FetchedPage {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}
