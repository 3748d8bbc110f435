//! Moves files and directory trees between the local machine and a device.
//!
//! Transfers run one file at a time. Every remote call and every chunk of the
//! copy loop is raced against a [`CancellationToken`], so a timeout or Ctrl-C
//! stops the work at the next chunk boundary.

pub mod path;
pub mod progress;
pub mod throttle;

use futures_util::future::BoxFuture;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ApiError, RemoteFiles};
use path::{base_name, is_directory, join_remote_path, resolve_local_destination, resolve_remote_destination};
use progress::{format_bytes, Progress};
use throttle::{limit_reader, limit_writer};

/// Bytes moved per iteration of the copy loop
const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer cancelled after {transferred} bytes")]
    Cancelled { transferred: u64 },

    #[error("{path} is a directory, use -r flag for recursive {direction}")]
    IsDirectory { path: String, direction: &'static str },

    #[error("file {} already exists, use --force to overwrite", .0.display())]
    DestinationExists(PathBuf),

    #[error("multiple source files require a directory destination (ending with /)")]
    MultipleToNonDirectory,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Remote {
        context: &'static str,
        #[source]
        source: ApiError,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl TransferError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        TransferError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub recursive: bool,
    /// Bytes per second, 0 for unlimited
    pub limit: u64,
    pub quiet: bool,
    /// Overwrite existing local files and keep going past failed entries
    pub force: bool,
    /// Describe what would be transferred without touching anything
    pub dry_run: bool,
    pub show_progress: bool,
}

impl TransferOptions {
    fn progress_enabled(&self) -> bool {
        self.show_progress && !self.quiet
    }
}

#[derive(Debug, Default)]
pub struct TransferResult {
    pub files_transferred: usize,
    pub bytes_transferred: u64,
    /// Failures skipped over because `force` was set
    pub errors: Vec<TransferError>,
}

/// Copy `reader` into `writer` until EOF, checking `cancel` before every read.
///
/// Writes race the token too, so a throttled writer stops mid-chunk. On
/// cancellation the bytes already written stay written and the count is
/// carried in [`TransferError::Cancelled`].
pub async fn copy_cancellable<R, W>(
    cancel: &CancellationToken,
    mut reader: R,
    mut writer: W,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    let mut cancelled = false;

    loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let n = tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            n = reader.read(&mut buf) => n.map_err(|e| TransferError::io("read failed", e))?,
        };
        if n == 0 {
            break;
        }

        let mut chunk = &buf[..n];
        while !chunk.is_empty() {
            let wrote = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                n = writer.write(chunk) => n.map_err(|e| TransferError::io("write failed", e))?,
            };
            if wrote == 0 {
                return Err(TransferError::io(
                    "write failed",
                    io::ErrorKind::WriteZero.into(),
                ));
            }
            written += wrote as u64;
            chunk = &chunk[wrote..];
        }
        if cancelled {
            break;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| TransferError::io("flush failed", e))?;

    if cancelled {
        return Err(TransferError::Cancelled {
            transferred: written,
        });
    }
    Ok(written)
}

/// Download a file, or with `recursive` a directory tree, from a device
pub async fn download(
    remote: &dyn RemoteFiles,
    cancel: &CancellationToken,
    device_id: &str,
    remote_path: &str,
    local_dest: &str,
    options: &TransferOptions,
) -> Result<TransferResult, TransferError> {
    let mut transfer = Transfer::new(remote, cancel, device_id, options);
    transfer.check_online().await?;

    let info = transfer
        .call("failed to stat remote path", remote.stat(device_id, remote_path))
        .await?;
    let local = resolve_local_destination(remote_path, local_dest);

    if info.is_directory {
        if !options.recursive {
            return Err(TransferError::IsDirectory {
                path: remote_path.to_string(),
                direction: "download",
            });
        }
        transfer
            .download_directory(remote_path.to_string(), local)
            .await?;
    } else {
        transfer.download_file(remote_path, &local, info.size).await?;
    }

    Ok(transfer.result)
}

/// Upload local files and directories to `remote_path` on a device.
///
/// Local paths are checked before anything goes over the network.
pub async fn upload(
    remote: &dyn RemoteFiles,
    cancel: &CancellationToken,
    local_paths: &[PathBuf],
    device_id: &str,
    remote_path: &str,
    options: &TransferOptions,
) -> Result<TransferResult, TransferError> {
    if local_paths.len() > 1 && !is_directory(remote_path) {
        return Err(TransferError::MultipleToNonDirectory);
    }

    let mut sources = Vec::with_capacity(local_paths.len());
    for local in local_paths {
        let meta = fs::metadata(local).await.map_err(|e| {
            TransferError::io(format!("failed to stat local path {}", local.display()), e)
        })?;
        if meta.is_dir() && !options.recursive {
            return Err(TransferError::IsDirectory {
                path: local.display().to_string(),
                direction: "upload",
            });
        }
        sources.push((local, meta));
    }

    let mut transfer = Transfer::new(remote, cancel, device_id, options);
    transfer.check_online().await?;

    for (local, meta) in sources {
        let outcome = if meta.is_dir() {
            transfer
                .upload_directory(local.clone(), remote_path.to_string())
                .await
        } else {
            let dest = resolve_remote_destination(local, remote_path);
            transfer.upload_file(local, &dest, meta.len()).await
        };
        // Force only covers entries inside a directory
        outcome?;
    }

    Ok(transfer.result)
}

/// State for one download or upload call
struct Transfer<'a> {
    remote: &'a dyn RemoteFiles,
    cancel: &'a CancellationToken,
    device_id: &'a str,
    options: &'a TransferOptions,
    result: TransferResult,
}

impl<'a> Transfer<'a> {
    fn new(
        remote: &'a dyn RemoteFiles,
        cancel: &'a CancellationToken,
        device_id: &'a str,
        options: &'a TransferOptions,
    ) -> Self {
        Self {
            remote,
            cancel,
            device_id,
            options,
            result: TransferResult::default(),
        }
    }

    async fn check_online(&self) -> Result<(), TransferError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled { transferred: 0 }),
            result = self.remote.check_device_online(self.device_id) => Ok(result?),
        }
    }

    /// Run a remote call unless cancelled first
    async fn call<T>(
        &self,
        context: &'static str,
        request: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, TransferError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled { transferred: 0 }),
            result = request => result.map_err(|source| TransferError::Remote { context, source }),
        }
    }

    /// With `force`, record a failed entry and carry on. Cancellation always stops.
    fn settle(&mut self, outcome: Result<(), TransferError>) -> Result<(), TransferError> {
        match outcome {
            Err(e) if self.options.force && !matches!(e, TransferError::Cancelled { .. }) => {
                warn!(error = %e, "skipping failed entry");
                self.result.errors.push(e);
                Ok(())
            }
            other => other,
        }
    }

    fn say(&self, line: String) {
        if !self.options.quiet {
            println!("{line}");
        }
    }

    async fn download_file(
        &mut self,
        remote_path: &str,
        local: &Path,
        size: u64,
    ) -> Result<(), TransferError> {
        if self.options.dry_run {
            self.say(format!(
                "Would download: {remote_path} -> {} ({})",
                local.display(),
                format_bytes(size)
            ));
            self.result.files_transferred += 1;
            return Ok(());
        }

        if !self.options.force {
            let exists = fs::try_exists(local).await.map_err(|e| {
                TransferError::io(format!("failed to check {}", local.display()), e)
            })?;
            if exists {
                return Err(TransferError::DestinationExists(local.to_path_buf()));
            }
        }

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                TransferError::io(format!("failed to create directory {}", parent.display()), e)
            })?;
        }

        let download = self
            .call(
                "failed to download file",
                self.remote.download(self.device_id, remote_path),
            )
            .await?;
        let size = download.content_length.filter(|&n| n > 0).unwrap_or(size);

        let file = fs::File::create(local).await.map_err(|e| {
            TransferError::io(format!("failed to create file {}", local.display()), e)
        })?;
        let writer = limit_writer(file, self.options.limit);
        let name = base_name(remote_path);

        let written = if self.options.progress_enabled() {
            let progress = Progress::new(name.clone(), size, self.options.quiet);
            let copied =
                copy_cancellable(self.cancel, download.body, progress.wrap_writer(writer)).await;
            progress.finish();
            copied?
        } else {
            copy_cancellable(self.cancel, download.body, writer).await?
        };

        self.result.files_transferred += 1;
        self.result.bytes_transferred += written;
        debug!(device = self.device_id, remote_path, local = %local.display(), bytes = written, "downloaded");

        if !self.options.quiet && !self.options.show_progress {
            println!("  {name}  {}", format_bytes(written));
        }
        Ok(())
    }

    fn download_directory(
        &mut self,
        remote_path: String,
        local: PathBuf,
    ) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            let entries = self
                .call(
                    "failed to list directory",
                    self.remote.list(self.device_id, &remote_path),
                )
                .await?;

            if self.options.dry_run {
                self.say(format!("Would create directory: {}", local.display()));
            } else {
                fs::create_dir_all(&local).await.map_err(|e| {
                    TransferError::io(format!("failed to create directory {}", local.display()), e)
                })?;
            }

            for entry in entries {
                let child_remote = join_remote_path(&remote_path, &entry.name);
                let child_local = local.join(&entry.name);

                let outcome = if entry.is_directory {
                    self.download_directory(child_remote, child_local).await
                } else {
                    self.download_file(&child_remote, &child_local, entry.size)
                        .await
                };
                self.settle(outcome)?;
            }
            Ok(())
        })
    }

    async fn upload_file(
        &mut self,
        local: &Path,
        remote_path: &str,
        size: u64,
    ) -> Result<(), TransferError> {
        if self.options.dry_run {
            self.say(format!(
                "Would upload: {} -> {}:{remote_path} ({})",
                local.display(),
                self.device_id,
                format_bytes(size)
            ));
            self.result.files_transferred += 1;
            return Ok(());
        }

        let file = fs::File::open(local).await.map_err(|e| {
            TransferError::io(format!("failed to open file {}", local.display()), e)
        })?;
        let reader = limit_reader(file, self.options.limit);
        let name = base_name(&local.to_string_lossy());

        // The upload endpoint takes one multipart body, so the file is read fully first
        let mut content = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        if self.options.progress_enabled() {
            let progress = Progress::new(name.clone(), size, self.options.quiet);
            let copied =
                copy_cancellable(self.cancel, progress.wrap_reader(reader), &mut content).await;
            progress.finish();
            copied?;
        } else {
            copy_cancellable(self.cancel, reader, &mut content).await?;
        }

        let sent = content.len() as u64;
        self.call(
            "failed to upload file",
            self.remote.upload(self.device_id, remote_path, content),
        )
        .await?;

        self.result.files_transferred += 1;
        self.result.bytes_transferred += sent;
        debug!(device = self.device_id, remote_path, local = %local.display(), bytes = sent, "uploaded");

        if !self.options.quiet && !self.options.show_progress {
            println!("  {name}  {}  -> {remote_path}", format_bytes(sent));
        }
        Ok(())
    }

    fn upload_directory(
        &mut self,
        local: PathBuf,
        remote_path: String,
    ) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            let dest = if is_directory(&remote_path) {
                join_remote_path(&remote_path, &base_name(&local.to_string_lossy()))
            } else {
                remote_path
            };

            if self.options.dry_run {
                self.say(format!("Would create directory: {}:{dest}", self.device_id));
            } else {
                match self
                    .call(
                        "failed to create directory",
                        self.remote.mkdir(self.device_id, &dest),
                    )
                    .await
                {
                    Err(TransferError::Remote { source, .. }) if source.is_already_exists() => {
                        debug!(path = %dest, "remote directory already exists");
                    }
                    other => other?,
                }
            }

            let read_error = |e: io::Error| {
                TransferError::io(format!("failed to read directory {}", local.display()), e)
            };
            let mut dir = fs::read_dir(&local).await.map_err(read_error)?;
            let mut children = Vec::new();
            while let Some(entry) = dir.next_entry().await.map_err(read_error)? {
                children.push(entry);
            }
            children.sort_by_key(|entry| entry.file_name());

            for entry in children {
                let name = entry.file_name().to_string_lossy().into_owned();
                let child_local = entry.path();
                let child_remote = join_remote_path(&dest, &name);

                let outcome = match entry.metadata().await {
                    Ok(meta) if meta.is_dir() => {
                        self.upload_directory(child_local, child_remote).await
                    }
                    Ok(meta) => {
                        self.upload_file(&child_local, &child_remote, meta.len())
                            .await
                    }
                    Err(e) => Err(TransferError::io(
                        format!("failed to stat {}", child_local.display()),
                        e,
                    )),
                };
                self.settle(outcome)?;
            }
            Ok(())
        })
    }
}
