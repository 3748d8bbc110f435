use std::fmt;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid remote path {0:?}: expected format device:path")]
    MissingSeparator(String),

    #[error("invalid remote path {0:?}: device ID cannot be empty")]
    EmptyDevice(String),

    #[error("invalid remote path {0:?}: path cannot be empty")]
    EmptyPath(String),

    #[error("invalid remote path {0:?}: path must be absolute (start with /)")]
    NotAbsolute(String),
}

/// A `device:/absolute/path` reference. A trailing `/` marks a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath {
    pub device_id: String,
    pub path: String,
}

impl RemotePath {
    pub fn is_directory(&self) -> bool {
        is_directory(&self.path)
    }
}

impl FromStr for RemotePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device_id, path) = s
            .split_once(':')
            .ok_or_else(|| PathError::MissingSeparator(s.to_string()))?;

        if device_id.is_empty() {
            return Err(PathError::EmptyDevice(s.to_string()));
        }
        if path.is_empty() {
            return Err(PathError::EmptyPath(s.to_string()));
        }
        if !path.starts_with('/') {
            return Err(PathError::NotAbsolute(s.to_string()));
        }

        Ok(Self {
            device_id: device_id.to_string(),
            path: path.to_string(),
        })
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.path)
    }
}

pub fn is_directory(path: &str) -> bool {
    path.ends_with('/')
}

/// Last component of a local or remote path, ignoring trailing `/`.
///
/// The root has no name and maps to `.`, so it never joins as an absolute path.
pub fn base_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match Path::new(trimmed).file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None if trimmed.is_empty() => ".".to_string(),
        None => trimmed.to_string(),
    }
}

pub fn join_remote_path(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Where a downloaded file lands: `./<name>` when no destination is given,
/// `<dest>/<name>` when the destination is a directory, `dest` otherwise.
pub fn resolve_local_destination(remote_path: &str, local_dest: &str) -> PathBuf {
    let name = base_name(remote_path);

    if local_dest.is_empty() {
        return Path::new(".").join(name);
    }
    if is_directory(local_dest) || local_dest.ends_with(MAIN_SEPARATOR) {
        return Path::new(local_dest).join(name);
    }
    PathBuf::from(local_dest)
}

/// Where an uploaded file lands: directory destinations get the local name appended
pub fn resolve_remote_destination(local_path: &Path, remote_path: &str) -> String {
    if is_directory(remote_path) {
        join_remote_path(remote_path, &base_name(&local_path.to_string_lossy()))
    } else {
        remote_path.to_string()
    }
}
