//! Whole-file read and write with a caller-chosen decode policy.
//!
//! Writes go through a temporary file in the target directory followed by a
//! rename, so readers never observe a half-written file.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::protocol::{ReadFileRequest, ReadFileResponse, WriteFileRequest};

#[derive(Error, Debug)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed to decode {path} as {encoding}: {detail}")]
    Decode {
        path: String,
        encoding: String,
        detail: String,
    },

    #[error("unsupported encoding: {0:?}")]
    UnsupportedEncoding(String),

    #[error("unsupported error policy: {0:?} (expected strict, replace, or ignore)")]
    UnsupportedErrors(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FileError {
    fn from_io(path: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => FileError::PermissionDenied(path.to_string()),
            _ => FileError::Io {
                path: path.to_string(),
                source,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodePolicy {
    Strict,
    Replace,
    Ignore,
}

fn parse_policy(errors: Option<&str>) -> Result<DecodePolicy, FileError> {
    match errors {
        None | Some("strict") => Ok(DecodePolicy::Strict),
        Some("replace") => Ok(DecodePolicy::Replace),
        Some("ignore") => Ok(DecodePolicy::Ignore),
        Some(other) => Err(FileError::UnsupportedErrors(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Ascii,
}

fn parse_encoding(encoding: Option<&str>) -> Result<Encoding, FileError> {
    match encoding.map(|e| e.to_ascii_lowercase()).as_deref() {
        None | Some("utf-8") | Some("utf8") => Ok(Encoding::Utf8),
        Some("ascii") | Some("us-ascii") => Ok(Encoding::Ascii),
        Some(other) => Err(FileError::UnsupportedEncoding(other.to_string())),
    }
}

fn decode(
    path: &str,
    bytes: Vec<u8>,
    encoding: Encoding,
    policy: DecodePolicy,
) -> Result<String, FileError> {
    let decode_err = |detail: String| FileError::Decode {
        path: path.to_string(),
        encoding: match encoding {
            Encoding::Utf8 => "utf-8".to_string(),
            Encoding::Ascii => "ascii".to_string(),
        },
        detail,
    };

    match encoding {
        Encoding::Utf8 => match policy {
            DecodePolicy::Strict => String::from_utf8(bytes)
                .map_err(|e| decode_err(e.utf8_error().to_string())),
            DecodePolicy::Replace => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            DecodePolicy::Ignore => {
                let mut out = String::with_capacity(bytes.len());
                for chunk in bytes.utf8_chunks() {
                    out.push_str(chunk.valid());
                }
                Ok(out)
            }
        },
        Encoding::Ascii => {
            if bytes.is_ascii() {
                // Safe by construction: all bytes are ASCII.
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            match policy {
                DecodePolicy::Strict => {
                    Err(decode_err("non-ascii byte in stream".to_string()))
                }
                DecodePolicy::Replace => Ok(bytes
                    .iter()
                    .map(|b| if b.is_ascii() { *b as char } else { '\u{FFFD}' })
                    .collect()),
                DecodePolicy::Ignore => Ok(bytes
                    .iter()
                    .filter(|b| b.is_ascii())
                    .map(|b| *b as char)
                    .collect()),
            }
        }
    }
}

/// Read a whole file and decode it according to the request's policy.
pub async fn read_file(request: &ReadFileRequest) -> Result<ReadFileResponse, FileError> {
    let encoding = parse_encoding(request.encoding.as_deref())?;
    let policy = parse_policy(request.errors.as_deref())?;

    let path = Path::new(&request.path);
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| FileError::from_io(&request.path, e))?;
    if metadata.is_dir() {
        return Err(FileError::IsDirectory(request.path.clone()));
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| FileError::from_io(&request.path, e))?;
    let content = decode(&request.path, bytes, encoding, policy)?;
    Ok(ReadFileResponse { content })
}

/// Write `content` to `path` atomically, optionally creating parents.
pub async fn write_file(request: &WriteFileRequest) -> Result<(), FileError> {
    let path = request.path.clone();
    let content = request.content.clone();
    let create_parents = request.create_parents;
    tokio::task::spawn_blocking(move || write_bytes(&path, content.as_bytes(), create_parents))
        .await
        .map_err(|e| FileError::Io {
            path: request.path.clone(),
            source: std::io::Error::other(e),
        })?
}

/// Blocking atomic write: temp file in the target directory, then rename.
pub fn write_bytes(path: &str, bytes: &[u8], create_parents: bool) -> Result<(), FileError> {
    use std::io::Write;

    let target = PathBuf::from(path);
    if target.is_dir() {
        return Err(FileError::IsDirectory(path.to_string()));
    }

    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !parent.exists() {
        if create_parents {
            std::fs::create_dir_all(&parent).map_err(|e| FileError::from_io(path, e))?;
        } else {
            return Err(FileError::NotADirectory(parent.display().to_string()));
        }
    } else if !parent.is_dir() {
        return Err(FileError::NotADirectory(parent.display().to_string()));
    }

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .map_err(|e| FileError::from_io(path, e))?;
    tmp.write_all(bytes).map_err(|e| FileError::from_io(path, e))?;
    tmp.flush().map_err(|e| FileError::from_io(path, e))?;
    tmp.persist(&target)
        .map_err(|e| FileError::from_io(path, e.error))?;
    Ok(())
}
