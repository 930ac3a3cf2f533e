//! Loading of credential files and the MOTD.

use std::path::{Path, PathBuf};

use parlor::key::{KeyError, PublicKey, parse_authorized_keys};

/// Errors that can occur while loading server files.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A key line could not be parsed.
    #[error("{path}: {source}")]
    Key {
        /// File containing the bad line.
        path: PathBuf,
        /// Parse failure.
        source: KeyError,
    },
}

fn read(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads an authorized-keys style file.
///
/// # Errors
///
/// Returns [`LoadError`] if the file is unreadable or holds a bad key line.
pub fn load_keys(path: &Path) -> Result<Vec<PublicKey>, LoadError> {
    let text = read(path)?;
    parse_authorized_keys(&text).map_err(|source| LoadError::Key {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads the message of the day, normalising line endings and dropping
/// trailing blank lines.
///
/// # Errors
///
/// Returns [`LoadError::Read`] if the file is unreadable.
pub fn load_motd(path: &Path) -> Result<String, LoadError> {
    let text = read(path)?;
    Ok(text.trim_end().lines().collect::<Vec<_>>().join("\n"))
}
