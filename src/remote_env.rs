//! Environment writer executed on cluster nodes by `stratus apply-env`.
//!
//! The configure step of every setup script runs the uploaded binary with
//! `--KEY=value` arguments. Each pair becomes an `export` line in a block
//! delimited by marker comments at the end of the login profile, so the
//! launcher started later in the script sees the cluster settings. Running
//! the command again replaces the block rather than adding another one.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;
use std::io;
use thiserror::Error;

/// Comment line written above the block of exports.
pub const PROFILE_MARKER: &str = "# Updated by stratus";
/// Comment line closing the block of exports.
pub const PROFILE_END_MARKER: &str = "# End of stratus exports";

/// Errors raised while applying remote environment entries.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RemoteEnvError {
    /// Raised when an argument is not of the form `--KEY=value`.
    #[error("expected --KEY=value, got `{0}`")]
    Malformed(String),
    /// Raised when a key is not a valid shell variable name.
    #[error("`{0}` is not a valid environment variable name")]
    InvalidName(String),
    /// Raised when the profile cannot be read or written.
    #[error("failed to update {path}: {message}")]
    Io {
        /// Profile path being updated.
        path: Utf8PathBuf,
        /// Underlying I/O error text.
        message: String,
    },
}

fn is_shell_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Parses `--KEY=value` arguments in order. Values may contain `=`.
///
/// # Errors
///
/// Returns [`RemoteEnvError::Malformed`] for arguments without the `--`
/// prefix or `=` separator, and [`RemoteEnvError::InvalidName`] when the key
/// is not a shell identifier.
pub fn parse_env_args<I, S>(args: I) -> Result<Vec<(String, String)>, RemoteEnvError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|arg| {
            let raw = arg.as_ref();
            let (key, value) = raw
                .strip_prefix("--")
                .and_then(|pair| pair.split_once('='))
                .ok_or_else(|| RemoteEnvError::Malformed(raw.to_owned()))?;
            if !is_shell_name(key) {
                return Err(RemoteEnvError::InvalidName(key.to_owned()));
            }
            Ok((key.to_owned(), value.to_owned()))
        })
        .collect()
}

/// Renders the markers around one `export` line per entry.
#[must_use]
pub fn render_block(entries: &[(String, String)]) -> String {
    let mut block = format!("\n{PROFILE_MARKER}\n");
    for (key, value) in entries {
        block.push_str("export ");
        block.push_str(key);
        block.push('=');
        block.push_str(&escape(value.as_str().into()));
        block.push('\n');
    }
    block.push_str(PROFILE_END_MARKER);
    block.push('\n');
    block
}

/// Removes every block written by [`render_block`] from `contents`.
///
/// A block missing its end marker runs to the last contiguous `export` line
/// after the opening marker.
#[must_use]
pub fn strip_blocks(contents: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut inside = false;
    for line in contents.lines() {
        if line == PROFILE_MARKER {
            inside = true;
            continue;
        }
        if inside {
            if line == PROFILE_END_MARKER || line.starts_with("export ") {
                inside = line != PROFILE_END_MARKER;
                continue;
            }
            inside = false;
        }
        kept.push(line);
    }
    let body = kept.join("\n");
    let trimmed = body.trim_end_matches('\n');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

/// Writes the rendered entries to the end of `profile`, replacing any block
/// from an earlier run and creating the file when missing.
///
/// # Errors
///
/// Returns [`RemoteEnvError::Io`] when the profile directory cannot be
/// opened or the file cannot be read or written.
pub fn apply_env(profile: &Utf8Path, entries: &[(String, String)]) -> Result<(), RemoteEnvError> {
    let io_error = |err: io::Error| RemoteEnvError::Io {
        path: profile.to_path_buf(),
        message: err.to_string(),
    };
    let parent = profile
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = profile.file_name().ok_or_else(|| RemoteEnvError::Io {
        path: profile.to_path_buf(),
        message: String::from("profile path is missing a filename"),
    })?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(io_error)?;
    let existing = match dir.read_to_string(file_name) {
        Ok(existing) => existing,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(io_error(err)),
    };
    let mut contents = strip_blocks(&existing);
    contents.push_str(&render_block(entries));
    dir.write(file_name, contents).map_err(io_error)
}
