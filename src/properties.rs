//! Application properties file parsing.
//!
//! The properties file uses the familiar `key=value` line format. Lines
//! starting with `#` or `!` are comments, `:` is accepted as a separator, and
//! surrounding whitespace is trimmed. Entries are kept in key order so that
//! rendered scripts are deterministic.

use std::collections::BTreeMap;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

use crate::config::ConfigError;
use crate::remote::expand_tilde;

/// Ordered application configuration entries.
pub type Properties = BTreeMap<String, String>;

/// Parses properties text into an ordered map. Later duplicates win.
#[must_use]
pub fn parse_properties(text: &str) -> Properties {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let (raw_key, value) = line.split_once(['=', ':'])?;
            let key = raw_key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_owned(), value.trim().to_owned()))
        })
        .collect()
}

/// Reads and parses the properties file at `path`, expanding a leading `~/`.
///
/// # Errors
///
/// Returns [`ConfigError::PropertiesRead`] when the file cannot be read.
pub fn load_properties(path: &str) -> Result<Properties, ConfigError> {
    let expanded = expand_tilde(path);
    let text = read_to_string_ambient(&expanded).map_err(|message| {
        ConfigError::PropertiesRead {
            path: expanded.clone(),
            message,
        }
    })?;
    Ok(parse_properties(&text))
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}
