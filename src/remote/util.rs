//! Path helpers shared by the SSH executor and file loaders.

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is not set the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use stratus::remote::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
