//! `host:port` service addresses.

use std::fmt;

/// A dependent service endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ServiceAddress {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServiceAddress {
    /// Creates an address from its parts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, splitting on the last colon.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (host, port) = value.trim().rsplit_once(':')?;
        let trimmed_host = host.trim();
        if trimmed_host.is_empty() {
            return None;
        }
        let parsed_port = port.trim().parse::<u16>().ok()?;
        Some(Self::new(trimmed_host, parsed_port))
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses a comma-delimited `host:port` list, skipping blank entries.
///
/// # Errors
///
/// Returns the first entry that fails to parse, or an empty string when the
/// list contains no entries at all.
pub fn parse_address_list(value: &str) -> Result<Vec<ServiceAddress>, String> {
    let addresses = value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| ServiceAddress::parse(entry).ok_or_else(|| entry.to_owned()))
        .collect::<Result<Vec<_>, _>>()?;
    if addresses.is_empty() {
        return Err(String::new());
    }
    Ok(addresses)
}
