//! Argument validation performed before any conductor is contacted.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{MgmtError, Result};

/// Maximum length of tenant, admin, volume and store names.
pub const MAX_NAME_LEN: usize = 96;
/// Maximum length of a credential.
pub const MAX_PASSWORD_LEN: usize = 512;
/// Maximum number of replicas of a volume.
pub const MAX_REPLICAS: usize = 3;
/// Highest fan speed rate (percentage times 100).
pub const MAX_FAN_RATE: u32 = 10_000;

/// Checks a name: 1 to 96 letters, digits or underscores.
pub fn name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(MgmtError::InvalidArgument(format!("{what} name is empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(MgmtError::InvalidArgument(format!(
            "{what} name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(MgmtError::InvalidArgument(format!(
            "{what} name {value:?} contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// Checks a credential: 1 to 512 bytes.
pub fn password(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(MgmtError::InvalidArgument(format!("{what} password is empty")));
    }
    if value.len() > MAX_PASSWORD_LEN {
        return Err(MgmtError::InvalidArgument(format!(
            "{what} password exceeds {MAX_PASSWORD_LEN} bytes"
        )));
    }
    Ok(())
}

/// Parses a dotted IPv4 address.
pub fn ipv4(what: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse::<Ipv4Addr>()
        .map_err(|_| MgmtError::InvalidArgument(format!("{what} {value:?} is not an IPv4 address")))
}

/// Checks a conductor address: `ip` or `ip:port`.
pub fn conductor_addr(value: &str) -> Result<()> {
    if value.parse::<SocketAddrV4>().is_ok() {
        return Ok(());
    }
    ipv4("conductor address", value).map(|_| ())
}

/// Converts a quota field that must not be negative.
pub fn quota_field(what: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| MgmtError::InvalidArgument(format!("{what} must not be negative, got {value}")))
}

/// Interprets an update field: any negative value leaves the field unchanged.
pub fn sentinel(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

/// Checks a fan speed rate.
pub fn fan_rate(rate: u32) -> Result<()> {
    if rate > MAX_FAN_RATE {
        return Err(MgmtError::InvalidArgument(format!(
            "fan speed rate {rate} outside 0..={MAX_FAN_RATE}"
        )));
    }
    Ok(())
}
