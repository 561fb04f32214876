use crate::constants::{MAX_LABEL_LENGTH, MAX_NAME_LENGTH};
use crate::error::{ResolveError, Result};

/// Normalize a domain name for querying and cache indexing.
///
/// Lowercases, strips a single trailing dot, and enforces the DNS length
/// limits. Runs synchronously before any async work so bad input never
/// reaches the wire.
pub fn normalize_name(name: &str) -> Result<String> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);

    if trimmed.is_empty() {
        return Err(ResolveError::InvalidArgument("empty domain name".into()));
    }
    if trimmed.len() > MAX_NAME_LENGTH {
        return Err(ResolveError::InvalidArgument(format!(
            "domain name exceeds {} octets: {}",
            MAX_NAME_LENGTH, name
        )));
    }
    if !trimmed.is_ascii() {
        return Err(ResolveError::InvalidArgument(format!(
            "domain name is not ASCII: {}",
            name
        )));
    }

    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(ResolveError::InvalidArgument(format!(
                "empty label in domain name: {}",
                name
            )));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(ResolveError::InvalidArgument(format!(
                "label exceeds {} octets: {}",
                MAX_LABEL_LENGTH, label
            )));
        }
        // Underscore is required for SRV/TXT owner names (_sip._tcp.example.com).
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ResolveError::InvalidArgument(format!(
                "invalid character in label: {}",
                label
            )));
        }
    }

    Ok(trimmed.to_ascii_lowercase())
}
