use crate::error::GatewayError;

/// Validates a caller-supplied remote path before it may appear in any
/// command line.
///
/// Accepted paths are absolute, free of `.`/`..` segments and free of
/// control characters. This runs in front of the command executor as a hard
/// precondition; rejected paths never reach the wire.
pub fn validate_remote_path(path: &str) -> Result<&str, GatewayError> {
    if !path.starts_with('/') {
        return Err(GatewayError::InvalidPath(format!(
            "remote path must be absolute: {path:?}"
        )));
    }
    if path.bytes().any(|b| b.is_ascii_control()) {
        return Err(GatewayError::InvalidPath(
            "remote path contains control characters".into(),
        ));
    }
    if path.split('/').any(|segment| segment == ".." || segment == ".") {
        return Err(GatewayError::InvalidPath(format!(
            "remote path must not contain dot segments: {path:?}"
        )));
    }
    Ok(path)
}

/// Validates one path component (a file or directory name without
/// separators).
pub fn validate_segment(segment: &str) -> Result<&str, GatewayError> {
    if segment.is_empty() {
        return Err(GatewayError::InvalidPath("empty path segment".into()));
    }
    if segment == ".." || segment == "." {
        return Err(GatewayError::InvalidPath(format!(
            "path segment must not be a dot segment: {segment:?}"
        )));
    }
    if segment.contains('/') || segment.bytes().any(|b| b.is_ascii_control()) {
        return Err(GatewayError::InvalidPath(format!(
            "invalid characters in path segment: {segment:?}"
        )));
    }
    Ok(segment)
}

/// Quotes a string for safe interpolation into a POSIX shell command line.
///
/// Everything is wrapped in single quotes; embedded single quotes are
/// rendered as `'\''`.
pub fn shell_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}
