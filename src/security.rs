// SPDX-License-Identifier: MIT
//! Security utilities.
//!
//! Guards the one untrusted boundary this crate has left after validation
//! handles payload shape: the `session_id` string the client
//! supplies on reconnect.

use anyhow::{bail, Result};

/// Validate that a session ID is a well-formed UUID (no injection possible
/// through a `session_id` used as a lookup key or log field).
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.len() != 36 {
        bail!("invalid session ID length: {}", id.len());
    }
    for (i, c) in id.chars().enumerate() {
        let is_dash = matches!(i, 8 | 13 | 18 | 23);
        if is_dash {
            if c != '-' {
                bail!("invalid session ID format at position {}", i);
            }
        } else if !c.is_ascii_hexdigit() {
            bail!("invalid session ID character at position {}: {}", i, c);
        }
    }
    Ok(())
}
