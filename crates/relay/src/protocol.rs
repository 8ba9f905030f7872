// Protocol version negotiation.
//
// Clients may name the protocol they speak with `?protocol=` on the
// WebSocket URL. Unknown versions are refused with UPGRADE_REQUIRED before
// the upgrade; omitting the parameter means the current version.

use coderoom_common::protocol::ws::CURRENT_PROTOCOL_VERSION;
use serde_json::json;

use crate::error::{ErrorCode, RelayError};

pub const CURRENT_VERSION: &str = CURRENT_PROTOCOL_VERSION;

/// Accepted versions, newest first.
const SUPPORTED_VERSIONS: &[&str] = &[CURRENT_VERSION];

pub fn is_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_VERSIONS
}

pub fn require_supported(version: &str) -> Result<(), RelayError> {
    if is_supported(version) {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_VERSIONS,
            "current_version": CURRENT_VERSION,
        })))
    }
}
