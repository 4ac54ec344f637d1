//! LanShare protocol constants and the file metadata carried in each frame.

use serde::{Deserialize, Serialize};

/// Discovery service type (DNS-SD form, without the `.local.` domain).
pub const SERVICE_TYPE: &str = "_fileshare._tcp";

/// Default TCP port for the transfer listener; also the advertised port.
pub const DEFAULT_PORT: u16 = 8080;

/// Separator between file name and decimal size in the metadata string.
pub const DEFAULT_DELIMITER: char = '|';

/// Role tag prepended to the host name to form the advertised device name.
pub const DEFAULT_NAME_PREFIX: &str = "LanShare-";

/// Seconds to wait for a discovered peer to resolve before dropping it.
pub const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 5;

/// File name and size announced before the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub file_name: String,
    pub file_size: u64,
}

impl Metadata {
    pub fn new(file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
        }
    }
}

/// Device name advertised for this host: role tag + host name.
pub fn device_name(prefix: &str, host: &str) -> String {
    format!("{prefix}{host}")
}

/// Reduce a received file name to its final path component so it can only land
/// inside the receive directory. Returns `None` if nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Option<&str> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("");
    match last {
        "" | "." | ".." => None,
        s => Some(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_has_prefix() {
        assert_eq!(device_name("LanShare-", "desk"), "LanShare-desk");
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("photo.jpg"), Some("photo.jpg"));
        assert_eq!(sanitize_file_name("../../etc/passwd"), Some("passwd"));
        assert_eq!(sanitize_file_name("C:\\Users\\a\\doc.txt"), Some("doc.txt"));
    }

    #[test]
    fn sanitize_rejects_empty_and_dots() {
        assert_eq!(sanitize_file_name(""), None);
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("a/."), None);
    }
}
