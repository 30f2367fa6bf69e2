//! Wire contract shared by the httpfs server and the mount client:
//! directory-listing records, per-path stat metadata, the stat response
//! headers, HTTP date formatting and server-relative path handling.

use serde::{Deserialize, Serialize};

pub mod path;
pub mod time;

/// Size of the full mode integer carried on the wire, decimal-encoded.
/// Includes the type bits (`S_IFDIR`, `S_IFLNK`, ...), not just permissions.
pub const X_FILE_MODE: &str = "x-file-mode";
/// `true` / `false` directory marker header.
pub const X_IS_DIR: &str = "x-is-dir";

/// One record of a directory listing. Field spelling on the wire is fixed;
/// it is part of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Mode")]
    pub mode: u32,
    #[serde(rename = "ModTime")]
    pub mtime: i64,
    #[serde(rename = "IsDir")]
    pub is_dir: bool,
}

/// Per-path metadata as carried by the stat headers of a HEAD response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub is_dir: bool,
}

pub fn is_dir_mode(mode: u32) -> bool {
    mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
}

pub fn is_symlink_mode(mode: u32) -> bool {
    mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
}

pub fn is_regular_mode(mode: u32) -> bool {
    mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
}
