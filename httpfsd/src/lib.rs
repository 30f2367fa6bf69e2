//! httpfsd: serves a local directory tree over an HTTP-shaped verb protocol.
//!
//! Standard verbs (HEAD/GET/PUT/DELETE) carry stat, read, write and remove;
//! the extension verbs (MKDIR/LINK/RENAME/CHMOD/TRUNCATE) cover the rest of
//! the filesystem surface. The router is exported so tests can drive it over
//! a loopback listener without spawning the binary.

pub mod dispatch;
pub mod fsutil;

pub use dispatch::router;
