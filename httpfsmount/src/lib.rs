//! httpfsmount: mounts a remote httpfs tree as a local FUSE filesystem.
//!
//! The transport facade (`client`) turns typed file operations into protocol
//! requests; the adapter (`fs`) implements the kernel contract on top of it,
//! owning node identity and per-node locking.

pub mod client;
pub mod error;
pub mod fs;

pub use client::{FileOps, HttpClient};
pub use error::ClientError;
pub use fs::HttpFs;
