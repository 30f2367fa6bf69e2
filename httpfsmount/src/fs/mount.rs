//! Mount helpers for starting/stopping FUSE.
//!
//! Linux-only: unprivileged mounts go through fusermount3. These are thin
//! wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use super::HttpFs;
use crate::client::FileOps;

fn default_mount_options() -> MountOptions {
    let mut options = MountOptions::default();
    options.fs_name("httpfs");
    options.custom_options("subtype=httpfs");
    // The backend is shared by nature; let other local users through.
    options.allow_other(true);
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    options.uid(uid).gid(gid);
    options
}

/// Mount the filesystem on an existing directory using unprivileged mode.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<C: FileOps>(
    fs: HttpFs<C>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let options = default_mount_options();
    let session = rfuse3::raw::Session::new(options);
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<C: FileOps>(
    _fs: HttpFs<C>,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
