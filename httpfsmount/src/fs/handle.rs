//! Open-file handles. A handle is a stateless bundle of (path, flags, perm,
//! client) parameterising ranged reads and offset writes; there is no
//! server-side session behind it.

use std::sync::{Arc, Weak};

use super::FileNode;
use crate::client::FileOps;
use crate::error::ClientError;

#[derive(Debug)]
pub struct Handle<C: FileOps> {
    client: Arc<C>,
    // The file outlives its handle; this must not keep the node alive.
    file: Weak<FileNode<C>>,
    path: String,
    flags: i32,
    perm: u32,
}

impl<C: FileOps> Handle<C> {
    pub(crate) fn new(
        client: Arc<C>,
        file: Weak<FileNode<C>>,
        path: String,
        flags: i32,
        perm: u32,
    ) -> Self {
        Self {
            client,
            file,
            path,
            flags,
            perm,
        }
    }

    /// Ranged read; returns the bytes actually received.
    pub async fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>, ClientError> {
        self.client.read_at(&self.path, size, offset).await
    }

    /// Offset write. The first write of a freshly created file carries
    /// create|excl so the file materialises exactly once on the backend; the
    /// flag clears only once that write succeeds.
    pub async fn write_at(&self, offset: i64, data: &[u8]) -> Result<usize, ClientError> {
        let file = self.file.upgrade();
        let fresh = file.as_ref().map(|f| f.created()).unwrap_or(false);
        let mut flags = self.flags;
        if fresh {
            flags |= libc::O_CREAT | libc::O_EXCL;
        }

        let written = self
            .client
            .write_at(&self.path, data, flags, self.perm, offset)
            .await?;

        if fresh {
            if let Some(file) = file {
                file.clear_created();
            }
        }
        Ok(written)
    }

    /// No server-side session exists, so closing is a no-op.
    pub fn close(&self) {}
}
