//! Client-side filesystem core: node identity, the ino→node registry,
//! per-node locks and the directory/file operations the FUSE layer drives.
//!
//! Nodes are created lazily by lookup/create/mkdir/symlink and evicted when
//! the kernel forgets them. Inodes are allocated from one monotonic counter
//! and never reused within a mount session; the root directory is always
//! inode 1.

mod fuse;
mod handle;
pub mod mount;

pub use handle::Handle;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, error};

use common::path::join_path;
use common::{Entry, is_dir_mode, is_regular_mode, is_symlink_mode};

use crate::client::FileOps;
use crate::error::ClientError;

pub const ROOT_INO: u64 = 1;

/// Entry names suppressed from lookup without any network traffic. These are
/// platform indexing probes that would otherwise hammer the backend.
const IGNORED_NAMES: &[&str] = &[
    "DCIM",
    "Backups.backupdb",
    ".Spotlight-V100",
    "mach_kernel",
    ".metadata_never_index",
    ".metadata_never_index_unless_rootfs",
    ".DS_Store",
    ".localized",
    ".hidden",
    "._.",
];

pub(crate) fn is_filtered(name: &str) -> bool {
    IGNORED_NAMES.contains(&name) || name.starts_with("._")
}

/// Cached node attributes. Directory attributes are fixed at creation; file
/// attributes are refreshed from the backend on every attribute query.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

#[derive(Debug)]
pub struct DirNode {
    pub ino: u64,
    pub parent: u64,
    pub path: String,
    attr: NodeAttr,
    lookups: AtomicU64,
    lock: RwLock<()>,
}

impl DirNode {
    pub fn attr(&self) -> NodeAttr {
        self.attr
    }
}

#[derive(Debug)]
pub struct FileNode<C: FileOps> {
    pub ino: u64,
    pub path: String,
    attr: StdMutex<NodeAttr>,
    created: AtomicBool,
    handle: StdMutex<Option<Arc<Handle<C>>>>,
    lookups: AtomicU64,
    lock: RwLock<()>,
}

impl<C: FileOps> FileNode<C> {
    pub fn attr(&self) -> NodeAttr {
        *self.attr.lock().unwrap()
    }

    /// True until the first successful write materialises the file remotely.
    pub fn created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_created(&self) {
        self.created.store(false, Ordering::SeqCst);
    }

    pub fn handle(&self) -> Option<Arc<Handle<C>>> {
        self.handle.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub enum Node<C: FileOps> {
    Dir(Arc<DirNode>),
    File(Arc<FileNode<C>>),
}

impl<C: FileOps> Clone for Node<C> {
    fn clone(&self) -> Self {
        match self {
            Node::Dir(dir) => Node::Dir(dir.clone()),
            Node::File(file) => Node::File(file.clone()),
        }
    }
}

impl<C: FileOps> Node<C> {
    pub fn ino(&self) -> u64 {
        match self {
            Node::Dir(dir) => dir.ino,
            Node::File(file) => file.ino,
        }
    }

    pub fn attr(&self) -> NodeAttr {
        match self {
            Node::Dir(dir) => dir.attr(),
            Node::File(file) => file.attr(),
        }
    }

    fn lookups(&self) -> &AtomicU64 {
        match self {
            Node::Dir(dir) => &dir.lookups,
            Node::File(file) => &file.lookups,
        }
    }
}

/// Filesystem root: transport handle, monotonic inode counter and the node
/// registry keyed by inode.
pub struct HttpFs<C: FileOps> {
    client: Arc<C>,
    next_ino: AtomicU64,
    nodes: DashMap<u64, Node<C>>,
}

impl<C: FileOps> HttpFs<C> {
    pub fn new(client: C) -> Self {
        let fs = Self {
            client: Arc::new(client),
            next_ino: AtomicU64::new(0),
            nodes: DashMap::new(),
        };
        let root = fs.new_dir("/".to_string(), ROOT_INO, 0o777);
        assert_eq!(root.ino, ROOT_INO, "root node must be assigned inode 1");
        fs
    }

    fn allocate_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn new_dir(&self, path: String, parent: u64, mode: u32) -> Arc<DirNode> {
        let ino = self.allocate_ino();
        let now = SystemTime::now();
        let dir = Arc::new(DirNode {
            ino,
            parent,
            path,
            attr: NodeAttr {
                ino,
                size: 0,
                mode: libc::S_IFDIR as u32 | mode,
                atime: now,
                mtime: now,
                ctime: now,
                crtime: now,
            },
            lookups: AtomicU64::new(0),
            lock: RwLock::new(()),
        });
        self.nodes.insert(ino, Node::Dir(dir.clone()));
        dir
    }

    pub(crate) fn new_file(
        &self,
        path: String,
        mode: u32,
        size: u64,
        mtime: SystemTime,
    ) -> Arc<FileNode<C>> {
        let ino = self.allocate_ino();
        let now = SystemTime::now();
        let mode = if mode & libc::S_IFMT as u32 == 0 {
            mode | libc::S_IFREG as u32
        } else {
            mode
        };
        let file = Arc::new(FileNode {
            ino,
            path,
            attr: StdMutex::new(NodeAttr {
                ino,
                size,
                mode,
                atime: now,
                mtime,
                ctime: now,
                crtime: now,
            }),
            created: AtomicBool::new(false),
            handle: StdMutex::new(None),
            lookups: AtomicU64::new(0),
            lock: RwLock::new(()),
        });
        self.nodes.insert(ino, Node::File(file.clone()));
        file
    }

    pub fn node(&self, ino: u64) -> Option<Node<C>> {
        self.nodes.get(&ino).map(|entry| entry.value().clone())
    }

    pub fn root(&self) -> Arc<DirNode> {
        match self.node(ROOT_INO) {
            Some(Node::Dir(dir)) => dir,
            _ => unreachable!("root is seeded at construction and never evicted"),
        }
    }

    /// Bump the kernel reference count of a node handed out as an entry.
    pub(crate) fn remember(&self, node: &Node<C>) {
        node.lookups().fetch_add(1, Ordering::SeqCst);
    }

    /// Kernel reference drop; the node is evicted once all references are
    /// gone. The root is never evicted.
    pub fn forget_node(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(node) = self.node(ino) else {
            return;
        };
        let prev = node.lookups().fetch_sub(nlookup, Ordering::SeqCst);
        if prev <= nlookup {
            self.nodes.remove(&ino);
        }
    }

    async fn exists(&self, path: &str) -> bool {
        self.client.stat(path).await.is_ok()
    }

    /// Resolve a name under a directory. Filtered names short-circuit to
    /// not-found before any transport call.
    pub async fn lookup_child(
        &self,
        dir: &Arc<DirNode>,
        name: &str,
    ) -> Result<Node<C>, ClientError> {
        if is_filtered(name) {
            debug!(target: "httpfsmount::fs", name, "filtered lookup");
            return Err(ClientError::NotFound);
        }

        let _guard = dir.lock.read().await;
        let path = join_path(&dir.path, name);
        let stat = self
            .client
            .stat(&path)
            .await
            .map_err(|_| ClientError::NotFound)?;

        if stat.is_dir || is_dir_mode(stat.mode) {
            Ok(Node::Dir(self.new_dir(path, dir.ino, stat.mode)))
        } else if is_symlink_mode(stat.mode) || is_regular_mode(stat.mode) {
            Ok(Node::File(self.new_file(
                path,
                stat.mode,
                stat.size,
                systime(stat.mtime),
            )))
        } else {
            error!(target: "httpfsmount::fs", path, mode = stat.mode, "unknown entry type");
            Err(ClientError::Protocol(format!(
                "unknown entry type in mode {:o}",
                stat.mode
            )))
        }
    }

    pub async fn readdir_dir(&self, dir: &Arc<DirNode>) -> Result<Vec<Entry>, ClientError> {
        let _guard = dir.lock.read().await;
        self.client.readdir(&dir.path).await
    }

    pub async fn mkdir_child(
        &self,
        dir: &Arc<DirNode>,
        name: &str,
        mode: u32,
    ) -> Result<Arc<DirNode>, ClientError> {
        let _guard = dir.lock.write().await;
        let path = join_path(&dir.path, name);
        if self.exists(&path).await {
            return Err(ClientError::AlreadyExists);
        }
        self.client.mkdir(&path, mode & 0o7777).await?;
        Ok(self.new_dir(path, dir.ino, mode))
    }

    /// Create a file node with an attached handle. The file does not exist on
    /// the backend until the first write, which carries create|excl.
    pub async fn create_child(
        &self,
        dir: &Arc<DirNode>,
        name: &str,
        mode: u32,
        flags: u32,
    ) -> Result<Arc<FileNode<C>>, ClientError> {
        let _guard = dir.lock.write().await;
        let path = join_path(&dir.path, name);
        if self.exists(&path).await {
            return Err(ClientError::AlreadyExists);
        }

        let file = self.new_file(path.clone(), mode, 0, SystemTime::now());
        file.created.store(true, Ordering::SeqCst);
        let handle = Arc::new(Handle::new(
            self.client.clone(),
            Arc::downgrade(&file),
            path,
            flags as i32,
            mode & 0o7777,
        ));
        *file.handle.lock().unwrap() = Some(handle);
        Ok(file)
    }

    pub async fn remove_child(&self, dir: &Arc<DirNode>, name: &str) -> Result<(), ClientError> {
        let _guard = dir.lock.write().await;
        let path = join_path(&dir.path, name);
        self.client
            .stat(&path)
            .await
            .map_err(|_| ClientError::NotFound)?;
        self.client.delete(&path).await
    }

    pub async fn rename_child(
        &self,
        dir: &Arc<DirNode>,
        new_dir: &Arc<DirNode>,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), ClientError> {
        let _guards = lock_two((dir.ino, &dir.lock), (new_dir.ino, &new_dir.lock)).await;
        let old_path = join_path(&dir.path, old_name);
        let new_path = join_path(&new_dir.path, new_name);
        self.client
            .stat(&old_path)
            .await
            .map_err(|_| ClientError::NotFound)?;
        self.client.rename(&old_path, &new_path).await
    }

    /// Hard link an existing file under a new name. The new name must be
    /// free.
    pub async fn link_file(
        &self,
        file: &Arc<FileNode<C>>,
        new_dir: &Arc<DirNode>,
        new_name: &str,
    ) -> Result<Node<C>, ClientError> {
        let _guards = lock_two((file.ino, &file.lock), (new_dir.ino, &new_dir.lock)).await;
        let new_path = join_path(&new_dir.path, new_name);
        if self.exists(&new_path).await {
            return Err(ClientError::AlreadyExists);
        }
        self.client.link(&file.path, &new_path).await?;
        let stat = self.client.stat(&new_path).await?;
        Ok(Node::File(self.new_file(
            new_path,
            stat.mode,
            stat.size,
            systime(stat.mtime),
        )))
    }

    /// Create a symlink named `name` in `dir`. Link targets are
    /// server-relative: relative targets resolve under this directory.
    pub async fn symlink_child(
        &self,
        dir: &Arc<DirNode>,
        name: &str,
        target: &str,
    ) -> Result<Arc<FileNode<C>>, ClientError> {
        let _guard = dir.lock.write().await;
        let new_path = join_path(&dir.path, name);
        if self.exists(&new_path).await {
            return Err(ClientError::AlreadyExists);
        }
        let target_path = join_path(&dir.path, target);
        self.client.symlink(&target_path, &new_path).await?;
        let stat = self.client.stat(&new_path).await?;
        Ok(self.new_file(new_path, stat.mode, stat.size, systime(stat.mtime)))
    }

    /// Refresh a file's cached attributes from the backend. Freshly created
    /// files don't exist remotely until their first write, so a failed stat
    /// falls back to the cache.
    pub async fn refresh_file_attr(&self, file: &Arc<FileNode<C>>) -> NodeAttr {
        let _guard = file.lock.read().await;
        match self.client.stat(&file.path).await {
            Ok(stat) => {
                let mut attr = file.attr.lock().unwrap();
                attr.size = stat.size;
                attr.mtime = systime(stat.mtime);
                attr.mode = stat.mode;
                *attr
            }
            Err(err) => {
                debug!(
                    target: "httpfsmount::fs",
                    path = %file.path, %err, "stat failed, serving cached attributes"
                );
                *file.attr.lock().unwrap()
            }
        }
    }

    pub fn open_file(&self, file: &Arc<FileNode<C>>, flags: u32) {
        let perm = file.attr.lock().unwrap().mode & 0o7777;
        let handle = Arc::new(Handle::new(
            self.client.clone(),
            Arc::downgrade(file),
            file.path.clone(),
            flags as i32,
            perm,
        ));
        *file.handle.lock().unwrap() = Some(handle);
    }

    pub fn release_file(&self, file: &Arc<FileNode<C>>) {
        if let Some(handle) = file.handle.lock().unwrap().take() {
            handle.close();
        }
    }

    pub async fn read_file(
        &self,
        file: &Arc<FileNode<C>>,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, ClientError> {
        let _guard = file.lock.read().await;
        let handle = file.handle().ok_or(ClientError::Unsupported)?;
        handle.read_at(offset, size).await
    }

    pub async fn write_file(
        &self,
        file: &Arc<FileNode<C>>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, ClientError> {
        let _guard = file.lock.write().await;
        let handle = file.handle().ok_or(ClientError::Unsupported)?;
        handle.write_at(offset as i64, data).await
    }

    /// Apply the handled setattr fields in order: size, then mode.
    pub async fn setattr_file(
        &self,
        file: &Arc<FileNode<C>>,
        size: Option<u64>,
        mode: Option<u32>,
    ) -> Result<(), ClientError> {
        let _guard = file.lock.write().await;
        if let Some(size) = size {
            self.client.truncate(&file.path, size).await?;
        }
        if let Some(mode) = mode {
            self.client.chmod(&file.path, mode).await?;
        }
        Ok(())
    }
}

/// Ascending-inode lock order for cross-node mutations.
pub(crate) fn lock_order(a: u64, b: u64) -> (u64, u64) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Take both write locks in ascending inode order; equal inodes lock once.
/// This is the only multi-node lock acquisition in the adapter.
async fn lock_two<'a>(
    a: (u64, &'a RwLock<()>),
    b: (u64, &'a RwLock<()>),
) -> (RwLockWriteGuard<'a, ()>, Option<RwLockWriteGuard<'a, ()>>) {
    if a.0 == b.0 {
        (a.1.write().await, None)
    } else {
        let (first, second) = if lock_order(a.0, b.0).0 == a.0 {
            (a, b)
        } else {
            (b, a)
        };
        let first_guard = first.1.write().await;
        let second_guard = second.1.write().await;
        (first_guard, Some(second_guard))
    }
}

fn systime(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

#[cfg(test)]
mod tests;
