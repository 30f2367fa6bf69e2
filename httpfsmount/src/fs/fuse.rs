//! Kernel-facing adapter: implements the FUSE contract on top of the
//! filesystem core, translating node operations and lowering client errors to
//! errnos.

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, Result as FuseResult, SetAttr, Timestamp};

use common::path::join_path;
use common::{Entry, is_dir_mode, is_symlink_mode};

use super::{HttpFs, Node, NodeAttr, systime};
use crate::client::FileOps;
use crate::error::ClientError;

const TTL: Duration = Duration::from_secs(1);

fn errno(err: ClientError) -> Errno {
    err.errno().into()
}

fn kind_of(mode: u32) -> FileType {
    if is_dir_mode(mode) {
        FileType::Directory
    } else if is_symlink_mode(mode) {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}

fn entry_kind(entry: &Entry) -> FileType {
    if entry.is_dir || is_dir_mode(entry.mode) {
        FileType::Directory
    } else if is_symlink_mode(entry.mode) {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}

fn to_fuse_attr(attr: &NodeAttr, req: &Request) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: Timestamp::from(attr.atime),
        mtime: Timestamp::from(attr.mtime),
        ctime: Timestamp::from(attr.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(attr.crtime),
        kind: kind_of(attr.mode),
        perm: (attr.mode & 0o7777) as u16,
        nlink: 1,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[allow(refining_impl_trait_reachable)]
impl<C> Filesystem for HttpFs<C>
where
    C: FileOps,
{
    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let Some(node) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let Node::Dir(dir) = node else {
            return Err(libc::ENOTDIR.into());
        };

        let name = name.to_string_lossy();
        let child = self.lookup_child(&dir, name.as_ref()).await.map_err(errno)?;
        self.remember(&child);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(&child.attr(), &req),
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let attr = match self.node(inode) {
            None => return Err(libc::ENOENT.into()),
            // Directory attributes are fixed at creation.
            Some(Node::Dir(dir)) => dir.attr(),
            // File attributes always reflect the backend.
            Some(Node::File(file)) => self.refresh_file_attr(&file).await,
        };
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(&attr, &req),
        })
    }

    async fn setattr(
        &self,
        req: Request,
        inode: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let Some(node) = self.node(inode) else {
            return Err(libc::ENOENT.into());
        };
        let Node::File(file) = node else {
            return Err(libc::ENOSYS.into());
        };

        self.setattr_file(&file, set_attr.size, set_attr.mode)
            .await
            .map_err(errno)?;

        // lock_owner and the handle are observed but not acted on. Anything
        // else left unhandled must fail so the kernel stops retrying it.
        if set_attr.uid.is_some()
            || set_attr.gid.is_some()
            || set_attr.atime.is_some()
            || set_attr.mtime.is_some()
            || set_attr.ctime.is_some()
        {
            return Err(libc::ENOSYS.into());
        }

        let attr = self.refresh_file_attr(&file).await;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(&attr, &req),
        })
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let Some(node) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let Node::Dir(dir) = node else {
            return Err(libc::ENOTDIR.into());
        };

        let name = name.to_string_lossy();
        let child = self
            .mkdir_child(&dir, name.as_ref(), mode)
            .await
            .map_err(errno)?;
        let node = Node::Dir(child);
        self.remember(&node);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(&node.attr(), &req),
            generation: 0,
        })
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let Some(node) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let Node::Dir(dir) = node else {
            return Err(libc::ENOTDIR.into());
        };

        let name = name.to_string_lossy();
        let file = self
            .create_child(&dir, name.as_ref(), mode, flags)
            .await
            .map_err(errno)?;
        let node = Node::File(file.clone());
        self.remember(&node);
        Ok(ReplyCreated {
            ttl: TTL,
            attr: to_fuse_attr(&file.attr(), &req),
            generation: 0,
            fh: file.ino,
            flags: 0,
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let Some(node) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let Node::Dir(dir) = node else {
            return Err(libc::ENOTDIR.into());
        };
        self.remove_child(&dir, name.to_string_lossy().as_ref())
            .await
            .map_err(errno)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let Some(node) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let Node::Dir(dir) = node else {
            return Err(libc::ENOTDIR.into());
        };
        self.remove_child(&dir, name.to_string_lossy().as_ref())
            .await
            .map_err(errno)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let Some(Node::Dir(dir)) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let Some(Node::Dir(new_dir)) = self.node(new_parent) else {
            return Err(libc::ENOENT.into());
        };
        self.rename_child(
            &dir,
            &new_dir,
            name.to_string_lossy().as_ref(),
            new_name.to_string_lossy().as_ref(),
        )
        .await
        .map_err(errno)
    }

    async fn link(
        &self,
        req: Request,
        inode: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let Some(node) = self.node(inode) else {
            return Err(libc::ENOENT.into());
        };
        let Node::File(file) = node else {
            return Err(libc::EPERM.into());
        };
        let Some(Node::Dir(new_dir)) = self.node(new_parent) else {
            return Err(libc::ENOENT.into());
        };

        let new_node = self
            .link_file(&file, &new_dir, new_name.to_string_lossy().as_ref())
            .await
            .map_err(errno)?;
        self.remember(&new_node);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(&new_node.attr(), &req),
            generation: 0,
        })
    }

    async fn symlink(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let Some(node) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let Node::Dir(dir) = node else {
            return Err(libc::ENOTDIR.into());
        };

        let file = self
            .symlink_child(
                &dir,
                name.to_string_lossy().as_ref(),
                link.to_string_lossy().as_ref(),
            )
            .await
            .map_err(errno)?;
        let node = Node::File(file);
        self.remember(&node);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(&node.attr(), &req),
            generation: 0,
        })
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let Some(node) = self.node(inode) else {
            return Err(libc::ENOENT.into());
        };
        let Node::File(file) = node else {
            return Err(libc::EISDIR.into());
        };
        self.open_file(&file, flags);
        Ok(ReplyOpen {
            fh: file.ino,
            flags: 0,
        })
    }

    async fn read(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let Some(node) = self.node(inode) else {
            return Err(libc::ENOENT.into());
        };
        let Node::File(file) = node else {
            return Err(libc::EISDIR.into());
        };
        let data = self
            .read_file(&file, offset, size as usize)
            .await
            .map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let Some(node) = self.node(inode) else {
            return Err(libc::ENOENT.into());
        };
        let Node::File(file) = node else {
            return Err(libc::EISDIR.into());
        };
        let written = self.write_file(&file, offset, data).await.map_err(errno)?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        if let Some(Node::File(file)) = self.node(inode) {
            self.release_file(&file);
        }
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    // Permission checks are enforced by the backend.
    async fn access(&self, _req: Request, _inode: u64, _mask: u32) -> FuseResult<()> {
        Ok(())
    }

    // No backend support for filesystem statistics yet.
    async fn statfs(&self, _req: Request, _inode: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn opendir(&self, _req: Request, inode: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        match self.node(inode) {
            None => Err(libc::ENOENT.into()),
            Some(Node::File(_)) => Err(libc::ENOTDIR.into()),
            Some(Node::Dir(_)) => Ok(ReplyOpen { fh: 0, flags: 0 }),
        }
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<BoxStream<'a, FuseResult<DirectoryEntry>>>> {
        let Some(node) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let Node::Dir(dir) = node else {
            return Err(libc::ENOTDIR.into());
        };

        let mut all: Vec<DirectoryEntry> = Vec::new();
        if offset == 0 {
            all.push(DirectoryEntry {
                inode: dir.ino,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
            });
            all.push(DirectoryEntry {
                inode: dir.parent,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
            });
        }

        let entries = self.readdir_dir(&dir).await.map_err(errno)?;
        let skip = if offset <= 2 { 0 } else { (offset - 2) as usize };
        for (i, entry) in entries.iter().enumerate().skip(skip) {
            // Listing inodes are display-only; the real node is minted by the
            // lookup that follows.
            all.push(DirectoryEntry {
                inode: self.allocate_ino(),
                kind: entry_kind(entry),
                name: OsString::from(entry.name.clone()),
                offset: i as i64 + 3,
            });
        }

        let stream_iter = stream::iter(all.into_iter().map(Ok));
        let boxed: BoxStream<'a, FuseResult<DirectoryEntry>> = Box::pin(stream_iter);
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<BoxStream<'a, FuseResult<DirectoryEntryPlus>>>> {
        let Some(node) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let Node::Dir(dir) = node else {
            return Err(libc::ENOTDIR.into());
        };

        let mut all: Vec<DirectoryEntryPlus> = Vec::new();
        if offset == 0 {
            all.push(DirectoryEntryPlus {
                inode: dir.ino,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
                attr: to_fuse_attr(&dir.attr(), &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
            let parent_attr = self
                .node(dir.parent)
                .map(|n| n.attr())
                .unwrap_or_else(|| self.root().attr());
            all.push(DirectoryEntryPlus {
                inode: dir.parent,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
                attr: to_fuse_attr(&parent_attr, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let entries = self.readdir_dir(&dir).await.map_err(errno)?;
        let skip = offset.saturating_sub(2) as usize;
        for (i, entry) in entries.iter().enumerate().skip(skip) {
            // Listing data is enough to mint the child node without another
            // stat round trip.
            let path = join_path(&dir.path, &entry.name);
            let node = if entry.is_dir || is_dir_mode(entry.mode) {
                Node::Dir(self.new_dir(path, dir.ino, entry.mode))
            } else {
                Node::File(self.new_file(path, entry.mode, entry.size, systime(entry.mtime)))
            };
            self.remember(&node);
            all.push(DirectoryEntryPlus {
                inode: node.ino(),
                generation: 0,
                kind: entry_kind(entry),
                name: OsString::from(entry.name.clone()),
                offset: i as i64 + 3,
                attr: to_fuse_attr(&node.attr(), &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let stream_iter = stream::iter(all.into_iter().map(Ok));
        let boxed: BoxStream<'a, FuseResult<DirectoryEntryPlus>> = Box::pin(stream_iter);
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.forget_node(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for (inode, nlookup) in inodes {
            self.forget_node(*inode, *nlookup);
        }
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}
