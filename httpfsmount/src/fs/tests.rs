//! Core adapter tests against a recording in-memory backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use common::{Entry, Stat};

use super::{HttpFs, Node, ROOT_INO, is_filtered, lock_order};
use crate::client::FileOps;
use crate::error::ClientError;

#[derive(Clone, Debug)]
struct MockEntry {
    data: Vec<u8>,
    mode: u32,
}

#[derive(Default, Debug)]
struct MockState {
    calls: StdMutex<Vec<String>>,
    files: StdMutex<HashMap<String, MockEntry>>,
    write_flags: StdMutex<Vec<i32>>,
    partial_write: StdMutex<Option<usize>>,
    fail_writes: AtomicBool,
}

/// In-memory stand-in for the transport; records every call it receives.
#[derive(Clone, Default, Debug)]
struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    fn new() -> Self {
        let mock = Self::default();
        mock.seed_dir("/");
        mock
    }

    fn record(&self, verb: &str, path: &str) {
        self.state
            .calls
            .lock()
            .unwrap()
            .push(format!("{verb} {path}"));
    }

    fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    fn seed_dir(&self, path: &str) {
        self.state.files.lock().unwrap().insert(
            path.to_string(),
            MockEntry {
                data: Vec::new(),
                mode: libc::S_IFDIR as u32 | 0o755,
            },
        );
    }

    fn seed_file(&self, path: &str, data: &[u8]) {
        self.state.files.lock().unwrap().insert(
            path.to_string(),
            MockEntry {
                data: data.to_vec(),
                mode: libc::S_IFREG as u32 | 0o644,
            },
        );
    }

    fn seed_symlink(&self, path: &str, target: &str) {
        self.state.files.lock().unwrap().insert(
            path.to_string(),
            MockEntry {
                data: target.as_bytes().to_vec(),
                mode: libc::S_IFLNK as u32 | 0o777,
            },
        );
    }

    fn seed_other(&self, path: &str) {
        self.state.files.lock().unwrap().insert(
            path.to_string(),
            MockEntry {
                data: Vec::new(),
                mode: libc::S_IFSOCK as u32 | 0o644,
            },
        );
    }

    fn has(&self, path: &str) -> bool {
        self.state.files.lock().unwrap().contains_key(path)
    }

    fn recorded_flags(&self) -> Vec<i32> {
        self.state.write_flags.lock().unwrap().clone()
    }

    fn stat_of(&self, entry: &MockEntry) -> Stat {
        Stat {
            size: entry.data.len() as u64,
            mtime: 1577934245,
            mode: entry.mode,
            is_dir: common::is_dir_mode(entry.mode),
        }
    }
}

#[async_trait]
impl FileOps for MockBackend {
    async fn stat(&self, path: &str) -> Result<Stat, ClientError> {
        self.record("HEAD", path);
        let files = self.state.files.lock().unwrap();
        files
            .get(path)
            .map(|entry| self.stat_of(entry))
            .ok_or(ClientError::NotFound)
    }

    async fn readdir(&self, path: &str) -> Result<Vec<Entry>, ClientError> {
        self.record("GET", path);
        let files = self.state.files.lock().unwrap();
        if !files.contains_key(path) {
            return Err(ClientError::NotFound);
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut entries: Vec<Entry> = files
            .iter()
            .filter(|(p, _)| {
                p.starts_with(&prefix) && *p != path && !p[prefix.len()..].contains('/')
            })
            .map(|(p, entry)| Entry {
                name: p[prefix.len()..].to_string(),
                size: entry.data.len() as u64,
                mode: entry.mode,
                mtime: 0,
                is_dir: common::is_dir_mode(entry.mode),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn mkdir(&self, path: &str, _perm: u32) -> Result<(), ClientError> {
        self.record("MKDIR", path);
        let mut files = self.state.files.lock().unwrap();
        if files.contains_key(path) {
            return Err(ClientError::AlreadyExists);
        }
        files.insert(
            path.to_string(),
            MockEntry {
                data: Vec::new(),
                mode: libc::S_IFDIR as u32 | 0o755,
            },
        );
        Ok(())
    }

    async fn link(&self, path: &str, new_path: &str) -> Result<(), ClientError> {
        self.record("LINK", path);
        let mut files = self.state.files.lock().unwrap();
        let Some(entry) = files.get(path).cloned() else {
            return Err(ClientError::NotFound);
        };
        if files.contains_key(new_path) {
            return Err(ClientError::AlreadyExists);
        }
        files.insert(new_path.to_string(), entry);
        Ok(())
    }

    async fn symlink(&self, target: &str, new_path: &str) -> Result<(), ClientError> {
        self.record("SYMLINK", target);
        let mut files = self.state.files.lock().unwrap();
        if files.contains_key(new_path) {
            return Err(ClientError::AlreadyExists);
        }
        files.insert(
            new_path.to_string(),
            MockEntry {
                data: target.as_bytes().to_vec(),
                mode: libc::S_IFLNK as u32 | 0o777,
            },
        );
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), ClientError> {
        self.record("RENAME", old_path);
        let mut files = self.state.files.lock().unwrap();
        let Some(entry) = files.remove(old_path) else {
            return Err(ClientError::NotFound);
        };
        files.insert(new_path.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), ClientError> {
        self.record("DELETE", path);
        let mut files = self.state.files.lock().unwrap();
        files
            .remove(path)
            .map(|_| ())
            .ok_or(ClientError::NotFound)
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), ClientError> {
        self.record("CHMOD", path);
        let mut files = self.state.files.lock().unwrap();
        let Some(entry) = files.get_mut(path) else {
            return Err(ClientError::NotFound);
        };
        entry.mode = (entry.mode & libc::S_IFMT as u32) | (mode & 0o7777);
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> Result<(), ClientError> {
        self.record("TRUNCATE", path);
        let mut files = self.state.files.lock().unwrap();
        let Some(entry) = files.get_mut(path) else {
            return Err(ClientError::NotFound);
        };
        entry.data.resize(size as usize, 0);
        Ok(())
    }

    async fn read_at(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>, ClientError> {
        self.record("READ", path);
        let files = self.state.files.lock().unwrap();
        let Some(entry) = files.get(path) else {
            return Err(ClientError::NotFound);
        };
        let start = (offset as usize).min(entry.data.len());
        let end = (start + size).min(entry.data.len());
        Ok(entry.data[start..end].to_vec())
    }

    async fn write_at(
        &self,
        path: &str,
        data: &[u8],
        flags: i32,
        _perm: u32,
        offset: i64,
    ) -> Result<usize, ClientError> {
        self.record("PUT", path);
        self.state.write_flags.lock().unwrap().push(flags);
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(ClientError::Status(500));
        }

        let mut files = self.state.files.lock().unwrap();
        let exists = files.contains_key(path);
        if flags & libc::O_EXCL != 0 && exists {
            return Err(ClientError::AlreadyExists);
        }
        if flags & libc::O_CREAT == 0 && !exists {
            return Err(ClientError::NotFound);
        }
        let entry = files.entry(path.to_string()).or_insert(MockEntry {
            data: Vec::new(),
            mode: libc::S_IFREG as u32 | 0o644,
        });
        let offset = offset.max(0) as usize;
        if entry.data.len() < offset + data.len() {
            entry.data.resize(offset + data.len(), 0);
        }
        entry.data[offset..offset + data.len()].copy_from_slice(data);

        if let Some(n) = *self.state.partial_write.lock().unwrap() {
            return Ok(n);
        }
        Ok(data.len())
    }
}

fn fixture() -> (HttpFs<MockBackend>, MockBackend) {
    let mock = MockBackend::new();
    (HttpFs::new(mock.clone()), mock)
}

#[tokio::test]
async fn root_is_inode_one() {
    let (fs, _mock) = fixture();
    let root = fs.root();
    assert_eq!(root.ino, ROOT_INO);
    assert_eq!(root.path, "/");
    assert!(common::is_dir_mode(root.attr().mode));
    assert_eq!(root.attr().mode & 0o777, 0o777);
}

#[tokio::test]
async fn inodes_are_unique_and_monotonic() {
    let (fs, mock) = fixture();
    mock.seed_dir("/a");
    mock.seed_file("/b", b"x");

    let root = fs.root();
    let a = fs.lookup_child(&root, "a").await.unwrap();
    let b = fs.lookup_child(&root, "b").await.unwrap();
    let a_again = fs.lookup_child(&root, "a").await.unwrap();

    assert!(a.ino() > ROOT_INO);
    assert!(b.ino() > a.ino());
    // Nodes are minted per lookup; identifiers never repeat.
    assert!(a_again.ino() > b.ino());
}

#[tokio::test]
async fn filtered_names_never_touch_the_network() {
    let (fs, mock) = fixture();
    let root = fs.root();

    for name in [".DS_Store", ".Spotlight-V100", "._resource", "._."] {
        let err = fs.lookup_child(&root, name).await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound), "{name}");
    }
    assert!(mock.calls().is_empty());

    assert!(is_filtered(".hidden"));
    assert!(!is_filtered("regular.txt"));
}

#[tokio::test]
async fn lookup_classifies_by_mode() {
    let (fs, mock) = fixture();
    mock.seed_dir("/d");
    mock.seed_file("/f", b"data");
    mock.seed_symlink("/l", "/f");

    let root = fs.root();
    assert!(matches!(
        fs.lookup_child(&root, "d").await.unwrap(),
        Node::Dir(_)
    ));

    let f = fs.lookup_child(&root, "f").await.unwrap();
    let Node::File(file) = f else {
        panic!("regular file should be a file node")
    };
    assert_eq!(file.attr().size, 4);
    assert!(common::is_regular_mode(file.attr().mode));

    let l = fs.lookup_child(&root, "l").await.unwrap();
    let Node::File(link) = l else {
        panic!("symlink should be a file node")
    };
    assert!(common::is_symlink_mode(link.attr().mode));

    let missing = fs.lookup_child(&root, "nope").await.unwrap_err();
    assert!(matches!(missing, ClientError::NotFound));
}

#[tokio::test]
async fn lookup_rejects_unknown_entry_types() {
    let (fs, mock) = fixture();
    mock.seed_other("/sock");

    let root = fs.root();
    let err = fs.lookup_child(&root, "sock").await.unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)));
}

#[tokio::test]
async fn mkdir_rejects_existing_names() {
    let (fs, mock) = fixture();
    mock.seed_dir("/a");

    let root = fs.root();
    let err = fs.mkdir_child(&root, "a", 0o755).await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyExists));

    let b = fs.mkdir_child(&root, "b", 0o755).await.unwrap();
    assert_eq!(b.path, "/b");
    assert!(mock.has("/b"));
}

#[tokio::test]
async fn create_defers_materialisation_to_first_write() {
    let (fs, mock) = fixture();
    let root = fs.root();

    let file = fs
        .create_child(&root, "new.txt", 0o644, libc::O_WRONLY as u32)
        .await
        .unwrap();
    assert!(file.created());
    // Nothing on the backend yet.
    assert!(!mock.has("/new.txt"));

    let n = fs.write_file(&file, 0, b"hello").await.unwrap();
    assert_eq!(n, 5);
    assert!(!file.created());
    assert!(mock.has("/new.txt"));

    // First write carries create|excl; later writes don't.
    fs.write_file(&file, 5, b" world").await.unwrap();
    let flags = mock.recorded_flags();
    assert_eq!(flags.len(), 2);
    assert_eq!(flags[0] & libc::O_CREAT, libc::O_CREAT);
    assert_eq!(flags[0] & libc::O_EXCL, libc::O_EXCL);
    assert_eq!(flags[1] & (libc::O_CREAT | libc::O_EXCL), 0);
}

#[tokio::test]
async fn failed_first_write_keeps_the_created_flag() {
    let (fs, mock) = fixture();
    let root = fs.root();

    let file = fs
        .create_child(&root, "f", 0o644, libc::O_WRONLY as u32)
        .await
        .unwrap();
    mock.state.fail_writes.store(true, Ordering::SeqCst);
    assert!(fs.write_file(&file, 0, b"x").await.is_err());
    assert!(file.created());

    mock.state.fail_writes.store(false, Ordering::SeqCst);
    fs.write_file(&file, 0, b"x").await.unwrap();
    assert!(!file.created());
}

#[tokio::test]
async fn create_rejects_existing_names() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"x");

    let root = fs.root();
    let err = fs
        .create_child(&root, "f", 0o644, libc::O_WRONLY as u32)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AlreadyExists));
}

#[tokio::test]
async fn read_reports_actual_byte_count() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"abc");

    let root = fs.root();
    let Node::File(file) = fs.lookup_child(&root, "f").await.unwrap() else {
        panic!("expected file")
    };
    fs.open_file(&file, libc::O_RDONLY as u32);

    // Asking for more than the file holds returns only what exists.
    let data = fs.read_file(&file, 0, 16).await.unwrap();
    assert_eq!(data, b"abc");

    let tail = fs.read_file(&file, 2, 16).await.unwrap();
    assert_eq!(tail, b"c");
}

#[tokio::test]
async fn io_without_a_handle_is_unsupported() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"abc");

    let root = fs.root();
    let Node::File(file) = fs.lookup_child(&root, "f").await.unwrap() else {
        panic!("expected file")
    };

    let err = fs.read_file(&file, 0, 4).await.unwrap_err();
    assert!(matches!(err, ClientError::Unsupported));
    let err = fs.write_file(&file, 0, b"x").await.unwrap_err();
    assert!(matches!(err, ClientError::Unsupported));
}

#[tokio::test]
async fn short_writes_surface_the_server_count() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"");

    let root = fs.root();
    let Node::File(file) = fs.lookup_child(&root, "f").await.unwrap() else {
        panic!("expected file")
    };
    fs.open_file(&file, libc::O_WRONLY as u32);

    *mock.state.partial_write.lock().unwrap() = Some(3);
    let n = fs.write_file(&file, 0, b"hello").await.unwrap();
    assert_eq!(n, 3);
}

#[tokio::test]
async fn remove_requires_existence() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"x");

    let root = fs.root();
    let err = fs.remove_child(&root, "missing").await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound));
    // Only the existence probe went out, no DELETE.
    assert_eq!(mock.calls(), vec!["HEAD /missing"]);

    fs.remove_child(&root, "f").await.unwrap();
    assert!(!mock.has("/f"));
}

#[tokio::test]
async fn rename_moves_between_directories() {
    let (fs, mock) = fixture();
    mock.seed_dir("/src");
    mock.seed_dir("/dst");
    mock.seed_file("/src/f", b"payload");

    let root = fs.root();
    let Node::Dir(src) = fs.lookup_child(&root, "src").await.unwrap() else {
        panic!("expected dir")
    };
    let Node::Dir(dst) = fs.lookup_child(&root, "dst").await.unwrap() else {
        panic!("expected dir")
    };

    let err = fs
        .rename_child(&src, &dst, "missing", "f")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotFound));

    fs.rename_child(&src, &dst, "f", "g").await.unwrap();
    assert!(!mock.has("/src/f"));
    assert!(mock.has("/dst/g"));
}

#[tokio::test]
async fn rename_within_one_directory_locks_once() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"x");

    let root = fs.root();
    // Same node on both sides must not deadlock on its own lock.
    fs.rename_child(&root, &root, "f", "g").await.unwrap();
    assert!(mock.has("/g"));
}

#[tokio::test]
async fn hard_link_requires_a_free_name() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"x");
    mock.seed_file("/taken", b"y");

    let root = fs.root();
    let Node::File(file) = fs.lookup_child(&root, "f").await.unwrap() else {
        panic!("expected file")
    };

    // An occupied target name fails with "already exists".
    let err = fs.link_file(&file, &root, "taken").await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyExists));

    let node = fs.link_file(&file, &root, "f2").await.unwrap();
    assert!(mock.has("/f2"));
    assert!(matches!(node, Node::File(_)));
}

#[tokio::test]
async fn symlink_creates_a_symlink_node() {
    let (fs, mock) = fixture();
    mock.seed_dir("/d");
    mock.seed_file("/d/target", b"content");

    let root = fs.root();
    let Node::Dir(dir) = fs.lookup_child(&root, "d").await.unwrap() else {
        panic!("expected dir")
    };

    let link = fs.symlink_child(&dir, "ln", "target").await.unwrap();
    assert!(common::is_symlink_mode(link.attr().mode));
    assert!(mock.has("/d/ln"));
    // Relative targets resolve under the directory.
    assert!(mock.calls().contains(&"SYMLINK /d/target".to_string()));

    let err = fs.symlink_child(&dir, "target", "x").await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyExists));
}

#[tokio::test]
async fn file_attrs_refresh_from_the_backend() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"four");

    let root = fs.root();
    let Node::File(file) = fs.lookup_child(&root, "f").await.unwrap() else {
        panic!("expected file")
    };
    assert_eq!(fs.refresh_file_attr(&file).await.size, 4);

    mock.seed_file("/f", b"longer now");
    assert_eq!(fs.refresh_file_attr(&file).await.size, 10);
}

#[tokio::test]
async fn fresh_files_fall_back_to_cached_attrs() {
    let (fs, _mock) = fixture();
    let root = fs.root();

    // Not on the backend yet, so stat fails and the cache answers.
    let file = fs
        .create_child(&root, "f", 0o600, libc::O_WRONLY as u32)
        .await
        .unwrap();
    let attr = fs.refresh_file_attr(&file).await;
    assert_eq!(attr.ino, file.ino);
    assert_eq!(attr.mode & 0o7777, 0o600);
}

#[tokio::test]
async fn setattr_orders_truncate_before_chmod() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"hello world");

    let root = fs.root();
    let Node::File(file) = fs.lookup_child(&root, "f").await.unwrap() else {
        panic!("expected file")
    };

    fs.setattr_file(&file, Some(5), Some(0o600)).await.unwrap();
    let calls = mock.calls();
    let truncate_at = calls.iter().position(|c| c == "TRUNCATE /f").unwrap();
    let chmod_at = calls.iter().position(|c| c == "CHMOD /f").unwrap();
    assert!(truncate_at < chmod_at);

    let attr = fs.refresh_file_attr(&file).await;
    assert_eq!(attr.size, 5);
    assert_eq!(attr.mode & 0o7777, 0o600);
}

#[tokio::test]
async fn forget_evicts_everything_but_the_root() {
    let (fs, mock) = fixture();
    mock.seed_file("/f", b"x");

    let root = fs.root();
    let node = fs.lookup_child(&root, "f").await.unwrap();
    let ino = node.ino();
    fs.remember(&node);

    fs.forget_node(ino, 1);
    assert!(fs.node(ino).is_none());

    fs.forget_node(ROOT_INO, u64::MAX);
    assert!(fs.node(ROOT_INO).is_some());
}

#[test]
fn locks_are_ordered_by_ascending_inode() {
    assert_eq!(lock_order(2, 7), (2, 7));
    assert_eq!(lock_order(7, 2), (2, 7));
    assert_eq!(lock_order(3, 3), (3, 3));
}
