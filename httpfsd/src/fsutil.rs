//! Local filesystem helpers for the dispatcher.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use common::Entry;

/// List a directory as wire entries. Symlinks stat as themselves (the
/// per-entry metadata does not follow links). Sorted by name so repeated
/// listings are stable.
pub async fn read_dir_entries(dir: &Path) -> io::Result<Vec<Entry>> {
    let mut rd = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(ent) = rd.next_entry().await? {
        let md = ent.metadata().await?;
        entries.push(Entry {
            name: ent.file_name().to_string_lossy().into_owned(),
            size: md.len(),
            mode: md.mode(),
            mtime: md.mtime(),
            is_dir: md.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Map open(2)-style flag bits onto `OpenOptions`. The access mode and the
/// creation bits are handled by the builder; anything else is passed through
/// verbatim.
pub fn open_options(flags: i32, perm: u32) -> tokio::fs::OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;

    let mut opts = tokio::fs::OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    if flags & libc::O_CREAT != 0 {
        opts.create(true);
    }
    if flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    if flags & libc::O_EXCL != 0 {
        opts.create_new(true);
    }
    let passthrough = flags
        & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL);
    opts.custom_flags(passthrough);
    opts.mode(perm);
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn lists_sorted_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();

        let entries = read_dir_entries(tmp.path()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

        let sub = entries.iter().find(|e| e.name == "sub").unwrap();
        assert!(sub.is_dir);
        assert!(common::is_dir_mode(sub.mode));
        let a = entries.iter().find(|e| e.name == "a.txt").unwrap();
        assert_eq!(a.size, 1);
        assert!(common::is_regular_mode(a.mode));
        assert!(!a.is_dir);
    }

    #[tokio::test]
    async fn open_flags_create_excl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        let flags = libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL;

        open_options(flags, 0o640).open(&path).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        // A second O_EXCL open of the same path must collide.
        let err = open_options(flags, 0o640).open(&path).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn open_flags_plain_write() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, b"content").unwrap();

        // O_WRONLY without O_TRUNC leaves existing bytes in place.
        open_options(libc::O_WRONLY, 0o666).open(&path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"content");
    }
}
