//! Symlink-safe removal of environment trees.
//!
//! Environment roots contain files written by untrusted programs, which may
//! have planted symlinks pointing anywhere on the host. Removal walks the
//! tree with `openat`/`fstatat`/`unlinkat` relative to directory descriptors
//! opened with `O_NOFOLLOW`, and never crosses a filesystem boundary.

use crate::config::types::{Result, SandboxError};
use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

struct DirFd(RawFd);

impl DirFd {
    fn raw(&self) -> RawFd {
        self.0
    }
}

impl Drop for DirFd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

const DIR_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW;

fn fs_error(what: &str, subject: impl std::fmt::Debug) -> SandboxError {
    SandboxError::Filesystem(format!(
        "{} failed for {:?}: {}",
        what,
        subject,
        std::io::Error::last_os_error()
    ))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        SandboxError::Filesystem(format!("path contains NUL byte: {}", path.display()))
    })
}

fn open_dir(path: &Path) -> Result<DirFd> {
    let path_c = c_path(path)?;
    let fd = unsafe { libc::open(path_c.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(fs_error("open", path));
    }
    Ok(DirFd(fd))
}

fn open_child_dir(parent: RawFd, name: &CStr) -> Result<DirFd> {
    let fd = unsafe { libc::openat(parent, name.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(fs_error("openat", name));
    }
    Ok(DirFd(fd))
}

fn lstat_at(parent: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            parent,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(fs_error("fstatat", name));
    }
    Ok(unsafe { st.assume_init() })
}

fn unlink_at(parent: RawFd, name: &CStr, flags: libc::c_int) -> Result<()> {
    let rc = unsafe { libc::unlinkat(parent, name.as_ptr(), flags) };
    if rc != 0 {
        return Err(fs_error("unlinkat", name));
    }
    Ok(())
}

/// Names in a directory, excluding `.` and `..`
fn list_entries(dir: RawFd) -> Result<Vec<CString>> {
    let iter_fd = unsafe { libc::dup(dir) };
    if iter_fd < 0 {
        return Err(fs_error("dup", dir));
    }
    let stream = unsafe { libc::fdopendir(iter_fd) };
    if stream.is_null() {
        unsafe {
            libc::close(iter_fd);
        }
        return Err(fs_error("fdopendir", dir));
    }

    let mut names = Vec::new();
    let outcome = loop {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(stream) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            break if errno != 0 {
                Err(SandboxError::Filesystem(format!(
                    "readdir failed: {}",
                    std::io::Error::from_raw_os_error(errno)
                )))
            } else {
                Ok(())
            };
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let bytes = name.to_bytes();
        if bytes != b"." && bytes != b".." {
            names.push(name.to_owned());
        }
    };
    unsafe {
        libc::closedir(stream);
    }
    outcome.map(|_| names)
}

fn empty_dir(dir: RawFd, device: libc::dev_t) -> Result<()> {
    for name in list_entries(dir)? {
        let st = lstat_at(dir, &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != device {
                return Err(SandboxError::Filesystem(format!(
                    "refusing to cross filesystem boundary at {:?}",
                    name
                )));
            }
            let child = open_child_dir(dir, &name)?;
            empty_dir(child.raw(), device)?;
            drop(child);
            unlink_at(dir, &name, libc::AT_REMOVEDIR)?;
        } else {
            unlink_at(dir, &name, 0)?;
        }
    }
    Ok(())
}

/// Remove `path` and everything below it. A missing path is not an error.
pub fn remove_tree(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }
    let parent = path.parent().ok_or_else(|| {
        SandboxError::Filesystem(format!("cannot remove {} without parent", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        SandboxError::Filesystem(format!("cannot remove {} without file name", path.display()))
    })?;
    let name = CString::new(name.as_bytes()).map_err(|_| {
        SandboxError::Filesystem(format!("path contains NUL byte: {}", path.display()))
    })?;

    let parent_fd = open_dir(parent)?;
    let st = lstat_at(parent_fd.raw(), &name)?;
    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        let dir = open_child_dir(parent_fd.raw(), &name)?;
        empty_dir(dir.raw(), st.st_dev)?;
        drop(dir);
        unlink_at(parent_fd.raw(), &name, libc::AT_REMOVEDIR)
    } else {
        unlink_at(parent_fd.raw(), &name, 0)
    }
}

/// Remove everything inside the directory `path`, keeping the directory.
pub fn clear_directory(path: &Path) -> Result<()> {
    let dir = open_dir(path)?;
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    if unsafe { libc::fstat(dir.raw(), st.as_mut_ptr()) } != 0 {
        return Err(fs_error("fstat", path));
    }
    let st = unsafe { st.assume_init() };
    empty_dir(dir.raw(), st.st_dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn remove_tree_deletes_nested_content() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("env");
        fs::create_dir_all(target.join("work/deep")).unwrap();
        fs::write(target.join("work/deep/file"), b"x").unwrap();

        remove_tree(&target).unwrap();
        assert!(!target.exists());
        // Second call is a no-op.
        remove_tree(&target).unwrap();
    }

    #[test]
    fn remove_tree_does_not_follow_symlinks() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("keep"), b"precious").unwrap();

        let target = root.path().join("env");
        fs::create_dir(&target).unwrap();
        std::os::unix::fs::symlink(outside.path(), target.join("escape")).unwrap();

        remove_tree(&target).unwrap();
        assert!(outside.path().join("keep").exists());
    }

    #[test]
    fn clear_directory_keeps_the_directory() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();
        fs::write(root.path().join("sub/a"), b"a").unwrap();
        fs::write(root.path().join("b"), b"b").unwrap();

        clear_directory(root.path()).unwrap();
        assert!(root.path().is_dir());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
