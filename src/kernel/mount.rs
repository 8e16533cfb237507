//! Private root filesystem and PID namespace for sandboxed commands.
//!
//! A jailed command starts in fresh mount, PID, IPC and UTS namespaces, plus
//! a user namespace when the service is unprivileged. Its root is a small
//! read-only tmpfs holding read-only binds of the host system directories and
//! the toolchain, a few device nodes, and writable binds of the context's own
//! directories at their host paths. Host paths therefore stay valid for the
//! command while the rest of the host disappears.
//!
//! Everything the child needs is prepared in [`JailPlan`] by the parent; the
//! forked side only issues raw syscalls. Between fork and exec the child
//! splits into three processes:
//!
//! ```text
//! supervisor  (host PID namespace)  waits for init, mirrors the program status
//!   init      (PID 1)               builds the root, reaps, reports the status
//!     program (PID 2)               joins the cgroup, drops credentials, execs
//! ```
//!
//! When init exits the kernel kills whatever the program left behind.

use crate::config::types::{Result, SandboxError};
use crate::kernel::namespace::{bring_up_loopback, NetworkIsolation};
use crate::kernel::rlimits::RlimitPlan;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::statvfs::{statvfs, FsFlags};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Directory inside a context root where the jail's root is assembled
pub const JAIL_DIR: &str = ".jail";

/// Device nodes bound into every jail
const DEVICES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
];

const ROOT_TMPFS_OPTIONS: &[u8] = b"size=1m,mode=0755\0";
/// Supervisor exit code when init vanished without reporting
const STATUS_LOST: libc::c_int = 125;
/// Highest descriptor closed by hand when `close_range` is unavailable
const FALLBACK_FD_LIMIT: libc::c_uint = 4096;

/// Jail settings shared by every command of a backend
#[derive(Clone, Debug)]
pub struct Jail {
    readonly: Vec<PathBuf>,
    devices: Vec<PathBuf>,
    credentials: Option<(u32, u32)>,
    user_namespace: bool,
}

impl Jail {
    /// A root service drops jailed commands to `uid`/`gid`; an unprivileged
    /// one gets its rights through a user namespace instead.
    pub fn new(readonly: &[PathBuf], uid: u32, gid: u32) -> Self {
        let privileged = nix::unistd::geteuid().is_root();
        Self {
            readonly: normalize_paths(readonly),
            devices: DEVICES
                .iter()
                .map(PathBuf::from)
                .filter(|p| p.exists())
                .collect(),
            credentials: privileged.then_some((uid, gid)),
            user_namespace: !privileged,
        }
    }

    /// Host paths visible read-only inside the jail
    pub fn readonly_paths(&self) -> &[PathBuf] {
        &self.readonly
    }

    /// Owner the writable context directories need so the dropped
    /// credentials can use them
    pub fn owner(&self) -> Option<(u32, u32)> {
        self.credentials
    }

    /// Prepare the syscalls for one command. `writable` directories are bound
    /// read-write at their own paths; `workdir` is entered before exec.
    pub fn plan(
        &self,
        context_root: &Path,
        writable: &[PathBuf],
        workdir: &Path,
        cgroup_procs: Option<&Path>,
        network: NetworkIsolation,
    ) -> Result<JailPlan> {
        let root = context_root.join(JAIL_DIR);

        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS
            | network.flags();
        if self.user_namespace {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        let id_maps = flags
            .contains(CloneFlags::CLONE_NEWUSER)
            .then(IdMaps::identity);

        let mut mounts = Vec::new();
        for path in &self.readonly {
            let remount = libc::MS_REMOUNT
                | libc::MS_BIND
                | libc::MS_RDONLY
                | libc::MS_NOSUID
                | libc::MS_NODEV
                | locked_flags(path);
            mounts.push(BindMount::new(&root, path, Some(remount))?);
        }
        for device in &self.devices {
            mounts.push(BindMount::new(&root, device, None)?);
        }
        for dir in writable {
            mounts.push(BindMount::new(&root, dir, None)?);
        }

        Ok(JailPlan {
            flags,
            id_maps,
            proc_dir: c_path(&root.join("proc"))?,
            root: c_path(&root)?,
            mounts,
            workdir: c_path(workdir)?,
            cgroup_procs: cgroup_procs.map(c_path).transpose()?,
            credentials: self.credentials,
        })
    }
}

/// Absolute, existing, outside `/proc`, and not nested in another entry
fn normalize_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = paths
        .iter()
        .filter(|p| p.is_absolute() && p.exists())
        .filter(|p| p.parent().is_some() && !p.starts_with("/proc"))
        .cloned()
        .collect();
    candidates.sort_by_key(|p| p.components().count());
    let mut kept: Vec<PathBuf> = Vec::new();
    for path in candidates {
        if !kept.iter().any(|k| path.starts_with(k)) {
            kept.push(path);
        }
    }
    kept
}

/// Per-mount flags a bind remount inside a user namespace must keep
fn locked_flags(path: &Path) -> libc::c_ulong {
    let Ok(stat) = statvfs(path) else {
        return 0;
    };
    let flags = stat.flags();
    [
        (FsFlags::ST_NOSUID, libc::MS_NOSUID),
        (FsFlags::ST_NODEV, libc::MS_NODEV),
        (FsFlags::ST_NOEXEC, libc::MS_NOEXEC),
        (FsFlags::ST_NOATIME, libc::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, libc::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, libc::MS_RELATIME),
    ]
    .into_iter()
    .filter(|(st, _)| flags.contains(*st))
    .fold(0, |acc, (_, ms)| acc | ms)
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        SandboxError::Infrastructure(format!("path contains NUL: {}", path.display()))
    })
}

/// `/proc/self/{uid,gid}_map` contents mapping the service's own ids
#[derive(Debug)]
struct IdMaps {
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl IdMaps {
    fn identity() -> Self {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        Self {
            uid_map: format!("{} {} 1\n", uid, uid).into_bytes(),
            gid_map: format!("{} {} 1\n", gid, gid).into_bytes(),
        }
    }

    fn write(&self) -> io::Result<()> {
        write_file(b"/proc/self/setgroups\0", b"deny")?;
        write_file(b"/proc/self/uid_map\0", &self.uid_map)?;
        write_file(b"/proc/self/gid_map\0", &self.gid_map)
    }
}

#[derive(Debug)]
struct BindMount {
    source: CString,
    /// Missing ancestors of `target` inside the jail root, outermost first
    parents: Vec<CString>,
    target: CString,
    is_file: bool,
    remount: Option<libc::c_ulong>,
}

impl BindMount {
    fn new(root: &Path, source: &Path, remount: Option<libc::c_ulong>) -> Result<Self> {
        let mut target = root.to_path_buf();
        let mut parents = Vec::new();
        let parts: Vec<Component<'_>> = source
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        for (idx, part) in parts.iter().enumerate() {
            target.push(part);
            if idx + 1 < parts.len() {
                parents.push(c_path(&target)?);
            }
        }
        Ok(Self {
            source: c_path(source)?,
            parents,
            target: c_path(&target)?,
            is_file: !source.is_dir(),
            remount,
        })
    }

    fn apply(&self) -> io::Result<()> {
        for dir in &self.parents {
            make_dir(dir)?;
        }
        if self.is_file {
            touch(&self.target)?;
        } else {
            make_dir(&self.target)?;
        }
        mount(
            Some(&self.source),
            &self.target,
            None,
            libc::MS_BIND | libc::MS_REC,
            None,
        )?;
        if let Some(flags) = self.remount {
            mount(None, &self.target, None, flags, None)?;
        }
        Ok(())
    }
}

/// Syscalls for one jailed command, prepared before fork
#[derive(Debug)]
pub struct JailPlan {
    flags: CloneFlags,
    id_maps: Option<IdMaps>,
    root: CString,
    proc_dir: CString,
    mounts: Vec<BindMount>,
    workdir: CString,
    cgroup_procs: Option<CString>,
    credentials: Option<(u32, u32)>,
}

impl JailPlan {
    /// Runs in the forked child after `setsid`. Returns only in the program
    /// process; the supervisor and init never come back.
    pub fn enter(&self, rlimits: RlimitPlan) -> io::Result<()> {
        unshare(self.flags)?;
        if let Some(maps) = &self.id_maps {
            maps.write()?;
        }
        if self.flags.contains(CloneFlags::CLONE_NEWNET) {
            bring_up_loopback();
        }

        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let [status_read, status_write] = fds;

        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                unsafe { libc::close(status_read) };
                self.init(status_write, rlimits)
            }
            init => supervise(init, status_read),
        }
    }

    fn init(&self, status_write: libc::c_int, rlimits: RlimitPlan) -> io::Result<()> {
        if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // The cgroup tree is out of reach once the root moves.
        let cgroup = match &self.cgroup_procs {
            Some(path) => {
                let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Some(fd)
            }
            None => None,
        };
        self.build_root()?;
        if unsafe { libc::chdir(self.workdir.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                if let Some(fd) = cgroup {
                    let written = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
                    if written != 1 {
                        return Err(io::Error::last_os_error());
                    }
                    unsafe { libc::close(fd) };
                }
                if let Some((uid, gid)) = self.credentials {
                    drop_credentials(uid, gid)?;
                }
                if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
                    return Err(io::Error::last_os_error());
                }
                rlimits.apply()
            }
            program => reap(program, status_write),
        }
    }

    fn build_root(&self) -> io::Result<()> {
        mount(
            None,
            c"/",
            None,
            libc::MS_REC | libc::MS_PRIVATE,
            None,
        )?;
        mount(
            Some(c"tmpfs"),
            &self.root,
            Some(c"tmpfs"),
            libc::MS_NOSUID | libc::MS_NODEV,
            Some(ROOT_TMPFS_OPTIONS),
        )?;
        for bind in &self.mounts {
            bind.apply()?;
        }
        // A PID namespace without /proc still works; some hosts mask it.
        if make_dir(&self.proc_dir).is_ok() {
            let _ = mount(
                Some(c"proc"),
                &self.proc_dir,
                Some(c"proc"),
                libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
                None,
            );
        }
        mount(
            None,
            &self.root,
            None,
            libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV,
            None,
        )?;

        unsafe {
            if libc::chdir(self.root.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            let dot = c".".as_ptr();
            if libc::syscall(libc::SYS_pivot_root, dot, dot) == 0 {
                if libc::umount2(dot, libc::MNT_DETACH) != 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::chroot(dot) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::chdir(c"/".as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

fn mount(
    source: Option<&std::ffi::CStr>,
    target: &std::ffi::CStr,
    fstype: Option<&std::ffi::CStr>,
    flags: libc::c_ulong,
    data: Option<&[u8]>,
) -> io::Result<()> {
    let rc = unsafe {
        libc::mount(
            source.map_or(std::ptr::null(), |s| s.as_ptr()),
            target.as_ptr(),
            fstype.map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            data.map_or(std::ptr::null(), |d| d.as_ptr().cast()),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn make_dir(path: &std::ffi::CStr) -> io::Result<()> {
    if unsafe { libc::mkdir(path.as_ptr(), 0o755) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    Ok(())
}

fn touch(path: &std::ffi::CStr) -> io::Result<()> {
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::close(fd) };
    Ok(())
}

/// `path` must be NUL-terminated
fn write_file(path: &[u8], content: &[u8]) -> io::Result<()> {
    let fd = unsafe { libc::open(path.as_ptr().cast(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = unsafe { libc::write(fd, content.as_ptr().cast(), content.len()) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if written != content.len() as isize {
        return Err(err);
    }
    Ok(())
}

/// Supplementary groups first, then gid, then uid
fn drop_credentials(uid: u32, gid: u32) -> io::Result<()> {
    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setresgid(gid, gid, gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setresuid(uid, uid, uid) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn interrupted() -> bool {
    io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
}

/// Close every descriptor except `keep`
fn close_all_except(keep: libc::c_int) {
    let keep = keep as libc::c_uint;
    if keep > 0 {
        close_range(0, keep - 1);
    }
    close_range(keep + 1, libc::c_uint::MAX);
}

fn close_range(first: libc::c_uint, last: libc::c_uint) {
    let rc = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0 as libc::c_uint) };
    if rc != 0 {
        for fd in first..=last.min(FALLBACK_FD_LIMIT) {
            unsafe { libc::close(fd as libc::c_int) };
        }
    }
}

/// Init: reap everything, report the program's wait status, exit
fn reap(program: libc::pid_t, status_write: libc::c_int) -> ! {
    close_all_except(status_write);
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid == program {
            let bytes = status.to_ne_bytes();
            unsafe {
                libc::write(status_write, bytes.as_ptr().cast(), bytes.len());
                libc::_exit(0)
            }
        }
        if pid < 0 && !interrupted() {
            unsafe { libc::_exit(STATUS_LOST) }
        }
    }
}

/// Supervisor: wait for init and leave the way the program left
fn supervise(init: libc::pid_t, status_read: libc::c_int) -> ! {
    close_all_except(status_read);

    let mut bytes = [0u8; 4];
    let mut filled = 0;
    while filled < bytes.len() {
        let n = unsafe {
            libc::read(
                status_read,
                bytes[filled..].as_mut_ptr().cast(),
                bytes.len() - filled,
            )
        };
        if n > 0 {
            filled += n as usize;
        } else if n == 0 || !interrupted() {
            break;
        }
    }

    let mut init_status: libc::c_int = 0;
    while unsafe { libc::waitpid(init, &mut init_status, 0) } < 0 && interrupted() {}

    if filled == bytes.len() {
        mirror(libc::c_int::from_ne_bytes(bytes))
    } else {
        mirror(init_status)
    }
}

fn mirror(status: libc::c_int) -> ! {
    if libc::WIFEXITED(status) {
        unsafe { libc::_exit(libc::WEXITSTATUS(status)) }
    }
    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        let _ = setrlimit(Resource::RLIMIT_CORE, 0, 0);
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
            libc::kill(libc::getpid(), signal);
            libc::_exit(128 + signal)
        }
    }
    unsafe { libc::_exit(STATUS_LOST) }
}
