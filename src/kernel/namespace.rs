/// Network namespace isolation for sandboxed programs
///
/// A compiled program gets a fresh network namespace holding only a loopback
/// interface. Unprivileged services pair it with a user namespace, which is
/// what lets an ordinary user create the network namespace at all.
use crate::config::types::{Result, SandboxError};
use nix::sched::{unshare, CloneFlags};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkIsolation {
    Disabled,
    /// CLONE_NEWNET alone (service runs as root)
    Network,
    /// CLONE_NEWUSER | CLONE_NEWNET
    UserAndNetwork,
}

impl NetworkIsolation {
    pub(crate) fn flags(self) -> CloneFlags {
        match self {
            NetworkIsolation::Disabled => CloneFlags::empty(),
            NetworkIsolation::Network => CloneFlags::CLONE_NEWNET,
            NetworkIsolation::UserAndNetwork => CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET,
        }
    }

    /// Mode matching the current privileges
    pub fn for_current_user() -> Self {
        if nix::unistd::geteuid().is_root() {
            NetworkIsolation::Network
        } else {
            NetworkIsolation::UserAndNetwork
        }
    }

    /// Check the mode works on this host by launching `/bin/true` inside it
    pub fn probe(self) -> Result<()> {
        if self == NetworkIsolation::Disabled {
            return Ok(());
        }
        let mut command = Command::new("/bin/true");
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            command.pre_exec(move || self.enter());
        }
        let status = command.status().map_err(|e| {
            SandboxError::Provisioning(format!("network namespace unavailable: {}", e))
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(SandboxError::Provisioning(format!(
                "network namespace probe exited with {}",
                status
            )))
        }
    }

    /// Enter the namespaces. Runs in the forked child: no allocation, no
    /// logging. A loopback that cannot be raised is tolerated.
    pub fn enter(self) -> std::io::Result<()> {
        let flags = self.flags();
        if flags.is_empty() {
            return Ok(());
        }
        unshare(flags)?;
        bring_up_loopback();
        Ok(())
    }
}

pub(crate) fn bring_up_loopback() {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return;
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (idx, b) in b"lo\0".iter().enumerate() {
        ifr.ifr_name[idx] = *b as libc::c_char;
    }

    unsafe {
        if libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut ifr) == 0 {
            let flags = ifr.ifr_ifru.ifru_flags as libc::c_int | libc::IFF_UP;
            ifr.ifr_ifru.ifru_flags = flags as libc::c_short;
            libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &ifr);
        }
        libc::close(sock);
    }
}
