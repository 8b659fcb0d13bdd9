//! Kernel peer identity for unix-socket connections, and the authorization
//! rule applied to it.
//!
//! The sockopt differs per platform: Linux returns a (pid, uid, gid) triple
//! from `SO_PEERCRED`; macOS returns (uid, groups) from `LOCAL_PEERCRED` and
//! the pid from a separate `LOCAL_PEERPID` lookup. The raw-fd borrow is the
//! only unsafe code in the crate and stays in this module.

use tokio::net::UnixStream;

/// Numeric gid of the service group on installs that pin it (macOS installer
/// creates the group with this id; Linux installs use whatever id the
/// distribution assigns).
pub const SERVICE_GROUP_GID: u32 = 850;

/// Credentials of a connected peer, valid for the connection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// Extracts peer credentials from the connection, or `None` when the kernel
/// lookup fails.
#[cfg(target_os = "linux")]
pub fn peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    use nix::sys::socket::{getsockopt, sockopt};
    use std::os::fd::{AsRawFd, BorrowedFd};

    // SAFETY: the stream outlives this borrow; the fd stays open for the
    // duration of the call.
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let cred = getsockopt(&fd, sockopt::PeerCredentials).ok()?;
    Some(PeerCredentials {
        uid: cred.uid(),
        gid: cred.gid(),
        pid: cred.pid(),
    })
}

#[cfg(target_os = "macos")]
pub fn peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();

    let mut xucred: libc::xucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::xucred>() as libc::socklen_t;
    // SAFETY: xucred and len are valid for the duration of the call; the
    // stream keeps the fd open.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERCRED,
            &mut xucred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 || xucred.cr_ngroups == 0 {
        return None;
    }

    // LOCAL_PEERCRED has no pid; ask for it separately.
    let mut pid: libc::pid_t = 0;
    let mut len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
    // SAFETY: pid and len are valid for the duration of the call.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            &mut pid as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        pid = 0;
    }

    Some(PeerCredentials {
        uid: xucred.cr_uid,
        gid: xucred.cr_groups[0],
        pid,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn peer_credentials(_stream: &UnixStream) -> Option<PeerCredentials> {
    None
}

/// Authorization rule: root, primary gid equal to the service group, or the
/// service group present in the peer's supplementary groups. Absent
/// credentials deny.
pub fn is_authorized(creds: Option<&PeerCredentials>, service_gid: u32) -> bool {
    let Some(creds) = creds else {
        return false;
    };
    if creds.uid == 0 {
        return true;
    }
    if creds.gid == service_gid {
        return true;
    }
    user_in_group(creds.uid, service_gid)
}

/// Resolves the user by uid and checks its group list for `gid`.
#[cfg(target_os = "linux")]
fn user_in_group(uid: u32, gid: u32) -> bool {
    use nix::unistd::{getgrouplist, Uid, User};
    use std::ffi::CString;

    let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid)) else {
        return false;
    };
    let Ok(name) = CString::new(user.name) else {
        return false;
    };
    match getgrouplist(&name, user.gid) {
        Ok(groups) => groups.iter().any(|g| g.as_raw() == gid),
        Err(_) => false,
    }
}

/// macOS has no reliable getgrouplist through the same path; check the group
/// database's member list instead.
#[cfg(not(target_os = "linux"))]
fn user_in_group(uid: u32, gid: u32) -> bool {
    use nix::unistd::{Gid, Uid, User};

    let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid)) else {
        return false;
    };
    match nix::unistd::Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.mem.iter().any(|member| *member == user.name),
        _ => false,
    }
}
