//! Socket credential acquisition.
//!
//! Identity comes from `SO_PEERCRED`; the LSM label from `SO_PEERSEC`
//! when the kernel provides one; auxiliary groups from `SO_PEERGROUPS`,
//! falling back to the NSS resolver on kernels without the option. The
//! fallback is racy against concurrent account changes; it is logged once
//! and tolerated.

use ferrobus_core::PeerCreds;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UnixStream;
use tracing::warn;

/// Reads the full credential set for an accepted connection.
///
/// Group resolution only runs when `needs_groups` is set (the policy
/// carries gid-scoped rules); everyone else gets the primary gid only.
pub fn peer_credentials(stream: &UnixStream, needs_groups: bool) -> io::Result<PeerCreds> {
    let cred = stream.peer_cred()?;
    let uid = cred.uid();
    let gid = cred.gid();
    let pid = cred.pid().unwrap_or_default().unsigned_abs();
    let fd = stream.as_raw_fd();

    let seclabel = peer_seclabel(fd)?;
    let gids = if needs_groups {
        peer_groups(fd, uid, gid)?
    } else {
        vec![gid]
    };

    Ok(PeerCreds {
        uid,
        gid,
        pid,
        gids,
        seclabel,
    })
}

/// `SO_PEERSEC`: the peer's LSM label, when one exists.
fn peer_seclabel(fd: RawFd) -> io::Result<Option<String>> {
    let mut buf = vec![0u8; 1024];
    loop {
        let mut len = buf.len() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERSEC,
                buf.as_mut_ptr().cast(),
                &mut len,
            )
        };
        if rc == 0 {
            buf.truncate(len as usize);
            while buf.last() == Some(&0) {
                buf.pop();
            }
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // No LSM attached to the socket.
            Some(libc::ENOPROTOOPT) | Some(libc::EINVAL) => return Ok(None),
            Some(libc::ERANGE) => buf.resize(len as usize + 1, 0),
            _ => return Err(err),
        }
    }
}

/// `SO_PEERGROUPS` with an NSS fallback.
fn peer_groups(fd: RawFd, uid: u32, gid: u32) -> io::Result<Vec<u32>> {
    match socket_groups(fd)? {
        Some(mut gids) => {
            if !gids.contains(&gid) {
                gids.insert(0, gid);
            }
            Ok(gids)
        }
        None => {
            static WARNED: AtomicBool = AtomicBool::new(false);
            if !WARNED.swap(true, Ordering::Relaxed) {
                warn!(
                    "SO_PEERGROUPS unavailable; resolving auxiliary groups \
                     via NSS, which races against concurrent account changes"
                );
            }
            Ok(resolver_groups(uid, gid))
        }
    }
}

fn socket_groups(fd: RawFd) -> io::Result<Option<Vec<u32>>> {
    let mut gids = vec![0u32; 32];
    loop {
        let mut len = (gids.len() * std::mem::size_of::<u32>()) as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERGROUPS,
                gids.as_mut_ptr().cast(),
                &mut len,
            )
        };
        if rc == 0 {
            gids.truncate(len as usize / std::mem::size_of::<u32>());
            return Ok(Some(gids));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOPROTOOPT) => return Ok(None),
            Some(libc::ERANGE) => {
                gids.resize(len as usize / std::mem::size_of::<u32>() + 1, 0);
            }
            _ => return Err(err),
        }
    }
}

/// NSS resolution of auxiliary groups; inherently racy, see module docs.
fn resolver_groups(uid: u32, gid: u32) -> Vec<u32> {
    use nix::unistd::{getgrouplist, Gid, Uid, User};

    let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid)) else {
        return vec![gid];
    };
    let Ok(name) = std::ffi::CString::new(user.name) else {
        return vec![gid];
    };
    match getgrouplist(&name, Gid::from_raw(gid)) {
        Ok(groups) => {
            let mut gids: Vec<u32> = groups.into_iter().map(Gid::as_raw).collect();
            if !gids.contains(&gid) {
                gids.insert(0, gid);
            }
            gids
        }
        Err(_) => vec![gid],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn credentials_of_a_local_pair() {
        let (left, _right) = UnixStream::pair().expect("socketpair");
        let creds = peer_credentials(&left, false).expect("credentials");
        assert_eq!(creds.uid, nix::unistd::Uid::current().as_raw());
        assert_eq!(creds.gids, vec![creds.gid]);
        assert_eq!(creds.pid, std::process::id());
    }

    #[tokio::test]
    async fn group_resolution_includes_primary_gid() {
        let (left, _right) = UnixStream::pair().expect("socketpair");
        let creds = peer_credentials(&left, true).expect("credentials");
        assert!(creds.gids.contains(&creds.gid));
    }
}
