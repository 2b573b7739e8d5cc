//! Caller identity from the kernel's view of a socket peer.

use elevate_contracts::Identity;
use std::io;
use tokio::net::UnixStream;
use tracing::debug;

/// Identity of the process on the other end of `stream`.
///
/// Only peer credentials are trusted. Session id and group names are looked
/// up from the peer's pid and uid; lookups that fail leave them empty.
pub fn peer_identity(stream: &UnixStream) -> io::Result<Identity> {
    let cred = stream.peer_cred()?;
    let mut identity = Identity::new(cred.uid(), cred.gid());
    if let Some(pid) = cred.pid() {
        identity = identity.with_pid(pid);
        if let Some(session) = session_of(pid) {
            identity = identity.with_session(session);
        }
    }
    Ok(identity.with_groups(group_names(cred.uid(), cred.gid())))
}

/// Identity of a local user looked up by uid, for evaluating policy
/// without a connection.
pub fn user_identity(uid: u32) -> Identity {
    use nix::unistd::{Uid, User, getgid};
    let gid = match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.gid.as_raw(),
        _ => getgid().as_raw(),
    };
    Identity::new(uid, gid).with_groups(group_names(uid, gid))
}

fn session_of(pid: i32) -> Option<u32> {
    use nix::unistd::{Pid, getsid};
    match getsid(Some(Pid::from_raw(pid))) {
        Ok(sid) => u32::try_from(sid.as_raw()).ok(),
        Err(err) => {
            debug!(pid, error = %err, "Could not read peer session id");
            None
        }
    }
}

#[cfg(target_os = "linux")]
fn group_names(uid: u32, gid: u32) -> Vec<String> {
    use nix::unistd::{Gid, Group, Uid, User, getgrouplist};
    use std::ffi::CString;

    let gids = match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => CString::new(user.name)
            .ok()
            .and_then(|name| getgrouplist(&name, Gid::from_raw(gid)).ok())
            .unwrap_or_else(|| vec![Gid::from_raw(gid)]),
        _ => vec![Gid::from_raw(gid)],
    };
    let mut names: Vec<String> = gids
        .into_iter()
        .filter_map(|gid| Group::from_gid(gid).ok().flatten())
        .map(|group| group.name)
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(not(target_os = "linux"))]
fn group_names(_uid: u32, gid: u32) -> Vec<String> {
    use nix::unistd::{Gid, Group};
    Group::from_gid(Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|group| vec![group.name])
        .unwrap_or_default()
}
