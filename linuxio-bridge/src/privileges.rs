//! Credential drop performed once at startup, before the accept loop.

use anyhow::Context as _;

/// Drops to the target identity: clears supplementary groups, then
/// `setgid`, then `setuid`, then verifies the drop held.
///
/// Running already as the target user (development setups without the
/// setuid bit) is accepted as-is.
pub fn drop_privileges(uid: u32, gid: u32) -> anyhow::Result<()> {
    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::ensure!(
            euid == uid,
            "running neither as root nor as the target user (euid {euid}, want {uid})"
        );
        return Ok(());
    }

    // SAFETY: an empty list is the documented way to clear supplementary groups.
    let rc = unsafe { libc::setgroups(0, std::ptr::null()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("setgroups");
    }

    // SAFETY: no pointer arguments.
    let rc = unsafe { libc::setgid(gid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("setgid");
    }

    // SAFETY: no pointer arguments.
    let rc = unsafe { libc::setuid(uid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("setuid");
    }

    verify_drop(uid, gid)
}

/// The drop must be effective and irreversible.
pub fn verify_drop(uid: u32, gid: u32) -> anyhow::Result<()> {
    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    // SAFETY: getegid has no preconditions.
    let egid = unsafe { libc::getegid() };

    anyhow::ensure!(
        euid == uid && egid == gid,
        "identity after drop is {euid}:{egid}, expected {uid}:{gid}"
    );

    if uid != 0 {
        // SAFETY: no pointer arguments; failure is the expected outcome.
        let rc = unsafe { libc::setuid(0) };
        anyhow::ensure!(rc != 0, "privilege drop is reversible, refusing to serve");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_to_current_identity_is_accepted() {
        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };
        // SAFETY: getgid has no preconditions.
        let gid = unsafe { libc::getgid() };

        // Not running as root in the test environment: the development
        // path must accept the current identity and reject others.
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } != 0 {
            drop_privileges(uid, gid).expect("current identity accepted");
            assert!(drop_privileges(uid.wrapping_add(1), gid).is_err());
        } else {
            verify_drop(0, 0).expect("root stays root until it drops");
        }
    }
}
