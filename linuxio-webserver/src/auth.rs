//! Out-of-band invocation of the setuid auth helper.
//!
//! The helper is exec'd with no arguments; credentials go down a private
//! pipe on fd 3 (username line, password line, empty sentinel line) and
//! the identity record comes back on fd 4 as one length-prefixed record.
//! Exit codes 1-4 map onto the typed failures.

use std::io::Write as _;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd};
use std::time::Duration;

use anyhow::Context as _;
use bytes::Buf as _;
use camino::{Utf8Path, Utf8PathBuf};
use linuxio_proto::{ErrorKind, Record};
use tokio::io::AsyncReadExt as _;
use zeroize::Zeroizing;

const AUTH_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the helper reports for an authenticated user.
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: Utf8PathBuf,
    pub primary_group: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("username or password rejected")]
    BadCredentials,
    #[error("account locked by host policy")]
    AccountLocked,
    #[error("PAM failure")]
    Pam,
    #[error("auth helper internal error")]
    Internal,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::BadCredentials => ErrorKind::BadCredentials,
            AuthError::AccountLocked => ErrorKind::AccountLocked,
            AuthError::Pam => ErrorKind::PamError,
            AuthError::Internal | AuthError::Other(_) => ErrorKind::Internal,
        }
    }

    fn from_exit_code(code: i32) -> Self {
        match code {
            1 => AuthError::BadCredentials,
            2 => AuthError::AccountLocked,
            3 => AuthError::Pam,
            _ => AuthError::Internal,
        }
    }
}

pub(crate) fn create_pipe() -> anyhow::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];

    // SAFETY: fds points at a live two-element array; O_CLOEXEC keeps the
    // raw ends out of any other child we spawn concurrently.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("pipe2");
    }

    // SAFETY: both fds were just returned by pipe2 and are owned by no one else.
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    // SAFETY: same as above.
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    Ok((read, write))
}

/// Runs the helper once and returns the resolved identity.
pub async fn authenticate(helper: &Utf8Path, username: &str, password: &str) -> Result<Identity, AuthError> {
    if username.contains('\n') || password.contains('\n') {
        return Err(AuthError::BadCredentials);
    }

    let (input_read, input_write) = create_pipe()?;
    let (output_read, output_write) = create_pipe()?;

    let input_fd = input_read.as_raw_fd();
    let output_fd = output_write.as_raw_fd();

    let mut command = tokio::process::Command::new(helper.as_std_path());
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let set_up_fds = move || {
        // SAFETY: dup2 is async-signal-safe; target fds 3 and 4 are ours
        // to overwrite in the fresh child. dup2 clears O_CLOEXEC on the
        // duplicates so they survive the exec.
        if unsafe { libc::dup2(input_fd, 3) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: same as above.
        if unsafe { libc::dup2(output_fd, 4) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    };

    // SAFETY: the hook only performs async-signal-safe calls; the source
    // fds stay open in the parent until after spawn below.
    unsafe {
        command.pre_exec(set_up_fds);
    }

    let mut child = command.spawn().context("couldn't spawn auth helper")?;

    // The child holds its own duplicates now.
    drop(input_read);
    drop(output_write);

    // Credentials: two newline-terminated records and an empty sentinel
    // line. The buffer is zeroed on drop.
    {
        let mut payload = Zeroizing::new(Vec::with_capacity(username.len() + password.len() + 3));
        payload.extend_from_slice(username.as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(password.as_bytes());
        payload.push(b'\n');
        payload.push(b'\n');

        let mut input = std::fs::File::from(input_write);
        input
            .write_all(&payload)
            .and_then(|()| input.flush())
            .context("couldn't write credentials to auth helper")?;
        // Dropping the write end gives the helper its EOF.
    }

    let output_task = tokio::task::spawn_blocking(move || {
        use std::io::Read as _;
        let mut output = std::fs::File::from(output_read);
        let mut raw = Vec::new();
        output.read_to_end(&mut raw).map(|_| raw)
    });

    let mut stderr = child.stderr.take().context("helper stderr not piped")?;

    let status = tokio::time::timeout(AUTH_EXCHANGE_TIMEOUT, child.wait())
        .await
        .map_err(|_| {
            // A stuck helper must not pin the login request forever.
            anyhow::anyhow!("auth helper did not exit in time")
        })?
        .context("couldn't wait for auth helper")?;

    let mut error_line = String::new();
    let _ = stderr.read_to_string(&mut error_line).await;

    if !status.success() {
        let error = status.code().map_or(AuthError::Internal, AuthError::from_exit_code);
        debug!(code = ?status.code(), detail = %error_line.trim(), "Auth helper refused");
        return Err(error);
    }

    let raw = output_task
        .await
        .context("output reader task failed")?
        .context("couldn't read auth helper output")?;

    parse_identity(&raw).map_err(AuthError::Other)
}

fn parse_identity(raw: &[u8]) -> anyhow::Result<Identity> {
    anyhow::ensure!(raw.len() >= 4, "helper output too short");

    let mut bytes = linuxio_proto::Bytes::copy_from_slice(raw);
    let announced = bytes.get_u32() as usize;
    anyhow::ensure!(announced == bytes.len(), "helper output length mismatch");

    let record = Record::decode(&mut bytes).context("malformed identity record")?;

    let username = record.get_str("username").context("identity: username missing")?;
    let uid = record.get_u64("uid").context("identity: uid missing")?;
    let gid = record.get_u64("gid").context("identity: gid missing")?;
    let home = record.get_str("home").context("identity: home missing")?;
    let primary_group = record.get_str("group").context("identity: group missing")?;

    Ok(Identity {
        username: username.to_owned(),
        uid: u32::try_from(uid).context("identity: uid out of range")?,
        gid: u32::try_from(gid).context("identity: gid out of range")?,
        home: Utf8PathBuf::from(home),
        primary_group: primary_group.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use linuxio_proto::{BytesMut, Value};
    use smol_str::SmolStr;

    fn encode_identity() -> Vec<u8> {
        let record = Record::new()
            .with("username", Value::Str(SmolStr::new("alice")))
            .with("uid", Value::U64(1000))
            .with("gid", Value::U64(1000))
            .with("home", Value::Str(SmolStr::new("/home/alice")))
            .with("group", Value::Str(SmolStr::new("alice")));

        let mut body = BytesMut::new();
        record.encode(&mut body).unwrap();

        let mut raw = Vec::new();
        raw.extend_from_slice(&u32::try_from(body.len()).unwrap().to_be_bytes());
        raw.extend_from_slice(&body);
        raw
    }

    #[test]
    fn identity_record_parses() {
        let identity = parse_identity(&encode_identity()).unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.uid, 1000);
        assert_eq!(identity.home, Utf8PathBuf::from("/home/alice"));
    }

    #[test]
    fn truncated_identity_is_rejected() {
        let mut raw = encode_identity();
        raw.truncate(raw.len() - 2);
        assert!(parse_identity(&raw).is_err());
    }

    #[test]
    fn exit_codes_map_to_kinds() {
        assert!(matches!(AuthError::from_exit_code(1), AuthError::BadCredentials));
        assert!(matches!(AuthError::from_exit_code(2), AuthError::AccountLocked));
        assert!(matches!(AuthError::from_exit_code(3), AuthError::Pam));
        assert!(matches!(AuthError::from_exit_code(4), AuthError::Internal));
        assert_eq!(AuthError::from_exit_code(2).kind(), ErrorKind::AccountLocked);
    }
}
