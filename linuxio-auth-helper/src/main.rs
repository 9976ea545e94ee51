//! Setuid gate between the unprivileged webserver and the host credential
//! database.
//!
//! Invocation contract: no arguments. Credentials arrive on fd 3 as two
//! newline-terminated records (username, password) followed by an empty
//! sentinel line. On success the resolved identity goes to fd 4 as one
//! length-prefixed record and the process exits 0. On failure a kind goes
//! to stderr and the exit code maps it: 1 BadCredentials, 2 AccountLocked,
//! 3 PamError, 4 Internal.
//!
//! The password buffer is zeroed before exit and credentials are never
//! read from the environment.

use std::ffi::CStr;
use std::fmt;
use std::io::{BufRead as _, BufReader, Write as _};
use std::os::fd::{FromRawFd as _, RawFd};

use linuxio_proto::{BytesMut, Record, Value};
use zeroize::Zeroizing;

const CREDENTIALS_FD: RawFd = 3;
const RESULT_FD: RawFd = 4;

/// PAM service file the host administrator installs for LinuxIO.
const PAM_SERVICE: &str = "linuxio";

/// Account the webserver daemon runs as; only it may invoke this gate.
const SERVICE_ACCOUNT: &str = match option_env!("LINUXIO_SERVICE_ACCOUNT") {
    Some(account) => account,
    None => "linuxio",
};

enum Failure {
    BadCredentials,
    AccountLocked,
    Pam,
    Internal,
}

impl Failure {
    fn exit_code(&self) -> i32 {
        match self {
            Failure::BadCredentials => 1,
            Failure::AccountLocked => 2,
            Failure::Pam => 3,
            Failure::Internal => 4,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Failure::BadCredentials => "BadCredentials",
            Failure::AccountLocked => "AccountLocked",
            Failure::Pam => "PamError",
            Failure::Internal => "Internal",
        };
        f.write_str(kind)
    }
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(failure) => {
            eprintln!("{failure}");
            failure.exit_code()
        }
    };

    std::process::exit(code);
}

fn run() -> Result<(), Failure> {
    // Before any I/O: only the service account gets to use this gate. The
    // real uid survives the setuid bit, so it identifies the invoker.
    enforce_invoker()?;

    let (username, password) = read_credentials()?;

    check_credentials(&username, &password)?;
    drop(password); // zeroed on drop

    let identity = lookup_identity(&username).ok_or(Failure::Internal)?;

    write_identity(&identity).map_err(|_| Failure::Internal)
}

fn enforce_invoker() -> Result<(), Failure> {
    // SAFETY: getuid has no preconditions.
    let invoker = unsafe { libc::getuid() };
    // SAFETY: geteuid has no preconditions.
    let effective = unsafe { libc::geteuid() };

    if effective != 0 {
        // Not installed setuid: nothing privileged can happen anyway, so
        // development invocations pass through.
        return Ok(());
    }

    let service_uid = resolve_uid(SERVICE_ACCOUNT).ok_or(Failure::Internal)?;
    if invoker == service_uid {
        Ok(())
    } else {
        Err(Failure::Internal)
    }
}

fn read_credentials() -> Result<(String, Zeroizing<String>), Failure> {
    // SAFETY: fd 3 is inherited for our exclusive use per the invocation
    // contract.
    let input = unsafe { std::fs::File::from_raw_fd(CREDENTIALS_FD) };
    let mut reader = BufReader::new(input);

    let mut username = String::new();
    reader.read_line(&mut username).map_err(|_| Failure::Internal)?;
    let mut password = Zeroizing::new(String::new());
    reader.read_line(&mut password).map_err(|_| Failure::Internal)?;
    let mut sentinel = String::new();
    reader.read_line(&mut sentinel).map_err(|_| Failure::Internal)?;

    if sentinel != "\n" {
        return Err(Failure::Internal);
    }

    trim_newline(&mut username);
    trim_newline(&mut password);

    if username.is_empty() {
        return Err(Failure::BadCredentials);
    }

    Ok((username, password))
}

fn trim_newline(s: &mut String) {
    if s.ends_with('\n') {
        s.pop();
    }
}

fn check_credentials(username: &str, password: &str) -> Result<(), Failure> {
    let mut authenticator = pam::Authenticator::with_password(PAM_SERVICE).map_err(|_| Failure::Pam)?;
    authenticator.get_handler().set_credentials(username, password);

    match authenticator.authenticate() {
        Ok(()) => Ok(()),
        Err(error) => Err(classify_pam_failure(&error.to_string())),
    }
}

/// Best-effort mapping of the PAM return code (as rendered by the pam
/// crate) onto our failure taxonomy; anything unrecognized is a generic
/// PAM failure.
fn classify_pam_failure(rendered: &str) -> Failure {
    const BAD_CREDENTIALS: &[&str] = &["AUTH_ERR", "USER_UNKNOWN", "CRED_INSUFFICIENT", "MAXTRIES"];
    const LOCKED: &[&str] = &["ACCT_EXPIRED", "PERM_DENIED", "NEW_AUTHTOK_REQD", "AUTHTOK_EXPIRED", "CRED_EXPIRED"];

    if BAD_CREDENTIALS.iter().any(|needle| rendered.contains(needle)) {
        Failure::BadCredentials
    } else if LOCKED.iter().any(|needle| rendered.contains(needle)) {
        Failure::AccountLocked
    } else {
        Failure::Pam
    }
}

struct Identity {
    username: String,
    uid: u32,
    gid: u32,
    home: String,
    group: String,
}

fn resolve_uid(username: &str) -> Option<u32> {
    lookup_passwd(username).map(|(uid, _, _)| uid)
}

fn lookup_identity(username: &str) -> Option<Identity> {
    let (uid, gid, home) = lookup_passwd(username)?;
    let group = lookup_group_name(gid)?;

    Some(Identity {
        username: username.to_owned(),
        uid,
        gid,
        home,
        group,
    })
}

fn lookup_passwd(username: &str) -> Option<(u32, u32, String)> {
    let c_username = std::ffi::CString::new(username).ok()?;

    // SAFETY: passwd is plain old data; zeroed is a valid initial state.
    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buffer = vec![0u8; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: all pointers reference live buffers for the duration of the
    // call; getpwnam_r writes only within the provided buffer.
    let rc = unsafe {
        libc::getpwnam_r(
            c_username.as_ptr(),
            &mut passwd,
            buffer.as_mut_ptr().cast(),
            buffer.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        return None;
    }

    // SAFETY: on success pw_dir points at a NUL-terminated string inside
    // our buffer.
    let home = unsafe { CStr::from_ptr(passwd.pw_dir) }.to_str().ok()?.to_owned();

    Some((passwd.pw_uid, passwd.pw_gid, home))
}

fn lookup_group_name(gid: u32) -> Option<String> {
    // SAFETY: group is plain old data; zeroed is a valid initial state.
    let mut group: libc::group = unsafe { std::mem::zeroed() };
    let mut buffer = vec![0u8; 16 * 1024];
    let mut result: *mut libc::group = std::ptr::null_mut();

    // SAFETY: all pointers reference live buffers for the duration of the
    // call; getgrgid_r writes only within the provided buffer.
    let rc = unsafe { libc::getgrgid_r(gid, &mut group, buffer.as_mut_ptr().cast(), buffer.len(), &mut result) };

    if rc != 0 || result.is_null() {
        return None;
    }

    // SAFETY: on success gr_name points at a NUL-terminated string inside
    // our buffer.
    unsafe { CStr::from_ptr(group.gr_name) }.to_str().ok().map(str::to_owned)
}

fn encode_identity(identity: &Identity) -> Result<Vec<u8>, linuxio_proto::Error> {
    let record = Record::new()
        .with("username", Value::Str(identity.username.as_str().into()))
        .with("uid", Value::U64(u64::from(identity.uid)))
        .with("gid", Value::U64(u64::from(identity.gid)))
        .with("home", Value::Str(identity.home.as_str().into()))
        .with("group", Value::Str(identity.group.as_str().into()));

    let mut body = BytesMut::new();
    record.encode(&mut body)?;

    let mut raw = Vec::with_capacity(4 + body.len());
    raw.extend_from_slice(&u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes());
    raw.extend_from_slice(&body);
    Ok(raw)
}

fn write_identity(identity: &Identity) -> std::io::Result<()> {
    let raw = encode_identity(identity).map_err(std::io::Error::other)?;

    // SAFETY: fd 4 is inherited for our exclusive use per the invocation
    // contract.
    let mut output = unsafe { std::fs::File::from_raw_fd(RESULT_FD) };
    output.write_all(&raw)?;
    output.flush()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn identity_record_round_trips() {
        let identity = Identity {
            username: "alice".to_owned(),
            uid: 1000,
            gid: 1000,
            home: "/home/alice".to_owned(),
            group: "alice".to_owned(),
        };

        let raw = encode_identity(&identity).unwrap();

        let mut bytes = linuxio_proto::Bytes::copy_from_slice(&raw[4..]);
        let record = Record::decode(&mut bytes).unwrap();

        assert_eq!(record.get_str("username"), Some("alice"));
        assert_eq!(record.get_u64("uid"), Some(1000));
        assert_eq!(record.get_str("home"), Some("/home/alice"));
        assert_eq!(record.get_str("group"), Some("alice"));
    }

    #[test]
    fn root_identity_resolves() {
        let identity = lookup_identity("root").unwrap();
        assert_eq!(identity.uid, 0);
        assert!(!identity.group.is_empty());
    }

    #[test]
    fn pam_failure_classification() {
        assert!(matches!(classify_pam_failure("AUTH_ERR"), Failure::BadCredentials));
        assert!(matches!(classify_pam_failure("USER_UNKNOWN"), Failure::BadCredentials));
        assert!(matches!(classify_pam_failure("ACCT_EXPIRED"), Failure::AccountLocked));
        assert!(matches!(classify_pam_failure("SERVICE_ERR"), Failure::Pam));
        assert!(matches!(classify_pam_failure("something else"), Failure::Pam));
    }
}
