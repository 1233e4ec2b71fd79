//! Unix socket handoff: spawn with fd passing, inherit, notify parent.
//!
//! The replacement is a fresh process of the same executable with the same
//! arguments. It finds the listening socket at fd 3 and `MOLT_SPAWNED=1` in
//! its environment. Unlike an in-place exec, the old process keeps serving
//! until its child tells it to drain.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, info};

use crate::error::{InheritError, SpawnError};
use crate::handoff::{ChildHandle, Handoff, INHERITED_FD};
use crate::role::{SPAWNED_ENV, SPAWNED_ENV_VALUE};

/// [`Handoff`] for Linux and macOS.
///
/// By default spawns `std::env::current_exe()` with this process's
/// arguments. Both can be overridden.
#[derive(Debug, Clone, Default)]
pub struct UnixHandoff {
    program: Option<PathBuf>,
    args: Option<Vec<OsString>>,
}

impl UnixHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `program` instead of the current executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Pass `args` instead of this process's own arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }
}

impl Handoff for UnixHandoff {
    fn inherit_listener(&self) -> Result<std::net::TcpListener, InheritError> {
        let fd = INHERITED_FD;
        validate_listening_socket(fd)?;

        // SAFETY: fd 3 was validated as a listening socket and nothing else
        // in this process claims it.
        let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        set_cloexec(fd, true)?;
        listener.set_nonblocking(true)?;

        let addr = listener.local_addr().ok();
        info!(fd, addr = ?addr, "Inherited listener from parent process");
        Ok(listener)
    }

    fn spawn_child(&self, listener_fd: RawFd) -> Result<ChildHandle, SpawnError> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => current_program().map_err(SpawnError::CurrentExe)?,
        };
        let args = self
            .args
            .clone()
            .unwrap_or_else(|| std::env::args_os().skip(1).collect());

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .env(SPAWNED_ENV, SPAWNED_ENV_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: the hook runs between fork and exec and only calls
        // async-signal-safe functions (dup2, fcntl).
        unsafe {
            command.pre_exec(move || place_inherited_fd(listener_fd));
        }

        let mut child = command.spawn().map_err(|source| SpawnError::Launch {
            program: program.clone(),
            source,
        })?;

        let pid = child.id().unwrap_or_default();
        info!(
            pid,
            program = %program.display(),
            fd = listener_fd,
            "Spawned replacement process"
        );

        Ok(ChildHandle::new(pid, async move { child.wait().await }))
    }

    fn notify_parent(&self, parent_pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(parent_pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "parent pid out of range"))?;
        if pid <= 1 {
            // Reparented to init: the process that spawned us is gone.
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "parent process has already exited",
            ));
        }

        debug!(parent_pid, "Sending SIGTERM to parent process");
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Path to spawn the running executable from, even after an upgrade
/// replaced the file on disk.
fn current_program() -> io::Result<PathBuf> {
    std::env::current_exe().map(strip_deleted_suffix)
}

/// Linux reports `<path> (deleted)` once the running binary was unlinked or
/// renamed over. The replacement build lives at `<path>`.
fn strip_deleted_suffix(path: PathBuf) -> PathBuf {
    const DELETED: &[u8] = b" (deleted)";
    let stripped = path
        .as_os_str()
        .as_bytes()
        .strip_suffix(DELETED)
        .map(|bytes| PathBuf::from(OsStr::from_bytes(bytes)));
    stripped.unwrap_or(path)
}

/// Runs in the forked child: move the listener to fd 3 and make it survive exec.
fn place_inherited_fd(fd: RawFd) -> io::Result<()> {
    if fd == INHERITED_FD {
        // dup2 onto itself is a no-op that keeps CLOEXEC set.
        return set_cloexec(fd, false);
    }
    // SAFETY: dup2 on descriptors owned by this (forked) process.
    if unsafe { libc::dup2(fd, INHERITED_FD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor number; failure is reported via errno.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Check that `fd` is open, is a socket, and is listening.
fn validate_listening_socket(fd: RawFd) -> Result<(), InheritError> {
    // SAFETY: zeroed stat is a valid out-parameter for fstat.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        let err = io::Error::last_os_error();
        return Err(if err.raw_os_error() == Some(libc::EBADF) {
            InheritError::MissingDescriptor { fd }
        } else {
            InheritError::Io(err)
        });
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Err(InheritError::NotASocket { fd });
    }

    let mut accepting: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: out-parameters sized for a c_int option value.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            std::ptr::addr_of_mut!(accepting).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(InheritError::Io(io::Error::last_os_error()));
    }
    if accepting == 0 {
        return Err(InheritError::NotListening { fd });
    }
    Ok(())
}
