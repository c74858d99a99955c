#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Signals `pid`, or its whole process group when `pid` leads one.
///
/// Only group leaders get the group-wide signal so that an unrelated process
/// sharing our own group is never hit. `pid == 0` is a no-op.
#[cfg(unix)]
pub fn kill_process_or_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "pid out of range",
        ));
    };
    if pid <= 0 {
        return Ok(());
    }
    let rc = unsafe {
        if libc::getpgid(pid) == pid {
            libc::kill(-pid, signal.raw())
        } else {
            libc::kill(pid, signal.raw())
        }
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Process groups are a Unix concept; elsewhere this does nothing.
#[cfg(not(unix))]
pub fn kill_process_or_group(_pid: u32, _signal: Signal) -> std::io::Result<()> {
    Ok(())
}

/// Signal-0 liveness check. `EPERM` means the pid exists under another user.
#[cfg(unix)]
pub fn is_pid_running(pid: u32) -> std::io::Result<bool> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Ok(false);
    };
    if pid <= 0 {
        return Ok(false);
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EPERM) => Ok(true),
        Some(libc::ESRCH) => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
pub fn is_pid_running(_pid: u32) -> std::io::Result<bool> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process liveness check is not supported on this platform",
    ))
}
