//! Classic double-fork daemonization.

use std::io;

/// Detach from the controlling terminal: fork, new session, fork again,
/// `umask(0)`, `chdir("/")`, std streams onto `/dev/null`.
///
/// Call after the listening socket is bound (so bind failures surface in the
/// foreground) and before any threads are spawned. The intermediate parents
/// exit; only the daemon returns.
pub fn daemonize() -> io::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }
        // Second fork: the session leader exits so the daemon can never
        // reacquire a controlling terminal.
        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
        libc::umask(0);
        if libc::chdir(c"/".as_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, libc::STDIN_FILENO);
            libc::dup2(null, libc::STDOUT_FILENO);
            libc::dup2(null, libc::STDERR_FILENO);
            if null > libc::STDERR_FILENO {
                libc::close(null);
            }
        }
    }
    Ok(())
}
