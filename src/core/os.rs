/*!
 * OS Helpers
 * Singleton lockfile, fd hygiene and other raw process-level utilities
 */

use crate::core::errors::{CraneError, CraneResult};
use log::{debug, warn};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Acquire the agent's singleton lock. The returned guard must be held for
/// the whole process lifetime; dropping it releases the lock.
pub fn lock_singleton(path: &Path) -> CraneResult<Flock<File>> {
    create_folders_for_file(path)?;
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(guard) => Ok(guard),
        Err((_, nix::errno::Errno::EWOULDBLOCK)) => Err(CraneError::Generic(format!(
            "another craned instance holds {}",
            path.display()
        ))),
        Err((_, errno)) => Err(CraneError::System(format!(
            "failed to lock {}: {}",
            path.display(),
            errno
        ))),
    }
}

pub fn create_folders(path: &Path) -> CraneResult<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| CraneError::System(format!("mkdir {}: {}", path.display(), e)))
}

pub fn create_folders_for_file(path: &Path) -> CraneResult<()> {
    if let Some(parent) = path.parent() {
        create_folders(parent)?;
    }
    Ok(())
}

pub fn delete_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    } else {
        debug!("Removed {}", path.display());
    }
}

pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Ignore SIGPIPE process-wide. Broken pipes to spawned children surface
/// as EPIPE write errors instead of killing the agent.
pub fn ignore_sigpipe() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

/// Close every file descriptor >= `min_fd`. Only called in the forked
/// child between fork and exec; must stay async-signal-safe.
pub fn close_fds_from(min_fd: i32) {
    unsafe {
        // close_range() covers the whole span in one call on kernels that
        // have it; fall back to a bounded loop otherwise.
        if nix::libc::close_range(min_fd as u32, u32::MAX, 0) == 0 {
            return;
        }
        let max_fd = nix::libc::sysconf(nix::libc::_SC_OPEN_MAX);
        let max_fd = if max_fd > 0 { max_fd as i32 } else { 1024 };
        for fd in min_fd..max_fd {
            nix::libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_lock_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("craned.mutex");

        let guard = lock_singleton(&path).unwrap();
        let second = lock_singleton(&path);
        assert!(second.is_err());

        drop(guard);
        assert!(lock_singleton(&path).is_ok());
    }

    #[test]
    fn test_create_folders_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c/file.log");
        create_folders_for_file(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_delete_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        delete_file(&dir.path().join("absent"));
    }
}
