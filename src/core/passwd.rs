/*!
 * Password Entries
 * System password database lookups for job credential transitions
 */

use crate::core::errors::{CraneError, CraneResult};
use nix::unistd::{Uid, User};

/// Snapshot of one password database entry. Looked up once per job at
/// execution time; the child only sees the copied fields.
#[derive(Debug, Clone)]
pub struct PasswordEntry {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home_dir: String,
    pub shell: String,
}

impl PasswordEntry {
    /// Resolve a uid through the system password database.
    pub fn lookup(uid: u32) -> CraneResult<Self> {
        let user = User::from_uid(Uid::from_raw(uid))
            .map_err(|e| CraneError::System(format!("getpwuid({}): {}", uid, e)))?
            .ok_or_else(|| {
                CraneError::PermissionDenied(format!("no password entry for uid {}", uid))
            })?;

        Ok(Self {
            username: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home_dir: user.dir.to_string_lossy().into_owned(),
            shell: user.shell.to_string_lossy().into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_root() {
        let entry = PasswordEntry::lookup(0).unwrap();
        assert_eq!(entry.uid, 0);
        assert!(!entry.username.is_empty());
    }

    #[test]
    fn test_lookup_unknown_uid() {
        // Uids this high are not allocated on any sane system.
        let result = PasswordEntry::lookup(u32::MAX - 2);
        assert!(matches!(result, Err(CraneError::PermissionDenied(_))));
    }
}
