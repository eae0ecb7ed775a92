//! Whiteout and opaque-directory encoding (spec §4.7).

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

use crate::error::FsResult;
use crate::xattr_filter::{OPAQUE_TRUSTED, OPAQUE_USER};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_SENTINEL: &str = ".wh..wh..opq";

/// Whether `name` is itself a reserved whiteout-control name and must never
/// resolve to a real lookup (spec §4.2 step 1).
pub fn is_reserved_name(name: &OsStr) -> bool {
    name.as_bytes().starts_with(WHITEOUT_PREFIX.as_bytes())
}

pub fn whiteout_name_for(name: &OsStr) -> OsString {
    let mut v = WHITEOUT_PREFIX.as_bytes().to_vec();
    v.extend_from_slice(name.as_bytes());
    OsString::from_vec(v)
}

/// If `name` is a `.wh.<X>` whiteout marker, return `X`.
pub fn strip_whiteout_prefix(name: &OsStr) -> Option<OsString> {
    let bytes = name.as_bytes();
    let prefix = WHITEOUT_PREFIX.as_bytes();
    if bytes.starts_with(prefix) && bytes != OPAQUE_SENTINEL.as_bytes() {
        Some(OsString::from_vec(bytes[prefix.len()..].to_vec()))
    } else {
        None
    }
}

/// A character device with rdev == makedev(0, 0) is the alternative whiteout
/// encoding, used when the process has the `mknod` capability.
pub fn is_whiteout_chardev(file_type: libc::mode_t, rdev: u64) -> bool {
    (file_type & libc::S_IFMT) == libc::S_IFCHR
        && unsafe { libc::major(rdev) } == 0
        && unsafe { libc::minor(rdev) } == 0
}

pub fn whiteout_rdev() -> u64 {
    unsafe { libc::makedev(0, 0) }
}

/// Degrades gracefully: try a character-device whiteout first (requires
/// CAP_MKNOD under the caller's namespace), fall back to a `.wh.` regular
/// file. `can_mknod` is sticky per-process once a mknod attempt fails.
pub fn create_whiteout(dir: &Path, name: &OsStr, can_mknod: &mut bool) -> FsResult<()> {
    let target = dir.join(name);
    // best-effort removal of whatever used to be there
    let _ = std::fs::remove_file(&target);

    if *can_mknod {
        let c_path = std::ffi::CString::new(target.as_os_str().as_bytes()).unwrap();
        let rc = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR | 0o000, whiteout_rdev() as libc::dev_t) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) || err.raw_os_error() == Some(libc::ENOSYS) {
            *can_mknod = false;
        } else {
            return Err(err.into());
        }
    }

    let wh = dir.join(whiteout_name_for(name));
    std::fs::File::create(wh)?;
    Ok(())
}

pub fn is_opaque_xattr(dir: &Path) -> bool {
    for attr in [OPAQUE_TRUSTED, OPAQUE_USER] {
        if let Ok(Some(v)) = xattr::get(dir, attr) {
            if v == b"y" {
                return true;
            }
        }
    }
    false
}

pub fn is_opaque(dir: &Path) -> bool {
    is_opaque_xattr(dir) || dir.join(OPAQUE_SENTINEL).exists()
}

/// Mark a directory opaque, preferring the extended attribute and falling
/// back to the sentinel file when xattrs aren't supported by the backing fs.
pub fn set_opaque(dir: &Path) -> FsResult<()> {
    match xattr::set(dir, OPAQUE_TRUSTED, b"y") {
        Ok(()) => Ok(()),
        Err(_) => match xattr::set(dir, OPAQUE_USER, b"y") {
            Ok(()) => Ok(()),
            Err(_) => {
                std::fs::File::create(dir.join(OPAQUE_SENTINEL))?;
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn whiteout_name_roundtrip() {
        let name = OsStr::new("foo");
        let wh = whiteout_name_for(name);
        assert_eq!(wh, OsStr::new(".wh.foo"));
        assert_eq!(strip_whiteout_prefix(&wh).unwrap(), name);
    }

    #[test]
    fn opaque_sentinel_is_not_a_whiteout() {
        assert!(strip_whiteout_prefix(OsStr::new(OPAQUE_SENTINEL)).is_none());
    }

    #[test]
    fn reserved_names_rejected() {
        assert!(is_reserved_name(OsStr::new(".wh.foo")));
        assert!(!is_reserved_name(OsStr::new("foo")));
    }

    #[test]
    fn whiteout_chardev_detection() {
        let rdev = whiteout_rdev();
        assert!(is_whiteout_chardev(libc::S_IFCHR, rdev));
        assert!(!is_whiteout_chardev(libc::S_IFREG, rdev));
    }

    #[test]
    fn create_and_detect_whiteout_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut can_mknod = false; // force the .wh. fallback path in CI sandboxes
        create_whiteout(dir.path(), OsStr::new("victim"), &mut can_mknod).unwrap();
        assert!(dir.path().join(".wh.victim").exists());
    }

    #[test]
    fn opaque_sentinel_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join(OPAQUE_SENTINEL)).unwrap();
        assert!(is_opaque(dir.path()));
    }
}
