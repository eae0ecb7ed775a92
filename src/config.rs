//! External interfaces: mount options and the hide-list configuration file
//! (spec §3 "Hide-list", §6).

use std::path::PathBuf;

use glob::Pattern;

use crate::error::{FsError, FsResult};
use crate::idmap::{IdRange, Squash};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XattrPermissions {
    Disabled,
    PrivilegedOverrideStat,
    UserOverrideStat,
}

#[derive(Clone, Debug)]
pub struct MountOptions {
    pub lowerdir: Vec<PathBuf>,
    pub upperdir: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub uid_ranges: Vec<IdRange>,
    pub gid_ranges: Vec<IdRange>,
    pub timeout: f64,
    pub threaded: bool,
    pub fsync: bool,
    pub fast_ino: bool,
    pub writeback: bool,
    pub noxattrs: bool,
    pub plugins: Vec<String>,
    pub xattr_permissions: XattrPermissions,
    pub uid_squash: Squash,
    pub gid_squash: Squash,
    pub static_nlink: bool,
    pub context: Option<String>,
    /// Not one of the standard overlay options; needed to derive the
    /// block-crypto key (spec §4.8 says the key comes "from a password via
    /// a PBKDF" but doesn't name the option). Defaults to empty, matching
    /// an unauthenticated mount, the way the spec's Non-goals describe a
    /// fixed embedded secret as the sole confidentiality source.
    pub password: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            lowerdir: Vec::new(),
            upperdir: None,
            workdir: None,
            uid_ranges: Vec::new(),
            gid_ranges: Vec::new(),
            timeout: 1.0,
            threaded: false,
            fsync: true,
            fast_ino: false,
            writeback: false,
            noxattrs: false,
            plugins: Vec::new(),
            xattr_permissions: XattrPermissions::Disabled,
            uid_squash: Squash::None,
            gid_squash: Squash::None,
            static_nlink: false,
            context: None,
            password: String::new(),
        }
    }
}

impl MountOptions {
    /// Parse the comma-joined `-o key=val,key,...` option string.
    pub fn parse(opts: &str) -> FsResult<Self> {
        let mut out = Self::default();
        for kv in opts.split(',') {
            if kv.is_empty() {
                continue;
            }
            let (key, val) = match kv.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (kv, None),
            };
            match key {
                "lowerdir" => {
                    let v = val.ok_or(FsError::InvalidInput)?;
                    out.lowerdir = v.split(':').map(PathBuf::from).collect();
                }
                "upperdir" => out.upperdir = val.map(PathBuf::from),
                "workdir" => out.workdir = val.map(PathBuf::from),
                "redirect_dir" => {
                    if val != Some("off") {
                        return Err(FsError::InvalidInput);
                    }
                }
                "uidmapping" => out.uid_ranges = crate::idmap::IdMap::parse_ranges(val.ok_or(FsError::InvalidInput)?)?,
                "gidmapping" => out.gid_ranges = crate::idmap::IdMap::parse_ranges(val.ok_or(FsError::InvalidInput)?)?,
                "timeout" => out.timeout = val.ok_or(FsError::InvalidInput)?.parse().map_err(|_| FsError::InvalidInput)?,
                "threaded" => out.threaded = parse_bool_opt(val)?,
                "fsync" => out.fsync = parse_bool_opt(val)?,
                "fast_ino" => out.fast_ino = parse_bool_opt(val)?,
                "writeback" => out.writeback = parse_bool_opt(val)?,
                "noxattrs" => out.noxattrs = parse_bool_opt(val)?,
                "plugins" => out.plugins = val.ok_or(FsError::InvalidInput)?.split(':').map(String::from).collect(),
                "xattr_permissions" => {
                    out.xattr_permissions = match val.ok_or(FsError::InvalidInput)? {
                        "0" => XattrPermissions::Disabled,
                        "1" => XattrPermissions::PrivilegedOverrideStat,
                        "2" => XattrPermissions::UserOverrideStat,
                        _ => return Err(FsError::InvalidInput),
                    };
                }
                "squash_to_root" => out.uid_squash = Squash::Root,
                "squash_to_uid" => {
                    out.uid_squash = Squash::Fixed(val.ok_or(FsError::InvalidInput)?.parse().map_err(|_| FsError::InvalidInput)?)
                }
                "squash_to_gid" => {
                    out.gid_squash = Squash::Fixed(val.ok_or(FsError::InvalidInput)?.parse().map_err(|_| FsError::InvalidInput)?)
                }
                "static_nlink" => out.static_nlink = true,
                "volatile" => out.fsync = false,
                "context" => out.context = val.map(String::from),
                "password" => out.password = val.unwrap_or_default().to_string(),
                _ => { /* unknown options are ignored, matching permissive FUSE -o parsing */ }
            }
        }
        if out.lowerdir.is_empty() {
            return Err(FsError::InvalidInput);
        }
        Ok(out)
    }
}

fn parse_bool_opt(val: Option<&str>) -> FsResult<bool> {
    match val {
        Some("0") => Ok(false),
        Some("1") => Ok(true),
        _ => Err(FsError::InvalidInput),
    }
}

/// Merged hide-list: `blacklist \ (whitelist \ nowhitelist)` (spec §3, §6).
#[derive(Default)]
pub struct HideList {
    whitelist: Vec<Pattern>,
    nowhitelist: Vec<Pattern>,
    blacklist: Vec<Pattern>,
}

impl HideList {
    pub fn parse(text: &str, home_dir: Option<&str>) -> Self {
        let mut hl = HideList::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((kw, rest)) = line.split_once(char::is_whitespace) else { continue };
            let glob_str = expand_home(rest.trim(), home_dir);
            let Ok(pat) = Pattern::new(&glob_str) else { continue };
            match kw {
                "whitelist" => hl.whitelist.push(pat),
                "nowhitelist" => hl.nowhitelist.push(pat),
                "blacklist" => hl.blacklist.push(pat),
                _ => {}
            }
        }
        hl
    }

    pub fn load(path: &std::path::Path) -> Self {
        let home = pkexec_home();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text, home.as_deref()),
            Err(_) => Self::default(),
        }
    }

    pub fn is_hidden(&self, path: &str) -> bool {
        let blacklisted = self.blacklist.iter().any(|p| p.matches(path));
        if !blacklisted {
            return false;
        }
        let carved_out = self.whitelist.iter().any(|p| p.matches(path))
            && !self.nowhitelist.iter().any(|p| p.matches(path));
        !carved_out
    }
}

fn expand_home(pattern: &str, home_dir: Option<&str>) -> String {
    let home = home_dir.unwrap_or("");
    if let Some(rest) = pattern.strip_prefix("${HOME}") {
        format!("{home}{rest}")
    } else if let Some(rest) = pattern.strip_prefix('~') {
        format!("{home}{rest}")
    } else {
        pattern.to_string()
    }
}

/// Resolve the home directory of the user identified by `PKEXEC_UID`, as
/// used to expand `${HOME}`/`~` in the hide-list config file (spec §6).
fn pkexec_home() -> Option<String> {
    let uid: u32 = std::env::var("PKEXEC_UID").ok()?.parse().ok()?;
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)).ok()??;
    Some(user.dir.to_string_lossy().into_owned())
}

pub const DEFAULT_CONFIG_PATH: &str = "/home/jailbox/profile.config";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_options() {
        let o = MountOptions::parse("lowerdir=/a:/b,upperdir=/u,workdir=/w").unwrap();
        assert_eq!(o.lowerdir, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(o.upperdir, Some(PathBuf::from("/u")));
    }

    #[test]
    fn rejects_redirect_dir_other_than_off() {
        assert!(MountOptions::parse("lowerdir=/a,redirect_dir=on").is_err());
        assert!(MountOptions::parse("lowerdir=/a,redirect_dir=off").is_ok());
    }

    #[test]
    fn missing_lowerdir_is_rejected() {
        assert!(MountOptions::parse("upperdir=/u").is_err());
    }

    #[test]
    fn volatile_disables_fsync() {
        let o = MountOptions::parse("lowerdir=/a,volatile").unwrap();
        assert!(!o.fsync);
    }

    #[test]
    fn hide_list_grammar() {
        let cfg = "blacklist /secret/*\nwhitelist /secret/public\nnowhitelist /secret/public/private";
        let hl = HideList::parse(cfg, None);
        assert!(hl.is_hidden("/secret/x"));
        assert!(!hl.is_hidden("/secret/public"));
        assert!(hl.is_hidden("/secret/public/private"));
    }
}
