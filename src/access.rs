//! Access gate keyed on the requesting process's process-namespace
//! identity (spec §4.9).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// The one piece of truly global mutable state this crate keeps (spec §9):
/// everything else is threaded through `Overlay`, but a Unix signal handler
/// can only safely touch a process-wide static.
pub static SANDBOX_RUNNING: AtomicBool = AtomicBool::new(false);

/// Process names (short, as they appear in `/proc/<pid>/stat`'s `comm`
/// field) that are always trusted, in addition to a specific manager pid.
#[derive(Clone)]
pub struct AccessGate {
    manager_pid: Option<i32>,
    trusted_prefixes: Vec<String>,
    mount_point_parent: PathBuf,
}

struct ProcStat {
    pid: i32,
    comm: String,
    ppid: i32,
}

fn read_proc_stat(pid: i32) -> Option<ProcStat> {
    let text = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm is parenthesized and may itself contain spaces/parens; parse
    // from the last ')' as the canonical proc(5) trick.
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    let comm = text[open + 1..close].to_string();
    let rest = text[close + 1..].trim_start();
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let ppid: i32 = fields.next()?.parse().ok()?;
    Some(ProcStat { pid, comm, ppid })
}

fn read_pid_namespace(pid: i32) -> Option<String> {
    std::fs::read_link(format!("/proc/{pid}/ns/pid")).ok().map(|p| p.to_string_lossy().into_owned())
}

impl AccessGate {
    pub fn new(manager_pid: Option<i32>, trusted_prefixes: Vec<String>, mount_point: &std::path::Path) -> Self {
        let mount_point_parent = mount_point.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"));
        Self { manager_pid, trusted_prefixes, mount_point_parent }
    }

    /// Independent sanity check (spec §4.9): refuse operations whose
    /// target path is the mount point's own parent, which would make the
    /// mount recursively shadow itself.
    pub fn rejects_path(&self, requested: &std::path::Path) -> bool {
        requested == self.mount_point_parent
    }

    /// Walk `/proc/<pid>/stat` upward. Accept on `kthreadd`, the recorded
    /// manager pid, or a trusted short-name prefix; reject on reaching
    /// `init` without a match.
    pub fn allow(&self, caller_pid: i32, my_pid: i32) -> bool {
        if caller_pid == 0 {
            return true; // target is the filesystem root
        }

        let mut pid = caller_pid;
        let mut hops = 0usize;
        loop {
            hops += 1;
            if hops > 10_000 {
                return false; // defend against a corrupt /proc cycle
            }
            let Some(stat) = read_proc_stat(pid) else {
                return false;
            };
            if stat.comm == "kthreadd" || pid == 2 {
                return true;
            }
            if Some(stat.pid) == self.manager_pid {
                return true;
            }
            if self.trusted_prefixes.iter().any(|p| stat.comm.starts_with(p.as_str())) {
                return true;
            }
            if stat.pid == 1 || stat.comm == "init" {
                break;
            }
            if stat.ppid == stat.pid {
                return false; // self-parented, can't climb further
            }
            pid = stat.ppid;
        }

        // Open question per spec §9: the namespace check below collapses
        // to the same accept/reject outcome in both branches in the
        // original behavior. We keep that shape explicitly (rather than
        // silently "fixing" it) and flag it as a policy to revisit.
        if let (Some(caller_ns), Some(my_ns)) = (read_pid_namespace(caller_pid), read_pid_namespace(my_pid)) {
            if caller_ns == my_ns {
                return !SANDBOX_RUNNING.load(Ordering::SeqCst);
            }
        }
        !SANDBOX_RUNNING.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_target_is_always_allowed() {
        let gate = AccessGate::new(None, vec![], std::path::Path::new("/mnt/ovl"));
        assert!(gate.allow(0, 1234));
    }

    #[test]
    fn mount_point_parent_is_rejected() {
        let gate = AccessGate::new(None, vec![], std::path::Path::new("/mnt/ovl"));
        assert!(gate.rejects_path(std::path::Path::new("/mnt")));
        assert!(!gate.rejects_path(std::path::Path::new("/mnt/ovl")));
    }

    #[test]
    fn allow_walks_real_proc_tree_for_current_process() {
        // The current test process's own pid is always reachable and its
        // ancestor chain terminates somewhere under real /proc, so this
        // should not infinite-loop or panic even without a manager pid.
        let gate = AccessGate::new(None, vec!["cargo".into(), "rustc".into()], std::path::Path::new("/mnt/ovl"));
        let pid = std::process::id() as i32;
        let _ = gate.allow(pid, pid);
    }
}
