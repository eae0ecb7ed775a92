use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;

use fuseoverlayfs::access::SANDBOX_RUNNING;
use fuseoverlayfs::config::MountOptions;
use fuseoverlayfs::layer::StatInfo;
use fuseoverlayfs::mutate::SetattrChanges;
use fuseoverlayfs::node::FileKind;
use fuseoverlayfs::overlay::Overlay;
use fuseoverlayfs::{info, warn, FsError};

const DEFAULT_TTL: Duration = Duration::new(1, 0);

/// Forward a `FsResult` into a FUSE reply's error channel, returning from
/// the caller on failure -- mirrors the teacher's `fuse_try!` macro.
macro_rules! fuse_try {
    ($res:expr, $reply:expr) => {
        match $res {
            Ok(v) => v,
            Err(e) => {
                $reply.error(e.into());
                return;
            }
        }
    };
}

fn kind_to_fuse(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::Reg => FuseFileType::RegularFile,
        FileKind::Dir => FuseFileType::Directory,
        FileKind::Lnk => FuseFileType::Symlink,
    }
}

fn stat_to_attr(ino: u64, kind: FileKind, st: &StatInfo) -> FileAttr {
    FileAttr {
        ino,
        size: st.size,
        blocks: (st.size + 511) / 512,
        atime: st.atime,
        mtime: st.mtime,
        ctime: st.ctime,
        crtime: st.ctime,
        kind: kind_to_fuse(kind),
        perm: (st.mode & 0o7777) as u16,
        nlink: st.nlink as u32,
        uid: st.uid,
        gid: st.gid,
        rdev: st.rdev as u32,
        blksize: 4096,
        flags: 0,
    }
}

/// The `fuser::Filesystem` glue (spec §2 "Request dispatcher glue"):
/// translates kernel operations into `Overlay` calls under the big lock,
/// applies the access gate first, and maps `FsError` into reply codes.
struct OverlayFuse {
    ovl: Arc<Overlay>,
    my_pid: i32,
}

impl OverlayFuse {
    fn is_allowed(&self, req: &Request<'_>) -> bool {
        self.ovl.access_gate.allow(req.pid() as i32, self.my_pid)
    }
}

/// Reject a caller the access gate doesn't recognize before touching any
/// state. Replies with ENOENT rather than EACCES: never leak the existence
/// of a name to a rejected caller (spec §4.9, §7).
macro_rules! gate {
    ($self:expr, $req:expr, $reply:expr) => {
        if !$self.is_allowed($req) {
            $reply.error(libc::ENOENT);
            return;
        }
    };
}

impl Filesystem for OverlayFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("fuseoverlayfs mounted with {} lower layer(s)", self.ovl.layers.num_of_layers().saturating_sub(self.ovl.layers.has_upper() as usize));
        Ok(())
    }

    fn destroy(&mut self) {
        info!("fuseoverlayfs unmounting");
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let id = match fuse_try!(self.ovl.lookup(parent, name), reply) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let node = fuse_try!(self.ovl.graph.get(id), reply);
        if node.is_whiteout {
            reply.error(libc::ENOENT);
            return;
        }
        fuse_try!(self.ovl.graph.inc_lookup(id, 1), reply);
        let st = fuse_try!(self.ovl.getattr(id), reply);
        reply.entry(&DEFAULT_TTL, &stat_to_attr(id, node.kind, &st), 0);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        let _guard = match self.ovl.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let _ = self.ovl.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let node = fuse_try!(self.ovl.graph.get(ino), reply);
        let st = fuse_try!(self.ovl.getattr(ino), reply);
        reply.attr(&DEFAULT_TTL, &stat_to_attr(ino, node.kind, &st));
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let to_time = |t: TimeOrNow| match t {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => SystemTime::now(),
        };
        let changes = SetattrChanges {
            size,
            mode,
            uid: uid.map(|u| self.ovl.uid_map.map_in(u)),
            gid: gid.map(|g| self.ovl.gid_map.map_in(g)),
            atime: atime.map(to_time),
            mtime: mtime.map(to_time),
        };
        fuse_try!(self.ovl.setattr(ino, &changes), reply);
        let node = fuse_try!(self.ovl.graph.get(ino), reply);
        let st = fuse_try!(self.ovl.getattr(ino), reply);
        reply.attr(&DEFAULT_TTL, &stat_to_attr(ino, node.kind, &st));
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let node = fuse_try!(self.ovl.graph.get(ino), reply);
        let store = &self.ovl.layers.layers[node.layer].store;
        let target = fuse_try!(store.readlink(&node.path), reply);
        reply.data(target.as_os_str().as_encoded_bytes());
    }

    fn mknod(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, rdev: u32, reply: ReplyEntry) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let uid = self.ovl.uid_map.map_in(req.uid());
        let gid = self.ovl.gid_map.map_in(req.gid());
        let id = fuse_try!(self.ovl.mknod(parent, name, mode, rdev as u64, uid, gid), reply);
        fuse_try!(self.ovl.graph.inc_lookup(id, 1), reply);
        let node = fuse_try!(self.ovl.graph.get(id), reply);
        let st = fuse_try!(self.ovl.getattr(id), reply);
        reply.entry(&DEFAULT_TTL, &stat_to_attr(id, node.kind, &st), 0);
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let uid = self.ovl.uid_map.map_in(req.uid());
        let gid = self.ovl.gid_map.map_in(req.gid());
        let id = fuse_try!(self.ovl.mkdir(parent, name, mode, uid, gid), reply);
        fuse_try!(self.ovl.graph.inc_lookup(id, 1), reply);
        let node = fuse_try!(self.ovl.graph.get(id), reply);
        let st = fuse_try!(self.ovl.getattr(id), reply);
        reply.entry(&DEFAULT_TTL, &stat_to_attr(id, node.kind, &st), 0);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        fuse_try!(self.ovl.unlink(parent, name), reply);
        reply.ok();
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        fuse_try!(self.ovl.rmdir(parent, name), reply);
        reply.ok();
    }

    fn symlink(&mut self, req: &Request<'_>, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let uid = self.ovl.uid_map.map_in(req.uid());
        let gid = self.ovl.gid_map.map_in(req.gid());
        let id = fuse_try!(self.ovl.symlink(parent, link_name, target, uid, gid), reply);
        fuse_try!(self.ovl.graph.inc_lookup(id, 1), reply);
        let node = fuse_try!(self.ovl.graph.get(id), reply);
        let st = fuse_try!(self.ovl.getattr(id), reply);
        reply.entry(&DEFAULT_TTL, &stat_to_attr(id, node.kind, &st), 0);
    }

    fn rename(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, flags: u32, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let exchange = flags & libc::RENAME_EXCHANGE != 0;
        let no_replace = flags & libc::RENAME_NOREPLACE != 0;
        fuse_try!(self.ovl.rename(parent, name, newparent, newname, exchange, no_replace), reply);
        reply.ok();
    }

    fn link(&mut self, req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let id = fuse_try!(self.ovl.link(ino, newparent, newname), reply);
        fuse_try!(self.ovl.graph.inc_lookup(id, 1), reply);
        let node = fuse_try!(self.ovl.graph.get(id), reply);
        let st = fuse_try!(self.ovl.getattr(id), reply);
        reply.entry(&DEFAULT_TTL, &stat_to_attr(id, node.kind, &st), 0);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        gate!(self, req, reply);
        reply.opened(ino, 0);
    }

    fn read(&mut self, req: &Request<'_>, ino: u64, _fh: u64, offset: i64, size: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyData) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        assert!(offset >= 0);
        let mut buf = vec![0u8; size as usize];
        let n = fuse_try!(self.ovl.read(ino, offset as u64, &mut buf), reply);
        buf.truncate(n);
        reply.data(&buf);
    }

    fn write(&mut self, req: &Request<'_>, ino: u64, _fh: u64, offset: i64, data: &[u8], _write_flags: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyWrite) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        assert!(offset >= 0);
        let n = fuse_try!(self.ovl.write(ino, offset as u64, data), reply);
        reply.written(n as u32);
    }

    fn release(&mut self, req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, _lock_owner: Option<u64>, _flush: bool, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _ = ino;
        reply.ok();
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let node = fuse_try!(self.ovl.graph.get(ino), reply);
        if node.layer == self.ovl.layers.upper_index().unwrap_or(usize::MAX) {
            if let Ok(f) = self.ovl.layers.layers[node.layer].store.open(&node.path, libc::O_RDONLY) {
                let _ = f.sync_all();
            }
        }
        reply.ok();
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let node = fuse_try!(self.ovl.graph.get(ino), reply);
        if node.layer == self.ovl.layers.upper_index().unwrap_or(usize::MAX) {
            if let Ok(f) = self.ovl.layers.layers[node.layer].store.open(&node.path, libc::O_RDONLY) {
                fuse_try!(f.sync_all().map_err(FsError::from), reply);
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let node = fuse_try!(self.ovl.graph.get(ino), reply);
        node.in_readdir.fetch_add(1, Ordering::SeqCst);
        reply.opened(ino, 0);
    }

    fn readdir(&mut self, req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let listing = fuse_try!(self.ovl.readdir(ino), reply);
        for (i, (name, id)) in listing.into_iter().enumerate().skip(offset as usize) {
            let kind = match self.ovl.graph.get(id) {
                Ok(n) => kind_to_fuse(n.kind),
                Err(_) => FuseFileType::RegularFile,
            };
            if reply.add(id, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        if let Ok(node) = self.ovl.graph.get(ino) {
            node.in_readdir.fetch_sub(1, Ordering::SeqCst);
        }
        reply.ok();
    }

    fn statfs(&mut self, req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        gate!(self, req, reply);
        let root = self.ovl.layers.upper().map(|l| l.store.root()).unwrap_or_else(|| self.ovl.layers.layers[0].store.root());
        match nix::sys::statvfs::statvfs(root) {
            Ok(s) => reply.statfs(
                s.blocks() as u64,
                s.blocks_free() as u64,
                s.blocks_available() as u64,
                s.files() as u64,
                s.files_free() as u64,
                s.block_size() as u32,
                s.name_max() as u32,
                s.fragment_size() as u32,
            ),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let st = fuse_try!(self.ovl.getattr(ino), reply);
        if mask == libc::F_OK {
            reply.ok();
            return;
        }
        let is_owner = req.uid() == st.uid;
        let shift = if is_owner { 6 } else if req.gid() == st.gid { 3 } else { 0 };
        let bits = (st.mode >> shift) & 0o7;
        let needed = ((mask & libc::R_OK != 0) as u32) << 2 | ((mask & libc::W_OK != 0) as u32) << 1 | (mask & libc::X_OK != 0) as u32;
        if req.uid() == 0 || bits & needed == needed {
            reply.ok();
        } else {
            reply.error(libc::EACCES);
        }
    }

    fn create(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, _flags: i32, reply: ReplyCreate) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let uid = self.ovl.uid_map.map_in(req.uid());
        let gid = self.ovl.gid_map.map_in(req.gid());
        let id = fuse_try!(self.ovl.create(parent, name, mode, uid, gid), reply);
        fuse_try!(self.ovl.graph.inc_lookup(id, 1), reply);
        let node = fuse_try!(self.ovl.graph.get(id), reply);
        let st = fuse_try!(self.ovl.getattr(id), reply);
        reply.created(&DEFAULT_TTL, &stat_to_attr(id, node.kind, &st), 0, id, 0);
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let name = name.to_string_lossy();
        let value = match fuse_try!(self.ovl.getxattr(ino, &name), reply) {
            Some(v) => v,
            None => {
                reply.error(libc::ENODATA);
                return;
            }
        };
        if size == 0 {
            reply.size(value.len() as u32);
        } else if value.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&value);
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        let names = fuse_try!(self.ovl.listxattr(ino), reply);
        let mut buf = Vec::new();
        for n in names {
            buf.extend_from_slice(n.as_bytes());
            buf.push(0);
        }
        if size == 0 {
            reply.size(buf.len() as u32);
        } else if buf.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&buf);
        }
    }

    fn setxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, value: &[u8], _flags: i32, _position: u32, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        fuse_try!(self.ovl.setxattr(ino, &name.to_string_lossy(), value), reply);
        reply.ok();
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        gate!(self, req, reply);
        let _guard = fuse_try!(self.ovl.lock(), reply);
        fuse_try!(self.ovl.removexattr(ino, &name.to_string_lossy()), reply);
        reply.ok();
    }
}

#[derive(Parser, Debug)]
#[command(name = "fuseoverlayfs", about = "Userspace overlay filesystem")]
struct Cli {
    /// Mount options, in the same comma-joined `-o key=val,...` form
    /// `mount(8)` passes through; may be repeated.
    #[arg(short = 'o', value_delimiter = ',')]
    options: Vec<String>,

    /// Where to mount the unified view.
    mountpoint: PathBuf,

    #[arg(short = 'd', long)]
    debug: bool,
}

/// Set by the SIGUSR1 handler; the parent watchdog thread notices it and
/// logs the node/inode counts (spec §6 "Signal handling").
static STATS_DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

fn install_signal_handlers() {
    extern "C" fn clear_sandbox(_: i32) {
        SANDBOX_RUNNING.store(false, Ordering::SeqCst);
        STATS_DUMP_REQUESTED.store(true, Ordering::SeqCst);
    }
    extern "C" fn set_sandbox(_: i32) {
        SANDBOX_RUNNING.store(true, Ordering::SeqCst);
    }
    unsafe {
        let _ = nix::sys::signal::signal(nix::sys::signal::Signal::SIGUSR1, nix::sys::signal::SigHandler::Handler(clear_sandbox));
        let _ = nix::sys::signal::signal(nix::sys::signal::Signal::SIGUSR2, nix::sys::signal::SigHandler::Handler(set_sandbox));
    }
}

/// Background thread polling the parent process (spec §6 "Parent-process
/// watchdog"): when it disappears, unmount and exit. Also drains
/// `STATS_DUMP_REQUESTED`, logging the current node/inode counts whenever
/// SIGUSR1 fires.
fn spawn_parent_watchdog(mountpoint: PathBuf, ovl: Arc<Overlay>) {
    let start_ppid = nix::unistd::getppid();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(2));
        if STATS_DUMP_REQUESTED.swap(false, Ordering::SeqCst) {
            let (nodes, inodes) = ovl.stats();
            info!("sandbox disabled: {nodes} nodes, {inodes} inodes tracked");
        }
        if nix::unistd::getppid() != start_ppid {
            warn!("parent process exited, unmounting {:?}", mountpoint);
            let _ = std::process::Command::new("fusermount3").arg("-u").arg(&mountpoint).status()
                .or_else(|_| std::process::Command::new("umount").arg(&mountpoint).status());
            std::process::exit(0);
        }
    });
}

fn main() {
    let cli = Cli::parse();
    env_logger::builder()
        .filter_level(if cli.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let opt_string = cli.options.join(",");
    let opts = match MountOptions::parse(&opt_string) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("invalid mount options: {e}");
            std::process::exit(1);
        }
    };

    let ovl = match Overlay::new(&opts, &cli.mountpoint) {
        Ok(o) => Arc::new(o),
        Err(e) => {
            eprintln!("failed to initialize overlay: {e}");
            std::process::exit(1);
        }
    };

    install_signal_handlers();
    spawn_parent_watchdog(cli.mountpoint.clone(), Arc::clone(&ovl));

    let mut mount_opts = vec![MountOption::FSName("fuseoverlayfs".to_string())];
    if opts.upperdir.is_none() {
        mount_opts.push(MountOption::RO);
    }

    let my_pid = std::process::id() as i32;
    info!("mounting at {:?}", cli.mountpoint);
    if let Err(e) = fuser::mount2(OverlayFuse { ovl, my_pid }, &cli.mountpoint, &mount_opts) {
        eprintln!("mount failed: {e}");
        std::process::exit(1);
    }
}
