//! FUSE adapter: translates the kernel's inode-oriented callbacks into the
//! engine's vpath operations through an inode registry.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, TimeOrNow};
use log::{debug, info, warn};

use super::{Attr, Engine, FileKind};

const TTL: Duration = Duration::from_secs(0);
const ROOT_INODE: u64 = 1;

/// vpath <-> inode registry. Inodes are handed out on first lookup and
/// retired on unlink/forget; renames re-key every affected path.
#[derive(Debug)]
struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut t = Self {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INODE + 1,
        };
        t.by_ino.insert(ROOT_INODE, "/".to_string());
        t.by_path.insert("/".to_string(), ROOT_INODE);
        t
    }

    fn vpath(&self, ino: u64) -> Option<&String> {
        self.by_ino.get(&ino)
    }

    fn assign(&mut self, vpath: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(vpath) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, vpath.to_string());
        self.by_path.insert(vpath.to_string(), ino);
        ino
    }

    fn retire_path(&mut self, vpath: &str) {
        if let Some(ino) = self.by_path.remove(vpath) {
            self.by_ino.remove(&ino);
        }
    }

    fn retire_ino(&mut self, ino: u64) {
        if ino == ROOT_INODE {
            return;
        }
        if let Some(vpath) = self.by_ino.remove(&ino) {
            self.by_path.remove(&vpath);
        }
    }

    /// Re-key `from` and everything beneath it to live under `to`.
    fn rename(&mut self, from: &str, to: &str) {
        let prefix = format!("{from}/");
        let moved: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|(k, _)| k.as_str() == from || k.starts_with(&prefix))
            .map(|(k, &v)| (k.clone(), v))
            .collect();
        for (old, ino) in moved {
            self.by_path.remove(&old);
            let new = format!("{to}{}", &old[from.len()..]);
            self.by_ino.insert(ino, new.clone());
            self.by_path.insert(new, ino);
        }
    }
}

/// The mounted filesystem: engine + inode registry + open-handle table.
pub struct LiveRaidFs {
    engine: Engine,
    inodes: InodeTable,
    handles: HashMap<u64, super::FileHandle>,
    next_fh: u64,
}

impl LiveRaidFs {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            inodes: InodeTable::new(),
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn child_vpath(&self, parent: u64, name: &OsStr) -> Option<String> {
        let dir = self.inodes.vpath(parent)?;
        let name = name.to_str()?;
        Some(if dir == "/" {
            format!("/{name}")
        } else {
            format!("{dir}/{name}")
        })
    }

    fn store_handle(&mut self, handle: super::FileHandle) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }

    fn fuse_attr(&self, ino: u64, attr: &Attr) -> FileAttr {
        let kind = match attr.kind {
            FileKind::File => FileType::RegularFile,
            FileKind::Directory => FileType::Directory,
            FileKind::Symlink => FileType::Symlink,
        };
        let size = attr.size.max(0) as u64;
        let mtime = timestamp(attr.mtime_sec, attr.mtime_nsec);
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: self.engine.cfg().block_size,
            flags: 0,
        }
    }
}

fn timestamp(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec.clamp(0, 999_999_999) as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs())
    }
}

fn time_pair(t: Option<TimeOrNow>) -> Option<(i64, i64)> {
    match t {
        None => None,
        Some(TimeOrNow::Now) => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            Some((now.as_secs() as i64, now.subsec_nanos() as i64))
        }
        Some(TimeOrNow::SpecificTime(t)) => {
            let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            Some((d.as_secs() as i64, d.subsec_nanos() as i64))
        }
    }
}

impl fuser::Filesystem for LiveRaidFs {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        info!("filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("unmounting, shutting engine down");
        self.engine.shutdown();
    }

    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        debug!("lookup {name:?} in inode {parent}");
        let vpath = match self.child_vpath(parent, name) {
            Some(v) => v,
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.getattr(&vpath) {
            Ok(attr) => {
                let ino = self.inodes.assign(&vpath);
                reply.entry(&TTL, &self.fuse_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, _nlookup: u64) {
        self.inodes.retire_ino(ino);
    }

    fn getattr(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyAttr) {
        debug!("getattr inode {ino}");
        let vpath = match self.inodes.vpath(ino) {
            Some(v) => v.clone(),
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.getattr(&vpath) {
            Ok(attr) => reply.attr(&TTL, &self.fuse_attr(ino, &attr)),
            Err(e) => {
                warn!("getattr {vpath}: {e}");
                reply.error(e.errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
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
        reply: fuser::ReplyAttr,
    ) {
        info!("setattr inode {ino}");
        let vpath = match self.inodes.vpath(ino) {
            Some(v) => v.clone(),
            None => return reply.error(libc::ENOENT),
        };

        let result = (|| -> Result<(), crate::Error> {
            if let Some(mode) = mode {
                self.engine.chmod(&vpath, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.engine.chown(&vpath, uid, gid)?;
            }
            if let Some(size) = size {
                self.engine.truncate(&vpath, size as i64)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.engine
                    .utimens(&vpath, time_pair(atime), time_pair(mtime))?;
            }
            Ok(())
        })();

        match result.and_then(|_| self.engine.getattr(&vpath)) {
            Ok(attr) => reply.attr(&TTL, &self.fuse_attr(ino, &attr)),
            Err(e) => {
                warn!("setattr {vpath}: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        debug!("readlink inode {ino}");
        let vpath = match self.inodes.vpath(ino) {
            Some(v) => v.clone(),
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.readlink(&vpath) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        info!("mknod {name:?} in inode {parent}");
        let vpath = match self.child_vpath(parent, name) {
            Some(v) => v,
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.create(&vpath, mode, libc::O_WRONLY) {
            Ok(handle) => {
                self.engine.release(handle);
                match self.engine.getattr(&vpath) {
                    Ok(attr) => {
                        let ino = self.inodes.assign(&vpath);
                        reply.entry(&TTL, &self.fuse_attr(ino, &attr), 0);
                    }
                    Err(e) => reply.error(e.errno()),
                }
            }
            Err(e) => {
                warn!("mknod {vpath}: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        info!("mkdir {name:?} in inode {parent}");
        let vpath = match self.child_vpath(parent, name) {
            Some(v) => v,
            None => return reply.error(libc::ENOENT),
        };
        match self
            .engine
            .mkdir(&vpath, mode)
            .and_then(|_| self.engine.getattr(&vpath))
        {
            Ok(attr) => {
                let ino = self.inodes.assign(&vpath);
                reply.entry(&TTL, &self.fuse_attr(ino, &attr), 0);
            }
            Err(e) => {
                warn!("mkdir {vpath}: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        info!("unlink {name:?} in inode {parent}");
        let vpath = match self.child_vpath(parent, name) {
            Some(v) => v,
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.unlink(&vpath) {
            Ok(()) => {
                self.inodes.retire_path(&vpath);
                reply.ok();
            }
            Err(e) => {
                warn!("unlink {vpath}: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        info!("rmdir {name:?} in inode {parent}");
        let vpath = match self.child_vpath(parent, name) {
            Some(v) => v,
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.rmdir(&vpath) {
            Ok(()) => {
                self.inodes.retire_path(&vpath);
                reply.ok();
            }
            Err(e) => {
                warn!("rmdir {vpath}: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn symlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: fuser::ReplyEntry,
    ) {
        info!("symlink {link_name:?} -> {target:?}");
        let vpath = match self.child_vpath(parent, link_name) {
            Some(v) => v,
            None => return reply.error(libc::ENOENT),
        };
        let target = target.to_string_lossy();
        match self
            .engine
            .symlink(&target, &vpath, req.uid(), req.gid())
            .and_then(|_| self.engine.getattr(&vpath))
        {
            Ok(attr) => {
                let ino = self.inodes.assign(&vpath);
                reply.entry(&TTL, &self.fuse_attr(ino, &attr), 0);
            }
            Err(e) => {
                warn!("symlink {vpath}: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        info!("rename {name:?} -> {newname:?}");
        let (from, to) = match (
            self.child_vpath(parent, name),
            self.child_vpath(newparent, newname),
        ) {
            (Some(f), Some(t)) => (f, t),
            _ => return reply.error(libc::ENOENT),
        };
        match self.engine.rename(&from, &to, flags) {
            Ok(()) => {
                self.inodes.retire_path(&to);
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => {
                warn!("rename {from} -> {to}: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        debug!("open inode {ino}");
        let vpath = match self.inodes.vpath(ino) {
            Some(v) => v.clone(),
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.open(&vpath, flags) {
            Ok(handle) => {
                let fh = self.store_handle(handle);
                reply.opened(fh, 0);
            }
            Err(e) => {
                warn!("open {vpath}: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        info!("create {name:?} in inode {parent}");
        let vpath = match self.child_vpath(parent, name) {
            Some(v) => v,
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.create(&vpath, mode, flags) {
            Ok(handle) => match self.engine.getattr(&vpath) {
                Ok(attr) => {
                    let ino = self.inodes.assign(&vpath);
                    let attr = self.fuse_attr(ino, &attr);
                    let fh = self.store_handle(handle);
                    reply.created(&TTL, &attr, 0, fh, 0);
                }
                Err(e) => {
                    self.engine.release(handle);
                    reply.error(e.errno());
                }
            },
            Err(e) => {
                warn!("create {vpath}: {e}");
                reply.error(e.errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        debug!("read {size} bytes at {offset} from inode {ino}");
        let handle = match self.handles.get(&fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };
        let mut buf = vec![0u8; size as usize];
        match self.engine.read(handle, offset, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => {
                warn!("read {}: {e}", handle.vpath());
                reply.error(e.errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        debug!("write {} bytes at {offset} to inode {ino}", data.len());
        let handle = match self.handles.get(&fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };
        match self.engine.write(handle, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => {
                warn!("write {}: {e}", handle.vpath());
                reply.error(e.errno());
            }
        }
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        debug!("release inode {ino}");
        if let Some(handle) = self.handles.remove(&fh) {
            self.engine.release(handle);
        }
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        info!("fsync inode {ino}");
        let handle = match self.handles.get(&fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };
        match self.engine.fsync(handle, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!("fsync {}: {e}", handle.vpath());
                reply.error(e.errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        debug!("readdir inode {ino} at offset {offset}");
        let vpath = match self.inodes.vpath(ino) {
            Some(v) => v.clone(),
            None => return reply.error(libc::ENOENT),
        };
        let entries = match self.engine.readdir(&vpath) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("readdir {vpath}: {e}");
                return reply.error(e.errno());
            }
        };

        let mut index = offset + 1;
        if offset < 1 && reply.add(ino, 1, FileType::Directory, ".") {
            return reply.ok();
        }
        if offset < 2 && reply.add(ino, 2, FileType::Directory, "..") {
            return reply.ok();
        }
        index = index.max(3);

        for entry in entries.iter().skip((index - 3) as usize) {
            let kind = match entry.kind {
                FileKind::File => FileType::RegularFile,
                FileKind::Directory => FileType::Directory,
                FileKind::Symlink => FileType::Symlink,
            };
            let child = if vpath == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{vpath}/{}", entry.name)
            };
            let child_ino = self.inodes.assign(&child);
            if reply.add(child_ino, index, kind, &entry.name) {
                break;
            }
            index += 1;
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        debug!("statfs");
        let sf = self.engine.statfs();
        reply.statfs(
            sf.blocks,
            sf.blocks_free,
            sf.blocks_avail,
            0,
            0,
            sf.block_size as u32,
            sf.name_max,
            sf.block_size as u32,
        );
    }

    fn access(&mut self, _req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        debug!("access inode {ino} mask {mask}");
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::InodeTable;

    #[test]
    fn assign_is_stable() {
        let mut t = InodeTable::new();
        let a = t.assign("/a");
        assert_eq!(t.assign("/a"), a);
        assert_ne!(t.assign("/b"), a);
        assert_eq!(t.vpath(a).unwrap(), "/a");
    }

    #[test]
    fn rename_rekeys_subtree() {
        let mut t = InodeTable::new();
        let dir = t.assign("/dir");
        let leaf = t.assign("/dir/leaf");
        t.rename("/dir", "/moved");
        assert_eq!(t.vpath(dir).unwrap(), "/moved");
        assert_eq!(t.vpath(leaf).unwrap(), "/moved/leaf");
        assert_eq!(t.assign("/moved/leaf"), leaf);
    }

    #[test]
    fn retire_frees_both_directions() {
        let mut t = InodeTable::new();
        let a = t.assign("/a");
        t.retire_path("/a");
        assert!(t.vpath(a).is_none());
        let b = t.assign("/a");
        assert_ne!(a, b);
        t.retire_ino(b);
        assert!(t.vpath(b).is_none());
    }
}
