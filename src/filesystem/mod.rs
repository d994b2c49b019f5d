//! The engine: virtual-path operations over the merged namespace, each
//! taking the state lock in the appropriate mode and keeping the parity
//! journal informed of every block that changes.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;

use log::{info, warn};

use crate::config::Config;
use crate::content;
use crate::ctrl::CtrlServer;
use crate::journal::{Journal, DEFAULT_INTERVAL_MS};
use crate::parity::{self, ParityHandle};
use crate::state::{
    blocks_for_size, statvfs_bytes, DirRecord, FileRecord, Shared, State, SymlinkRecord,
};
use crate::Error;

mod fuse;

pub use fuse::LiveRaidFs;

const RENAME_NOREPLACE: u32 = 1 << 0;
const RENAME_EXCHANGE: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// Engine-level stat result; the FUSE adapter turns this into a kernel attr.
#[derive(Debug, Clone)]
pub struct Attr {
    pub kind: FileKind,
    /// Full st_mode including the file-type bits.
    pub mode: u32,
    pub nlink: u32,
    pub size: i64,
    pub uid: u32,
    pub gid: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

/// Per-open state. A read-only open on a drive that is gone still succeeds
/// when parity is configured; such handles answer reads from parity.
#[derive(Debug)]
pub enum FileHandle {
    Live { file: File, vpath: String },
    DeadDrive { vpath: String },
}

impl FileHandle {
    pub fn vpath(&self) -> &str {
        match self {
            Self::Live { vpath, .. } | Self::DeadDrive { vpath } => vpath,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub block_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub name_max: u32,
}

/// The storage engine. Owns the shared state, the journal and the control
/// channel for its whole lifetime.
pub struct Engine {
    shared: Arc<Shared>,
    journal: Option<Journal>,
    ctrl: Option<CtrlServer>,
}

impl Engine {
    /// Full startup for a mount: content load, parity open, journal drainer,
    /// control socket.
    pub fn start(cfg: Config) -> Result<Self, Error> {
        let mut engine = Self::standalone(cfg)?;
        match Journal::start(Arc::clone(&engine.shared), DEFAULT_INTERVAL_MS) {
            Ok(journal) => engine.journal = Some(journal),
            Err(e) => warn!("journal unavailable, parity will not be maintained: {e}"),
        }
        match CtrlServer::start(Arc::clone(&engine.shared)) {
            Ok(ctrl) => engine.ctrl = Some(ctrl),
            Err(e) => warn!("control server unavailable, live rebuild disabled: {e}"),
        }
        Ok(engine)
    }

    /// State + content + parity only; used by offline rebuild and tests that
    /// drive draining explicitly.
    pub fn standalone(cfg: Config) -> Result<Self, Error> {
        let mut state = State::new(&cfg);
        content::load(&cfg, &mut state)?;

        let parity = if cfg.parity_levels() > 0 {
            match ParityHandle::open(&cfg) {
                Ok(ph) => Some(ph),
                Err(e) => {
                    warn!("could not open parity files, running without parity: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                state: RwLock::new(state),
                parity,
            }),
            journal: None,
            ctrl: None,
        })
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn cfg(&self) -> &Config {
        &self.shared.cfg
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    /// Clean shutdown: stop accepting control commands, drain parity, save
    /// the content file, drop the crash journal.
    pub fn shutdown(&mut self) {
        if let Some(mut ctrl) = self.ctrl.take() {
            ctrl.stop();
        }
        if let Some(mut journal) = self.journal.take() {
            journal.flush();
            journal.stop();
        }
        crate::journal::persist_for_shutdown(&self.shared);
        info!("engine shut down");
    }

    fn needs_shutdown(&self) -> bool {
        self.journal.is_some() || self.ctrl.is_some()
    }

    fn mark_dirty(&self, start: u32, count: u32) {
        if let Some(j) = &self.journal {
            j.mark_dirty_range(start, count);
        }
    }

    fn has_parity(&self) -> bool {
        self.shared
            .parity
            .as_ref()
            .map(|p| p.levels() > 0)
            .unwrap_or(false)
    }

    /* ---------------- attribute lookup ---------------- */

    pub fn getattr(&self, vpath: &str) -> Result<Attr, Error> {
        let st = self.shared.read_state();

        if vpath == "/" {
            for d in &st.drives {
                if let Ok(meta) = fs::symlink_metadata(&d.dir) {
                    if meta.is_dir() {
                        let mut attr = attr_from_meta(&meta);
                        attr.nlink = 2;
                        return Ok(attr);
                    }
                }
            }
            return Ok(synthetic_dir_attr(None));
        }

        if let Some(f) = st.find_file(vpath) {
            return Ok(match fs::symlink_metadata(&f.real_path) {
                Ok(meta) => attr_from_meta(&meta),
                // In the table but not on disk: answer from stored metadata.
                Err(_) => Attr {
                    kind: FileKind::File,
                    mode: if f.mode != 0 { f.mode } else { libc::S_IFREG | 0o644 },
                    nlink: 1,
                    size: f.size,
                    uid: f.uid,
                    gid: f.gid,
                    mtime_sec: f.mtime_sec,
                    mtime_nsec: f.mtime_nsec,
                },
            });
        }

        if let Some(sl) = st.find_symlink(vpath) {
            return Ok(Attr {
                kind: FileKind::Symlink,
                mode: libc::S_IFLNK | 0o777,
                nlink: 1,
                size: sl.target.len() as i64,
                uid: sl.uid,
                gid: sl.gid,
                mtime_sec: sl.mtime_sec,
                mtime_nsec: sl.mtime_nsec,
            });
        }

        if is_any_dir(&st, vpath) {
            if let Some(d) = st.find_dir(vpath) {
                return Ok(synthetic_dir_attr(Some(d)));
            }
            for drive in &st.drives {
                let real = drive.real_path(vpath);
                if let Ok(meta) = fs::symlink_metadata(&real) {
                    if meta.is_dir() {
                        let mut attr = attr_from_meta(&meta);
                        attr.nlink = 2;
                        return Ok(attr);
                    }
                }
            }
            return Ok(synthetic_dir_attr(None));
        }

        Err(Error::NotFound)
    }

    /* ---------------- open / release / read / write ---------------- */

    pub fn open(&self, vpath: &str, flags: i32) -> Result<FileHandle, Error> {
        // open_count goes up before the lock drops so live rebuild never
        // sees a zero count for a file that is mid-open.
        let real = {
            let mut st = self.shared.write_state();
            let f = st.find_file_mut(vpath).ok_or(Error::NotFound)?;
            f.open_count += 1;
            f.real_path.clone()
        };

        match open_with_flags(&real, flags & !libc::O_CREAT) {
            Ok(file) => Ok(FileHandle::Live {
                file,
                vpath: vpath.to_string(),
            }),
            Err(e) => {
                let recoverable = matches!(
                    e.raw_os_error(),
                    Some(libc::ENOENT) | Some(libc::EIO) | Some(libc::ENXIO)
                );
                let read_only = flags & libc::O_ACCMODE == libc::O_RDONLY;
                if recoverable && read_only && self.has_parity() {
                    return Ok(FileHandle::DeadDrive {
                        vpath: vpath.to_string(),
                    });
                }
                self.drop_open_count(vpath);
                Err(e.into())
            }
        }
    }

    pub fn release(&self, handle: FileHandle) {
        self.drop_open_count(handle.vpath());
    }

    fn drop_open_count(&self, vpath: &str) {
        let mut st = self.shared.write_state();
        if let Some(f) = st.find_file_mut(vpath) {
            f.open_count = f.open_count.saturating_sub(1);
        }
    }

    pub fn read(&self, handle: &FileHandle, offset: i64, buf: &mut [u8]) -> Result<usize, Error> {
        if let FileHandle::Live { file, .. } = handle {
            match read_full_at(file, buf, offset as u64) {
                Ok(n) => return Ok(n),
                Err(e) if e.raw_os_error() != Some(libc::EIO) => return Err(e.into()),
                Err(_) => {}
            }
        }
        self.read_via_parity(handle.vpath(), offset, buf)
    }

    /// Transparent recovery: answer the read block-by-block from parity.
    fn read_via_parity(&self, vpath: &str, offset: i64, buf: &mut [u8]) -> Result<usize, Error> {
        let st = self.shared.read_state();
        let ph = match &self.shared.parity {
            Some(ph) if ph.levels() > 0 => ph,
            _ => return Err(io::Error::from_raw_os_error(libc::EIO).into()),
        };
        let f = st.find_file(vpath).ok_or(Error::NotFound)?;

        let bs = self.shared.cfg.block_size as u64;
        if offset >= f.size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min((f.size - offset) as u64) as usize;
        if want == 0 || f.block_count == 0 {
            return Ok(0);
        }

        let first_blk = (offset as u64 / bs) as u32;
        let last_blk = (((offset as u64) + want as u64 - 1) / bs) as u32;

        let mut tmp = vec![0u8; bs as usize];
        let mut total = 0usize;
        for blk in first_blk..=last_blk.min(f.block_count - 1) {
            let pos = f.parity_pos_start + blk;
            if parity::recover_block(&st, ph, f.drive_idx, pos, &mut tmp).is_err() {
                return if total > 0 {
                    Ok(total)
                } else {
                    Err(io::Error::from_raw_os_error(libc::EIO).into())
                };
            }
            let blk_base = blk as u64 * bs;
            let copy_start = (offset as u64).saturating_sub(blk_base) as usize;
            let copy_len = (bs as usize - copy_start).min(want - total);
            buf[total..total + copy_len].copy_from_slice(&tmp[copy_start..copy_start + copy_len]);
            total += copy_len;
        }
        Ok(total)
    }

    /// Write through to the real file, then grow the parity position range
    /// if the file got longer, marking everything the write touched dirty.
    ///
    /// The pwrite happens before the state lock is taken, so a concurrent
    /// reader of a range being extended may observe either the old or the
    /// new bytes; writes are never reordered.
    pub fn write(&self, handle: &FileHandle, offset: i64, data: &[u8]) -> Result<usize, Error> {
        let (file, vpath) = match handle {
            FileHandle::Live { file, vpath } => (file, vpath),
            FileHandle::DeadDrive { .. } => {
                return Err(io::Error::from_raw_os_error(libc::EIO).into())
            }
        };

        if data.is_empty() {
            return Ok(0);
        }
        file.write_all_at(data, offset as u64)?;
        let n = data.len();
        let new_end = offset + n as i64;

        let mut st = self.shared.write_state();
        let bs = self.shared.cfg.block_size;
        if let Some(f) = st.find_file(vpath) {
            let drive_idx = f.drive_idx;
            let old_blocks = f.block_count;
            let new_blocks = blocks_for_size(new_end.max(f.size) as u64, bs);

            if new_blocks > old_blocks {
                if let Some((start, count)) =
                    self.grow_positions(&mut st, vpath, old_blocks, new_blocks)
                {
                    self.mark_dirty(start, count);
                }
                st.rebuild_pos_index(drive_idx);
            }

            if let Some(f) = st.find_file_mut(vpath) {
                if new_end > f.size {
                    f.size = new_end;
                }
                let pos_start = f.parity_pos_start;
                let block_count = f.block_count;
                if block_count > 0 {
                    let first_blk = (offset as u64 / bs as u64) as u32;
                    let last_blk = ((offset as u64 + n as u64 - 1) / bs as u64) as u32;
                    if last_blk < block_count {
                        self.mark_dirty(pos_start + first_blk, last_blk - first_blk + 1);
                    }
                }
            }
        }
        Ok(n)
    }

    /// Extend a file's position range: grow in place when it abuts the
    /// high-water mark, otherwise reallocate. Returns the range to mark
    /// dirty, or None when the namespace is exhausted (the file then has no
    /// parity coverage until a later write succeeds).
    fn grow_positions(
        &self,
        st: &mut State,
        vpath: &str,
        old_blocks: u32,
        new_blocks: u32,
    ) -> Option<(u32, u32)> {
        let (drive_idx, pos_start) = {
            let f = st.find_file(vpath)?;
            (f.drive_idx, f.parity_pos_start)
        };
        let alloc = &mut st.drives[drive_idx].alloc;

        let (new_start, dirty) = if old_blocks == 0 {
            match alloc.alloc(new_blocks) {
                Ok(pos) => (pos, (pos, new_blocks)),
                Err(_) => {
                    warn!("parity namespace exhausted for {vpath}");
                    return None;
                }
            }
        } else if pos_start + old_blocks == alloc.next_free() {
            // Range ends at the high-water mark: extend it in place.
            let grown = new_blocks - old_blocks;
            match alloc.bump(grown) {
                Ok(_) => (pos_start, (pos_start + old_blocks, grown)),
                Err(_) => {
                    warn!("parity namespace exhausted for {vpath}");
                    return None;
                }
            }
        } else {
            alloc.free(pos_start, old_blocks);
            match alloc.alloc(new_blocks) {
                Ok(pos) => (pos, (pos, new_blocks)),
                Err(_) => {
                    warn!("parity namespace exhausted for {vpath}");
                    let f = st.find_file_mut(vpath)?;
                    f.block_count = 0;
                    return None;
                }
            }
        };

        let f = st.find_file_mut(vpath)?;
        f.parity_pos_start = new_start;
        f.block_count = new_blocks;
        Some(dirty)
    }

    /* ---------------- create / unlink ---------------- */

    pub fn create(&self, vpath: &str, mode: u32, flags: i32) -> Result<FileHandle, Error> {
        let mut st = self.shared.write_state();

        if let Some(existing) = st.find_file(vpath) {
            // Exists: behave like open, honoring O_TRUNC on our metadata.
            let real = existing.real_path.clone();
            let (drive_idx, pos_start, block_count) = (
                existing.drive_idx,
                existing.parity_pos_start,
                existing.block_count,
            );
            let file = open_with_flags_mode(&real, flags, mode)?;
            if flags & libc::O_TRUNC != 0 {
                if block_count > 0 {
                    self.mark_dirty(pos_start, block_count);
                    st.drives[drive_idx].alloc.free(pos_start, block_count);
                }
                if let Some(f) = st.find_file_mut(vpath) {
                    f.block_count = 0;
                    f.size = 0;
                }
                st.rebuild_pos_index(drive_idx);
            }
            if let Some(f) = st.find_file_mut(vpath) {
                f.open_count += 1;
            }
            return Ok(FileHandle::Live {
                file,
                vpath: vpath.to_string(),
            });
        }

        let drive_idx = st
            .pick_drive(self.shared.cfg.placement)
            .ok_or(Error::NamespaceExhausted)?;
        let real = st.drives[drive_idx].real_path(vpath);

        mkdirs_inherit(&st, drive_idx, &real);
        let file = open_with_flags_mode(&real, flags | libc::O_CREAT, mode)?;

        // Zero-length allocation probes the drive's high-water mark; the
        // first write claims real positions.
        let pos_start = st.drives[drive_idx].alloc.alloc(0)?;

        let mut record = FileRecord {
            vpath: vpath.to_string(),
            real_path: real,
            drive_idx,
            size: 0,
            parity_pos_start: pos_start,
            block_count: 0,
            mtime_sec: now_secs(),
            mtime_nsec: 0,
            mode: libc::S_IFREG | (mode & 0o777),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            open_count: 1,
        };
        // Capture what the kernel actually assigned.
        if let Ok(meta) = file.metadata() {
            record.mode = meta.mode();
            record.uid = meta.uid();
            record.gid = meta.gid();
        }
        st.insert_file(record);
        st.rebuild_pos_index(drive_idx);

        Ok(FileHandle::Live {
            file,
            vpath: vpath.to_string(),
        })
    }

    pub fn unlink(&self, vpath: &str) -> Result<(), Error> {
        let real = {
            let mut st = self.shared.write_state();
            let f = match st.remove_file(vpath) {
                Some(f) => f,
                None => {
                    return if st.remove_symlink(vpath).is_some() {
                        Ok(())
                    } else {
                        Err(Error::NotFound)
                    };
                }
            };
            if f.block_count > 0 {
                // Parity must forget these blocks: mark them so the drainer
                // re-encodes the positions with this file gone.
                self.mark_dirty(f.parity_pos_start, f.block_count);
                st.drives[f.drive_idx]
                    .alloc
                    .free(f.parity_pos_start, f.block_count);
            }
            st.rebuild_pos_index(f.drive_idx);
            f.real_path
        };

        // Outside the lock; a dead drive's unlink still succeeds table-side.
        let _ = fs::remove_file(real);
        Ok(())
    }

    /* ---------------- rename ---------------- */

    pub fn rename(&self, from: &str, to: &str, flags: u32) -> Result<(), Error> {
        if flags & RENAME_EXCHANGE != 0 {
            return Err(Error::Invalid("RENAME_EXCHANGE is not supported".into()));
        }

        let mut st = self.shared.write_state();

        if st.find_file(from).is_none() {
            if !is_any_dir(&st, from) {
                return self.rename_symlink(&mut st, from, to, flags);
            }
            return self.rename_dir(&mut st, from, to, flags);
        }

        if from == to {
            return Ok(());
        }
        if flags & RENAME_NOREPLACE != 0 && st.find_file(to).is_some() {
            return Err(Error::Exists);
        }

        let mut f = match st.remove_file(from) {
            Some(f) => f,
            None => return Err(Error::NotFound),
        };
        let old_real = f.real_path.clone();
        let new_real = st.drives[f.drive_idx].real_path(to);

        mkdirs_inherit(&st, f.drive_idx, &new_real);
        if let Err(e) = fs::rename(&old_real, &new_real) {
            // Roll back: the record keeps its original identity.
            st.insert_file(f);
            return Err(e.into());
        }

        // The destination's previous state, if any, is gone now.
        if let Some(existing) = st.remove_file(to) {
            if existing.block_count > 0 {
                self.mark_dirty(existing.parity_pos_start, existing.block_count);
                st.drives[existing.drive_idx]
                    .alloc
                    .free(existing.parity_pos_start, existing.block_count);
            }
            st.rebuild_pos_index(existing.drive_idx);
        }

        f.vpath = to.to_string();
        f.real_path = new_real;
        st.insert_file(f);
        Ok(())
    }

    fn rename_symlink(
        &self,
        st: &mut State,
        from: &str,
        to: &str,
        flags: u32,
    ) -> Result<(), Error> {
        if st.find_symlink(from).is_none() {
            return Err(Error::NotFound);
        }
        if flags & RENAME_NOREPLACE != 0
            && (st.find_file(to).is_some() || st.find_symlink(to).is_some())
        {
            return Err(Error::Exists);
        }
        st.remove_symlink(to);
        let mut sl = match st.remove_symlink(from) {
            Some(sl) => sl,
            None => return Err(Error::NotFound),
        };
        sl.vpath = to.to_string();
        st.insert_symlink(sl);
        Ok(())
    }

    fn rename_dir(&self, st: &mut State, from: &str, to: &str, flags: u32) -> Result<(), Error> {
        if flags & RENAME_NOREPLACE != 0 && is_any_dir(st, to) {
            return Err(Error::Exists);
        }

        // Move the real backing directory on every drive that has one.
        for drive in &st.drives {
            let real_from = drive.real_path(from);
            if real_dir_exists(&real_from) {
                fs::rename(&real_from, drive.real_path(to))?;
            }
        }

        let prefix = format!("{from}/");
        let moved_files: Vec<String> = st
            .files
            .keys()
            .filter(|k| *k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        let mut touched_drives = BTreeSet::new();
        for key in moved_files {
            if let Some(mut f) = st.remove_file(&key) {
                f.vpath = format!("{to}{}", &key[from.len()..]);
                f.real_path = st.drives[f.drive_idx].real_path(&f.vpath);
                touched_drives.insert(f.drive_idx);
                st.insert_file(f);
            }
        }
        for idx in touched_drives {
            st.rebuild_pos_index(idx);
        }

        let moved_dirs: Vec<String> = st
            .dirs
            .keys()
            .filter(|k| *k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved_dirs {
            if let Some(mut d) = st.remove_dir(&key) {
                d.vpath = format!("{to}{}", &key[from.len()..]);
                st.insert_dir(d);
            }
        }
        Ok(())
    }

    /* ---------------- directories ---------------- */

    pub fn mkdir(&self, vpath: &str, mode: u32) -> Result<(), Error> {
        let mut st = self.shared.write_state();
        let drive_idx = st
            .pick_drive(self.shared.cfg.placement)
            .ok_or(Error::NamespaceExhausted)?;
        let real = st.drives[drive_idx].real_path(vpath);

        mkdirs_inherit(&st, drive_idx, &real);
        DirBuilder::new().mode(mode).create(&real)?;

        let mut record = DirRecord {
            vpath: vpath.to_string(),
            mode: libc::S_IFDIR | (mode & 0o7777),
            uid: 0,
            gid: 0,
            mtime_sec: now_secs(),
            mtime_nsec: 0,
        };
        if let Ok(meta) = fs::symlink_metadata(&real) {
            record.mode = meta.mode();
            record.uid = meta.uid();
            record.gid = meta.gid();
            record.mtime_sec = meta.mtime();
            record.mtime_nsec = meta.mtime_nsec();
        }
        st.insert_dir(record);
        Ok(())
    }

    pub fn rmdir(&self, vpath: &str) -> Result<(), Error> {
        // Real rmdir first on every drive; if any refuses, the virtual
        // directory stays.
        let reals: Vec<_> = {
            let st = self.shared.read_state();
            st.drives.iter().map(|d| d.real_path(vpath)).collect()
        };
        let mut failure = None;
        for real in reals {
            if let Err(e) = fs::remove_dir(&real) {
                if e.raw_os_error() != Some(libc::ENOENT) {
                    failure = Some(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(if e.raw_os_error() == Some(libc::ENOTEMPTY) {
                Error::NotEmpty
            } else {
                e.into()
            });
        }

        self.shared.write_state().remove_dir(vpath);
        Ok(())
    }

    pub fn readdir(&self, vpath: &str) -> Result<Vec<DirEntry>, Error> {
        let mut entries = Vec::new();
        let mut seen = BTreeSet::new();

        let st = self.shared.read_state();
        let prefix = if vpath == "/" {
            "/".to_string()
        } else {
            format!("{vpath}/")
        };

        for f in st.files.keys() {
            if let Some(rest) = f.strip_prefix(&prefix) {
                if rest.is_empty() {
                    continue;
                }
                let (name, deeper) = match rest.split_once('/') {
                    Some((head, _)) => (head, true),
                    None => (rest, false),
                };
                if seen.insert(name.to_string()) {
                    entries.push(DirEntry {
                        name: name.to_string(),
                        kind: if deeper {
                            FileKind::Directory
                        } else {
                            FileKind::File
                        },
                    });
                }
            }
        }

        for s in st.symlinks.keys() {
            if let Some(rest) = s.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(DirEntry {
                        name: rest.to_string(),
                        kind: FileKind::Symlink,
                    });
                }
            }
        }

        // Real directories cover empty dirs created by mkdir.
        for drive in &st.drives {
            let real = drive.real_path(vpath);
            let iter = match fs::read_dir(&real) {
                Ok(iter) => iter,
                Err(_) => continue,
            };
            for entry in iter.flatten() {
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if !is_dir {
                    continue; // files belong to the file table
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if seen.insert(name.clone()) {
                    entries.push(DirEntry {
                        name,
                        kind: FileKind::Directory,
                    });
                }
            }
        }

        Ok(entries)
    }

    /* ---------------- metadata ops ---------------- */

    pub fn truncate(&self, vpath: &str, size: i64) -> Result<(), Error> {
        let mut st = self.shared.write_state();
        let f = st.find_file(vpath).ok_or(Error::NotFound)?;
        let (drive_idx, old_blocks, pos_start) = (f.drive_idx, f.block_count, f.parity_pos_start);
        let real = f.real_path.clone();

        OpenOptions::new()
            .write(true)
            .open(&real)
            .and_then(|file| file.set_len(size as u64))?;

        let bs = self.shared.cfg.block_size;
        let new_blocks = blocks_for_size(size as u64, bs);
        if let Some(f) = st.find_file_mut(vpath) {
            f.size = size;
        }

        if new_blocks > old_blocks {
            match self.grow_positions(&mut st, vpath, old_blocks, new_blocks) {
                Some((start, count)) => self.mark_dirty(start, count),
                None => {
                    st.rebuild_pos_index(drive_idx);
                    return Err(Error::NamespaceExhausted);
                }
            }
        } else if new_blocks < old_blocks {
            self.mark_dirty(pos_start + new_blocks, old_blocks - new_blocks);
            st.drives[drive_idx]
                .alloc
                .free(pos_start + new_blocks, old_blocks - new_blocks);
            if let Some(f) = st.find_file_mut(vpath) {
                f.block_count = new_blocks;
            }
        }
        st.rebuild_pos_index(drive_idx);
        Ok(())
    }

    pub fn chmod(&self, vpath: &str, mode: u32) -> Result<(), Error> {
        let mut st = self.shared.write_state();

        if let Some(f) = st.find_file(vpath) {
            let real = f.real_path.clone();
            fs::set_permissions(&real, fs::Permissions::from_mode(mode & 0o7777))?;
            if let Some(f) = st.find_file_mut(vpath) {
                f.mode = (f.mode & !0o7777) | (mode & 0o7777);
            }
            return Ok(());
        }

        if st.find_symlink(vpath).is_some() {
            return Ok(()); // mode is meaningless on our symlinks
        }

        if is_any_dir(&st, vpath) {
            let mut applied = false;
            for i in 0..st.drives.len() {
                let real = st.drives[i].real_path(vpath);
                if real_dir_exists(&real)
                    && fs::set_permissions(&real, fs::Permissions::from_mode(mode & 0o7777)).is_ok()
                {
                    applied = true;
                }
            }
            let virtual_dir = is_virtual_dir(&st, vpath);
            let d = dir_get_or_create(&mut st, vpath);
            d.mode = (d.mode & !0o7777) | (mode & 0o7777);
            if applied || virtual_dir {
                return Ok(());
            }
            return Err(Error::NotFound);
        }

        Err(Error::NotFound)
    }

    pub fn chown(&self, vpath: &str, uid: Option<u32>, gid: Option<u32>) -> Result<(), Error> {
        let mut st = self.shared.write_state();

        if let Some(f) = st.find_file(vpath) {
            let real = f.real_path.clone();
            std::os::unix::fs::lchown(&real, uid, gid)?;
            if let Some(f) = st.find_file_mut(vpath) {
                if let Some(uid) = uid {
                    f.uid = uid;
                }
                if let Some(gid) = gid {
                    f.gid = gid;
                }
            }
            return Ok(());
        }

        if let Some(sl) = st.symlinks.get_mut(vpath) {
            if let Some(uid) = uid {
                sl.uid = uid;
            }
            if let Some(gid) = gid {
                sl.gid = gid;
            }
            return Ok(());
        }

        if is_any_dir(&st, vpath) {
            let mut applied = false;
            for i in 0..st.drives.len() {
                let real = st.drives[i].real_path(vpath);
                if real_dir_exists(&real) && std::os::unix::fs::lchown(&real, uid, gid).is_ok() {
                    applied = true;
                }
            }
            let virtual_dir = is_virtual_dir(&st, vpath);
            let d = dir_get_or_create(&mut st, vpath);
            if let Some(uid) = uid {
                d.uid = uid;
            }
            if let Some(gid) = gid {
                d.gid = gid;
            }
            if applied || virtual_dir {
                return Ok(());
            }
            return Err(Error::NotFound);
        }

        Err(Error::NotFound)
    }

    pub fn utimens(
        &self,
        vpath: &str,
        atime: Option<(i64, i64)>,
        mtime: Option<(i64, i64)>,
    ) -> Result<(), Error> {
        let mut st = self.shared.write_state();

        if let Some(f) = st.find_file(vpath) {
            let real = f.real_path.clone();
            utimens_path(&real, atime, mtime)?;
            if let Ok(meta) = fs::symlink_metadata(&real) {
                if let Some(f) = st.find_file_mut(vpath) {
                    f.mtime_sec = meta.mtime();
                    f.mtime_nsec = meta.mtime_nsec();
                }
            }
            return Ok(());
        }

        if let Some(sl) = st.symlinks.get_mut(vpath) {
            if let Some((sec, nsec)) = mtime {
                sl.mtime_sec = sec;
                sl.mtime_nsec = nsec;
            }
            return Ok(());
        }

        if is_any_dir(&st, vpath) {
            let mut applied = false;
            for i in 0..st.drives.len() {
                let real = st.drives[i].real_path(vpath);
                if real_dir_exists(&real) && utimens_path(&real, atime, mtime).is_ok() {
                    applied = true;
                    let meta = fs::symlink_metadata(&real).ok();
                    let d = dir_get_or_create(&mut st, vpath);
                    if let Some(meta) = meta {
                        d.mtime_sec = meta.mtime();
                        d.mtime_nsec = meta.mtime_nsec();
                    }
                }
            }
            if !applied && is_virtual_dir(&st, vpath) {
                if let Some((sec, nsec)) = mtime {
                    let d = dir_get_or_create(&mut st, vpath);
                    d.mtime_sec = sec;
                    d.mtime_nsec = nsec;
                }
                applied = true;
            }
            if applied {
                return Ok(());
            }
            return Err(Error::NotFound);
        }

        Err(Error::NotFound)
    }

    /* ---------------- symlinks ---------------- */

    pub fn symlink(&self, target: &str, link: &str, uid: u32, gid: u32) -> Result<(), Error> {
        let mut st = self.shared.write_state();
        if st.find_file(link).is_some()
            || st.find_dir(link).is_some()
            || st.find_symlink(link).is_some()
        {
            return Err(Error::Exists);
        }
        st.insert_symlink(SymlinkRecord {
            vpath: link.to_string(),
            target: target.to_string(),
            uid,
            gid,
            mtime_sec: now_secs(),
            mtime_nsec: 0,
        });
        Ok(())
    }

    pub fn readlink(&self, vpath: &str) -> Result<String, Error> {
        let st = self.shared.read_state();
        st.find_symlink(vpath)
            .map(|sl| sl.target.clone())
            .ok_or(Error::NotFound)
    }

    /* ---------------- durability ---------------- */

    /// fsync: the real data first, then parity for this file's positions.
    /// On return both are on disk.
    pub fn fsync(&self, handle: &FileHandle, datasync: bool) -> Result<(), Error> {
        let file = match handle {
            FileHandle::Live { file, .. } => file,
            FileHandle::DeadDrive { .. } => {
                return Err(io::Error::from_raw_os_error(libc::EIO).into())
            }
        };
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }

        if let Some(journal) = &self.journal {
            let range = {
                let st = self.shared.read_state();
                st.find_file(handle.vpath())
                    .map(|f| (f.parity_pos_start, f.block_count))
            };
            if let Some((start, count)) = range {
                if count > 0 {
                    journal.mark_dirty_range(start, count);
                }
            }
            journal.flush();
        }
        Ok(())
    }

    /// Aggregate free space across drives, byte-normalized so drives with
    /// different fragment sizes are comparable.
    pub fn statfs(&self) -> StatFs {
        let dirs: Vec<_> = {
            let st = self.shared.read_state();
            st.drives.iter().map(|d| d.dir.clone()).collect()
        };

        let mut total = 0u64;
        let mut free = 0u64;
        let mut avail = 0u64;
        let mut bsize = 4096u64;
        for dir in dirs {
            if let Some((t, f, a, frsize)) = statvfs_bytes(&dir) {
                total += t;
                free += f;
                avail += a;
                bsize = bsize.max(frsize);
            }
        }

        StatFs {
            block_size: bsize,
            blocks: total / bsize,
            blocks_free: free / bsize,
            blocks_avail: avail / bsize,
            name_max: 255,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Safety net for paths that never reach destroy(): a dropped engine
        // must still join its threads and save the content file.
        if self.needs_shutdown() {
            self.shutdown();
        }
    }
}

/* ---------------- helpers ---------------- */

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn attr_from_meta(meta: &fs::Metadata) -> Attr {
    let kind = if meta.is_dir() {
        FileKind::Directory
    } else if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    };
    Attr {
        kind,
        mode: meta.mode(),
        nlink: meta.nlink() as u32,
        size: meta.size() as i64,
        uid: meta.uid(),
        gid: meta.gid(),
        mtime_sec: meta.mtime(),
        mtime_nsec: meta.mtime_nsec(),
    }
}

/// Synthetic ancestors report 0755, owner 0:0, mtime epoch.
fn synthetic_dir_attr(d: Option<&DirRecord>) -> Attr {
    match d {
        Some(d) => Attr {
            kind: FileKind::Directory,
            mode: libc::S_IFDIR | (d.mode & 0o7777),
            nlink: 2,
            size: 0,
            uid: d.uid,
            gid: d.gid,
            mtime_sec: d.mtime_sec,
            mtime_nsec: d.mtime_nsec,
        },
        None => Attr {
            kind: FileKind::Directory,
            mode: libc::S_IFDIR | 0o755,
            nlink: 2,
            size: 0,
            uid: 0,
            gid: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
        },
    }
}

/// Does some file live at or beneath `vpath`?
fn is_virtual_dir(st: &State, vpath: &str) -> bool {
    if vpath == "/" {
        return true;
    }
    if st.files.contains_key(vpath) {
        return true;
    }
    // Keys starting with "vpath/" are contiguous in the ordered map.
    let prefix = format!("{vpath}/");
    st.files
        .range(prefix.clone()..)
        .next()
        .map(|(k, _)| k.starts_with(&prefix))
        .unwrap_or(false)
}

/// A directory either implied by file paths or actually present on a drive.
fn is_any_dir(st: &State, vpath: &str) -> bool {
    if st.find_dir(vpath).is_some() || is_virtual_dir(st, vpath) {
        return true;
    }
    st.drives
        .iter()
        .any(|d| real_dir_exists(&d.real_path(vpath)))
}

fn real_dir_exists(real: &Path) -> bool {
    fs::symlink_metadata(real)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Find or create the dir record, seeding metadata from the first real
/// backing directory.
fn dir_get_or_create<'a>(st: &'a mut State, vpath: &str) -> &'a mut DirRecord {
    if st.find_dir(vpath).is_none() {
        let mut record = DirRecord {
            vpath: vpath.to_string(),
            mode: libc::S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
        };
        for drive in &st.drives {
            if let Ok(meta) = fs::symlink_metadata(drive.real_path(vpath)) {
                if meta.is_dir() {
                    record.mode = meta.mode();
                    record.uid = meta.uid();
                    record.gid = meta.gid();
                    record.mtime_sec = meta.mtime();
                    record.mtime_nsec = meta.mtime_nsec();
                    break;
                }
            }
        }
        st.insert_dir(record);
    }
    let vpath = vpath.to_string();
    st.dirs.entry(vpath.clone()).or_insert_with(|| DirRecord {
        vpath,
        mode: libc::S_IFDIR | 0o755,
        uid: 0,
        gid: 0,
        mtime_sec: 0,
        mtime_nsec: 0,
    })
}

/// Create missing parents of `real_file` on `drive_idx`, copying each
/// component's mode from the matching directory on another drive when one
/// exists (fallback 0755).
fn mkdirs_inherit(st: &State, drive_idx: usize, real_file: &Path) {
    let drive_dir = &st.drives[drive_idx].dir;
    let parent = match real_file.parent() {
        Some(p) => p,
        None => return,
    };
    let rel = match parent.strip_prefix(drive_dir) {
        Ok(rel) => rel,
        Err(_) => return,
    };

    let mut cur = drive_dir.clone();
    let mut vpath = String::new();
    for comp in rel.components() {
        cur.push(comp);
        vpath.push('/');
        vpath.push_str(&comp.as_os_str().to_string_lossy());
        if fs::symlink_metadata(&cur).is_ok() {
            continue;
        }
        let mut mode = 0o755;
        for (i, other) in st.drives.iter().enumerate() {
            if i == drive_idx {
                continue;
            }
            if let Ok(meta) = fs::symlink_metadata(other.real_path(&vpath)) {
                if meta.is_dir() {
                    mode = meta.mode() & 0o7777;
                    break;
                }
            }
        }
        let _ = DirBuilder::new().mode(mode).create(&cur);
    }
}

fn open_with_flags(path: &Path, flags: i32) -> io::Result<File> {
    let acc = flags & libc::O_ACCMODE;
    let mut opts = OpenOptions::new();
    opts.read(acc == libc::O_RDONLY || acc == libc::O_RDWR);
    opts.write(acc == libc::O_WRONLY || acc == libc::O_RDWR);
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    if flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    opts.custom_flags(flags & !(libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND | libc::O_ACCMODE));
    opts.open(path)
}

fn open_with_flags_mode(path: &Path, flags: i32, mode: u32) -> Result<File, Error> {
    let acc = flags & libc::O_ACCMODE;
    let mut opts = OpenOptions::new();
    opts.read(acc == libc::O_RDONLY || acc == libc::O_RDWR);
    opts.write(acc == libc::O_WRONLY || acc == libc::O_RDWR);
    if flags & libc::O_CREAT != 0 {
        opts.create(true);
        opts.mode(mode & 0o7777);
    }
    if flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    opts.custom_flags(flags & !(libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND | libc::O_ACCMODE));
    Ok(opts.open(path)?)
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read_at(&mut buf[total..], offset + total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn utimens_path(
    path: &Path,
    atime: Option<(i64, i64)>,
    mtime: Option<(i64, i64)>,
) -> io::Result<()> {
    fn ts(t: Option<(i64, i64)>) -> libc::timespec {
        match t {
            Some((sec, nsec)) => libc::timespec {
                tv_sec: sec,
                tv_nsec: nsec,
            },
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
        }
    }
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let times = [ts(atime), ts(mtime)];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{Engine, FileHandle, FileKind};
    use crate::config::Config;
    use crate::parity;

    fn engine(tmp: &TempDir, nd: usize, np: usize, placement: &str) -> Engine {
        let root = tmp.path();
        let mut text = String::new();
        for d in 0..nd {
            let dir = root.join(format!("d{d}"));
            fs::create_dir_all(&dir).unwrap();
            text.push_str(&format!("data d{d} {}\n", dir.display()));
        }
        for p in 0..np {
            text.push_str(&format!(
                "parity {} {}\n",
                p + 1,
                root.join(format!("parity{p}")).display()
            ));
        }
        text.push_str(&format!("content {}\n", root.join("content").display()));
        text.push_str(&format!("mountpoint {}\n", root.join("mnt").display()));
        text.push_str(&format!("blocksize 1\nplacement {placement}\n"));
        Engine::start(Config::parse(&text).unwrap()).unwrap()
    }

    fn create_write(engine: &Engine, vpath: &str, body: &[u8]) {
        let h = engine.create(vpath, 0o644, libc::O_WRONLY).unwrap();
        engine.write(&h, 0, body).unwrap();
        engine.release(h);
    }

    #[test]
    fn create_write_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 2, 1, "roundrobin");
        create_write(&engine, "/hello", b"hello world");

        let attr = engine.getattr("/hello").unwrap();
        assert_eq!(attr.kind, FileKind::File);
        assert_eq!(attr.size, 11);

        let h = engine.open("/hello", libc::O_RDONLY).unwrap();
        let mut buf = [0u8; 32];
        let n = engine.read(&h, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        engine.release(h);
        engine.shutdown();
    }

    #[test]
    fn dead_drive_read_recovers_from_parity() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 3, 2, "roundrobin");
        let bodies: Vec<Vec<u8>> = (0..6u8)
            .map(|k| format!("content of file {k}").into_bytes())
            .collect();
        for (k, body) in bodies.iter().enumerate() {
            create_write(&engine, &format!("/f{k}"), body);
        }
        engine.journal().unwrap().flush();

        // Erase two drives' backing files behind the engine's back.
        let victims: Vec<_> = {
            let st = engine.shared().read_state();
            st.files
                .values()
                .filter(|f| f.drive_idx < 2)
                .map(|f| f.real_path.clone())
                .collect()
        };
        assert!(!victims.is_empty());
        for path in victims {
            fs::remove_file(path).unwrap();
        }

        for (k, body) in bodies.iter().enumerate() {
            let h = engine.open(&format!("/f{k}"), libc::O_RDONLY).unwrap();
            let mut buf = vec![0u8; 64];
            let n = engine.read(&h, 0, &mut buf).unwrap();
            assert_eq!(&buf[..n], &body[..], "file {k}");
            engine.release(h);
        }
        engine.shutdown();
    }

    #[test]
    fn unlinked_position_is_reused() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 1, 1, "roundrobin");
        create_write(&engine, "/a", b"x");
        engine.journal().unwrap().flush();
        engine.unlink("/a").unwrap();
        create_write(&engine, "/b", b"x");

        let st = engine.shared().read_state();
        assert_eq!(st.find_file("/b").unwrap().parity_pos_start, 0);
        drop(st);
        engine.shutdown();
    }

    #[test]
    fn write_extension_grows_in_place() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 1, 1, "roundrobin");
        let h = engine.create("/grow", 0o644, libc::O_WRONLY).unwrap();
        engine.write(&h, 0, &[1u8; 1024]).unwrap();
        engine.write(&h, 1024, &[2u8; 2048]).unwrap();
        engine.release(h);

        let st = engine.shared().read_state();
        let f = st.find_file("/grow").unwrap();
        assert_eq!(f.parity_pos_start, 0);
        assert_eq!(f.block_count, 3);
        assert_eq!(f.size, 3072);
        drop(st);
        engine.shutdown();
    }

    #[test]
    fn truncate_shrinks_and_frees() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 1, 1, "roundrobin");
        create_write(&engine, "/t", &[9u8; 4096]);
        engine.truncate("/t", 1000).unwrap();

        let st = engine.shared().read_state();
        let f = st.find_file("/t").unwrap();
        assert_eq!(f.size, 1000);
        assert_eq!(f.block_count, 1);
        assert_eq!(st.drives[0].alloc.next_free(), 1);
        drop(st);
        engine.shutdown();
    }

    #[test]
    fn rename_file_and_directory() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 2, 0, "roundrobin");
        engine.mkdir("/dir", 0o755).unwrap();
        create_write(&engine, "/dir/a", b"aa");
        create_write(&engine, "/dir/b", b"bb");

        engine.rename("/dir/a", "/dir/c", 0).unwrap();
        assert!(engine.getattr("/dir/a").is_err());
        assert_eq!(engine.getattr("/dir/c").unwrap().size, 2);

        engine.rename("/dir", "/moved", 0).unwrap();
        assert_eq!(engine.getattr("/moved/c").unwrap().size, 2);
        assert_eq!(engine.getattr("/moved/b").unwrap().size, 2);
        assert!(engine.getattr("/dir/b").is_err());

        // NOREPLACE refuses an occupied destination.
        assert!(matches!(
            engine.rename("/moved/b", "/moved/c", super::RENAME_NOREPLACE),
            Err(crate::Error::Exists)
        ));
        // EXCHANGE is unsupported.
        assert!(engine
            .rename("/moved/b", "/moved/c", super::RENAME_EXCHANGE)
            .is_err());
        engine.shutdown();
    }

    #[test]
    fn mkdir_rmdir_and_readdir() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 2, 0, "roundrobin");
        engine.mkdir("/sub", 0o750).unwrap();
        create_write(&engine, "/sub/f", b"z");
        engine.symlink("/sub/f", "/l", 0, 0).unwrap();

        let names: Vec<String> = engine
            .readdir("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&"sub".to_string()));
        assert!(names.contains(&"l".to_string()));

        assert!(matches!(engine.rmdir("/sub"), Err(crate::Error::NotEmpty)));
        engine.unlink("/sub/f").unwrap();
        engine.rmdir("/sub").unwrap();
        assert!(engine.getattr("/sub").is_err());
        engine.shutdown();
    }

    #[test]
    fn symlink_round_trip_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 1, 0, "roundrobin");
        engine.symlink("/t", "/l", 1000, 100).unwrap();
        assert_eq!(engine.readlink("/l").unwrap(), "/t");
        let attr = engine.getattr("/l").unwrap();
        assert_eq!(attr.kind, FileKind::Symlink);
        assert_eq!(attr.mode & 0o7777, 0o777);
        let cfg = engine.cfg().clone();
        engine.shutdown();

        // Remount: the symlink came back from the content file.
        let mut engine = Engine::start(cfg).unwrap();
        assert_eq!(engine.readlink("/l").unwrap(), "/t");
        engine.unlink("/l").unwrap();
        assert!(engine.readlink("/l").is_err());
        engine.shutdown();
    }

    #[test]
    fn fsync_makes_parity_durable() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 2, 1, "roundrobin");
        let h = engine.create("/d", 0o644, libc::O_RDWR).unwrap();
        engine.write(&h, 0, &[0x11u8; 2000]).unwrap();
        engine.fsync(&h, true).unwrap();
        engine.release(h);

        let result = parity::scrub(engine.shared(), false);
        assert_eq!(result.mismatches, 0);
        assert_eq!(result.read_errors, 0);
        engine.shutdown();
    }

    #[test]
    fn dead_drive_write_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 1, 1, "roundrobin");
        create_write(&engine, "/w", b"data");
        engine.journal().unwrap().flush();
        let real = engine
            .shared()
            .read_state()
            .find_file("/w")
            .unwrap()
            .real_path
            .clone();
        fs::remove_file(&real).unwrap();

        let h = engine.open("/w", libc::O_RDONLY).unwrap();
        assert!(matches!(h, FileHandle::DeadDrive { .. }));
        assert!(engine.write(&h, 0, b"nope").is_err());
        engine.release(h);

        // A write-mode open on the dead drive fails outright.
        assert!(engine.open("/w", libc::O_RDWR).is_err());
        engine.shutdown();
    }

    #[test]
    fn statfs_aggregates() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 2, 0, "roundrobin");
        let sf = engine.statfs();
        assert!(sf.block_size >= 4096);
        assert!(sf.blocks > 0);
        engine.shutdown();
    }
}
