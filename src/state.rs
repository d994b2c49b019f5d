use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rand::Rng;

use crate::alloc::PosAllocator;
use crate::config::{Config, Placement};
use crate::parity::ParityHandle;

/// One data drive: a directory on some real filesystem plus the allocator
/// for its parity-position namespace.
#[derive(Debug)]
pub struct Drive {
    pub name: String,
    pub dir: PathBuf,
    pub idx: usize,
    pub alloc: PosAllocator,
}

impl Drive {
    /// Real path backing `vpath` on this drive. `vpath` is absolute within
    /// the virtual namespace; `"/"` maps to the drive directory itself.
    pub fn real_path(&self, vpath: &str) -> PathBuf {
        let rel = vpath.strip_prefix('/').unwrap_or(vpath);
        if rel.is_empty() {
            self.dir.clone()
        } else {
            self.dir.join(rel)
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub vpath: String,
    pub real_path: PathBuf,
    pub drive_idx: usize,
    pub size: i64,
    pub parity_pos_start: u32,
    pub block_count: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    /// Full st_mode, e.g. S_IFREG | 0644.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Outstanding open handles, guarded by the state lock.
    pub open_count: u32,
}

#[derive(Debug, Clone)]
pub struct DirRecord {
    pub vpath: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

#[derive(Debug, Clone)]
pub struct SymlinkRecord {
    pub vpath: String,
    pub target: String,
    pub uid: u32,
    pub gid: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

/// Position-index entry for the parity drainer's reverse lookup.
#[derive(Debug, Clone)]
pub struct PosEntry {
    pub pos_start: u32,
    pub block_count: u32,
    pub vpath: String,
}

/// In-memory tables, guarded as a whole by the lock in [`Shared`].
///
/// Records are keyed on vpath in ordered maps, so iteration for the content
/// snapshot and prefix scans for rename/readdir need no second container.
#[derive(Debug)]
pub struct State {
    pub drives: Vec<Drive>,
    pub files: BTreeMap<String, FileRecord>,
    pub dirs: BTreeMap<String, DirRecord>,
    pub symlinks: BTreeMap<String, SymlinkRecord>,
    pos_index: Vec<Vec<PosEntry>>,
    rr_next: usize,
}

impl State {
    pub fn new(cfg: &Config) -> Self {
        let drives: Vec<Drive> = cfg
            .drives
            .iter()
            .enumerate()
            .map(|(idx, dc)| Drive {
                name: dc.name.clone(),
                dir: dc.dir.clone(),
                idx,
                alloc: PosAllocator::new(),
            })
            .collect();
        let pos_index = vec![Vec::new(); drives.len()];
        Self {
            drives,
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
            symlinks: BTreeMap::new(),
            pos_index,
            rr_next: 0,
        }
    }

    pub fn drive_by_name(&self, name: &str) -> Option<&Drive> {
        self.drives.iter().find(|d| d.name == name)
    }

    pub fn insert_file(&mut self, f: FileRecord) {
        self.files.insert(f.vpath.clone(), f);
    }

    pub fn find_file(&self, vpath: &str) -> Option<&FileRecord> {
        self.files.get(vpath)
    }

    pub fn find_file_mut(&mut self, vpath: &str) -> Option<&mut FileRecord> {
        self.files.get_mut(vpath)
    }

    /// Detach the record; ownership moves to the caller.
    pub fn remove_file(&mut self, vpath: &str) -> Option<FileRecord> {
        self.files.remove(vpath)
    }

    pub fn insert_dir(&mut self, d: DirRecord) {
        self.dirs.insert(d.vpath.clone(), d);
    }

    pub fn find_dir(&self, vpath: &str) -> Option<&DirRecord> {
        self.dirs.get(vpath)
    }

    pub fn remove_dir(&mut self, vpath: &str) -> Option<DirRecord> {
        self.dirs.remove(vpath)
    }

    pub fn insert_symlink(&mut self, s: SymlinkRecord) {
        self.symlinks.insert(s.vpath.clone(), s);
    }

    pub fn find_symlink(&self, vpath: &str) -> Option<&SymlinkRecord> {
        self.symlinks.get(vpath)
    }

    pub fn remove_symlink(&mut self, vpath: &str) -> Option<SymlinkRecord> {
        self.symlinks.remove(vpath)
    }

    /// Select a drive for a new file. `None` when no drives are configured.
    pub fn pick_drive(&mut self, placement: Placement) -> Option<usize> {
        if self.drives.is_empty() {
            return None;
        }
        match placement {
            Placement::RoundRobin => {
                let idx = self.rr_next % self.drives.len();
                self.rr_next += 1;
                Some(idx)
            }
            Placement::MostFree => {
                let mut best = 0;
                let mut best_free = 0u64;
                for (i, d) in self.drives.iter().enumerate() {
                    let free = avail_bytes(&d.dir).unwrap_or(0);
                    if free > best_free {
                        best_free = free;
                        best = i;
                    }
                }
                Some(best)
            }
            Placement::LeastFree => {
                let mut best = 0;
                let mut best_free = u64::MAX;
                for (i, d) in self.drives.iter().enumerate() {
                    match avail_bytes(&d.dir) {
                        Some(free) if free > 0 && free < best_free => {
                            best_free = free;
                            best = i;
                        }
                        _ => {}
                    }
                }
                Some(best)
            }
            Placement::ProportionalRandom => {
                let weights: Vec<u64> = self
                    .drives
                    .iter()
                    .map(|d| avail_bytes(&d.dir).unwrap_or(0))
                    .collect();
                let total: u64 = weights.iter().sum();
                let mut rng = rand::thread_rng();
                if total == 0 {
                    return Some(rng.gen_range(0..self.drives.len()));
                }
                let mut point = rng.gen_range(0..total);
                for (i, w) in weights.iter().enumerate() {
                    if point < *w {
                        return Some(i);
                    }
                    point -= w;
                }
                Some(self.drives.len() - 1)
            }
        }
    }

    /// Rescan the file table for `drive_idx` and rebuild its sorted
    /// position index. Call after any mutation that changes a file's
    /// position range on that drive.
    pub fn rebuild_pos_index(&mut self, drive_idx: usize) {
        let mut entries: Vec<PosEntry> = self
            .files
            .values()
            .filter(|f| f.drive_idx == drive_idx && f.block_count > 0)
            .map(|f| PosEntry {
                pos_start: f.parity_pos_start,
                block_count: f.block_count,
                vpath: f.vpath.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.pos_start);
        self.pos_index[drive_idx] = entries;
    }

    pub fn pos_index(&self, drive_idx: usize) -> &[PosEntry] {
        &self.pos_index[drive_idx]
    }

    /// Which file covers position `pos` on `drive_idx`? O(log n).
    pub fn find_file_at_pos(&self, drive_idx: usize, pos: u32) -> Option<&FileRecord> {
        let index = &self.pos_index[drive_idx];
        let mut lo = 0usize;
        let mut hi = index.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let e = &index[mid];
            if pos >= e.pos_start && pos - e.pos_start < e.block_count {
                return self.files.get(&e.vpath);
            }
            if pos < e.pos_start {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        None
    }

    /// Highest `next_free` across all drives: the scrub horizon.
    pub fn max_next_free(&self) -> u32 {
        self.drives
            .iter()
            .map(|d| d.alloc.next_free())
            .max()
            .unwrap_or(0)
    }
}

/// Engine-wide shared context: configuration, the state tables behind their
/// lock, and the parity handle (usable under a read lock, since each
/// position is written at most once per drain cycle).
#[derive(Debug)]
pub struct Shared {
    pub cfg: Config,
    pub state: RwLock<State>,
    pub parity: Option<ParityHandle>,
}

impl Shared {
    /// Read access to the tables. A poisoned lock is recovered: a panicking
    /// handler must not take the whole mount down.
    pub fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn blocks_for_size(size: u64, block_size: u32) -> u32 {
    if size == 0 {
        return 0;
    }
    (size / block_size as u64 + u64::from(size % block_size as u64 != 0)) as u32
}

/// Available (unprivileged) bytes on the filesystem holding `dir`.
pub fn avail_bytes(dir: &Path) -> Option<u64> {
    statvfs_bytes(dir).map(|(_, _, avail, _)| avail)
}

/// `(total, free, avail, frsize)` in bytes for the filesystem holding `dir`.
pub fn statvfs_bytes(dir: &Path) -> Option<(u64, u64, u64, u64)> {
    let c = CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut sv: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c.as_ptr(), &mut sv) } != 0 {
        return None;
    }
    let frsize = sv.f_frsize as u64;
    Some((
        sv.f_blocks as u64 * frsize,
        sv.f_bfree as u64 * frsize,
        sv.f_bavail as u64 * frsize,
        frsize,
    ))
}

#[cfg(test)]
mod tests {
    use super::{blocks_for_size, FileRecord, State};
    use crate::config::{Config, Placement};

    fn test_config(drives: usize) -> Config {
        let mut text = String::new();
        for i in 0..drives {
            text.push_str(&format!("data d{i} /tmp/lr-test-d{i}\n"));
        }
        text.push_str("content /tmp/lr-test-content\nmountpoint /tmp/lr-test-mnt\n");
        Config::parse(&text).unwrap()
    }

    fn file(vpath: &str, drive_idx: usize, pos_start: u32, block_count: u32) -> FileRecord {
        FileRecord {
            vpath: vpath.to_string(),
            real_path: format!("/tmp/lr-test-d{drive_idx}{vpath}").into(),
            drive_idx,
            size: block_count as i64 * 1024,
            parity_pos_start: pos_start,
            block_count,
            mtime_sec: 0,
            mtime_nsec: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            open_count: 0,
        }
    }

    #[test]
    fn blocks_for_size_rounds_up() {
        assert_eq!(blocks_for_size(0, 1024), 0);
        assert_eq!(blocks_for_size(1, 1024), 1);
        assert_eq!(blocks_for_size(1024, 1024), 1);
        assert_eq!(blocks_for_size(1025, 1024), 2);
    }

    #[test]
    fn round_robin_cycles() {
        let mut st = State::new(&test_config(3));
        let picks: Vec<usize> = (0..6)
            .map(|_| st.pick_drive(Placement::RoundRobin).unwrap())
            .collect();
        assert_eq!(picks, [0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn no_drives_picks_none() {
        let mut st = State::new(&test_config(1));
        st.drives.clear();
        assert!(st.pick_drive(Placement::RoundRobin).is_none());
    }

    #[test]
    fn file_table_round_trip() {
        let mut st = State::new(&test_config(1));
        st.insert_file(file("/a", 0, 0, 2));
        assert!(st.find_file("/a").is_some());
        assert!(st.find_file("/b").is_none());
        let f = st.remove_file("/a").unwrap();
        assert_eq!(f.vpath, "/a");
        assert!(st.find_file("/a").is_none());
    }

    #[test]
    fn pos_index_lookup() {
        let mut st = State::new(&test_config(2));
        st.insert_file(file("/a", 0, 0, 4));
        st.insert_file(file("/b", 0, 10, 2));
        st.insert_file(file("/other", 1, 0, 8));
        st.rebuild_pos_index(0);
        st.rebuild_pos_index(1);

        assert_eq!(st.find_file_at_pos(0, 0).unwrap().vpath, "/a");
        assert_eq!(st.find_file_at_pos(0, 3).unwrap().vpath, "/a");
        assert!(st.find_file_at_pos(0, 4).is_none());
        assert_eq!(st.find_file_at_pos(0, 11).unwrap().vpath, "/b");
        assert!(st.find_file_at_pos(0, 12).is_none());
        assert_eq!(st.find_file_at_pos(1, 7).unwrap().vpath, "/other");
    }

    #[test]
    fn zero_block_files_are_not_indexed() {
        let mut st = State::new(&test_config(1));
        st.insert_file(file("/empty", 0, 0, 0));
        st.rebuild_pos_index(0);
        assert!(st.pos_index(0).is_empty());
        assert!(st.find_file_at_pos(0, 0).is_none());
    }

    #[test]
    fn real_path_join() {
        let st = State::new(&test_config(1));
        let d = &st.drives[0];
        assert_eq!(
            d.real_path("/movies/a.mkv").to_str().unwrap(),
            "/tmp/lr-test-d0/movies/a.mkv"
        );
        assert_eq!(d.real_path("/").to_str().unwrap(), "/tmp/lr-test-d0");
    }
}
