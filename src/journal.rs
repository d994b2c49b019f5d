//! Write-back parity journal: a dirty-position bitmap drained by a
//! background worker, persisted alongside the content file so that a crash
//! never leaves silently stale parity.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::content;
use crate::parity::{self, BlockVec};
use crate::state::Shared;

const BITMAP_MAGIC: &[u8; 4] = b"LRBM";
/// Upper bound on persisted words (64M positions); anything larger is
/// treated as corruption.
const BITMAP_WORDS_MAX: u32 = 1 << 20;

pub const DEFAULT_INTERVAL_MS: u64 = 5000;

/// Scrub requested out-of-band (SIGUSR1 in the mounted process).
pub static SCRUB_REQUESTED: AtomicBool = AtomicBool::new(false);
/// Repair requested out-of-band (SIGUSR2 in the mounted process).
pub static REPAIR_REQUESTED: AtomicBool = AtomicBool::new(false);

/// One bit per parity position; grows to cover the highest set position.
#[derive(Debug, Default, Clone)]
pub struct DirtyBitmap {
    words: Vec<u64>,
}

impl DirtyBitmap {
    fn ensure(&mut self, pos: u32) {
        let word = (pos / 64) as usize;
        if word >= self.words.len() {
            self.words.resize((word + 1) * 2, 0);
        }
    }

    pub fn set(&mut self, pos: u32) {
        self.ensure(pos);
        self.words[(pos / 64) as usize] |= 1u64 << (pos % 64);
    }

    pub fn set_range(&mut self, start: u32, count: u32) {
        for pos in start..start.saturating_add(count) {
            self.set(pos);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn or_words(&mut self, other: &[u64]) {
        if self.words.len() < other.len() {
            self.words.resize(other.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(other) {
            *dst |= src;
        }
    }

    /// Every set position, ascending.
    pub fn positions(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (w, &word) in self.words.iter().enumerate() {
            let mut word = word;
            while word != 0 {
                let bit = word.trailing_zeros();
                out.push(w as u32 * 64 + bit);
                word &= word - 1;
            }
        }
        out
    }
}

struct Sync {
    bitmap: DirtyBitmap,
    /// True while a swapped-out batch is being drained.
    processing: bool,
    running: bool,
}

struct JournalInner {
    shared: Arc<Shared>,
    sync: Mutex<Sync>,
    wake: Condvar,
    drain_done: Condvar,
    interval: Duration,
    save_interval: Duration,
    threads: usize,
    bitmap_path: PathBuf,
}

impl JournalInner {
    fn lock(&self) -> MutexGuard<'_, Sync> {
        self.sync.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The journal: owns the dirty bitmap and the drainer thread.
pub struct Journal {
    inner: Arc<JournalInner>,
    worker: Option<JoinHandle<()>>,
}

impl Journal {
    /// Start the drainer. Any bitmap left behind by a crashed session is
    /// merged in so its positions are re-drained.
    pub fn start(shared: Arc<Shared>, interval_ms: u64) -> std::io::Result<Self> {
        let mut bitmap = DirtyBitmap::default();
        let bitmap_path = shared.cfg.bitmap_path();
        if let Some(words) = load_bitmap_file(&bitmap_path) {
            bitmap.or_words(&words);
            info!(
                "journal: restored dirty bitmap from '{}' (crash recovery)",
                bitmap_path.display()
            );
        }

        let inner = Arc::new(JournalInner {
            sync: Mutex::new(Sync {
                bitmap,
                processing: false,
                running: true,
            }),
            wake: Condvar::new(),
            drain_done: Condvar::new(),
            interval: Duration::from_millis(interval_ms.max(1)),
            save_interval: Duration::from_secs(shared.cfg.save_interval_s.max(1)),
            threads: shared.cfg.parity_threads,
            bitmap_path,
            shared,
        });

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("parity-drain".into())
            .spawn(move || worker_loop(&worker_inner))?;

        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    /// Mark positions `[start, start+count)` dirty. The worker is not
    /// signalled: the periodic save must observe dirty bits before they are
    /// drained, so draining stays timer-driven.
    pub fn mark_dirty_range(&self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        let mut sync = self.inner.lock();
        sync.bitmap.set_range(start, count);
    }

    /// Block until every dirty position has been drained into parity.
    pub fn flush(&self) {
        let mut sync = self.inner.lock();
        self.inner.wake.notify_one();
        // Both conditions: after the swap the bitmap is already empty while
        // parity writes are still in flight.
        while sync.processing || !sync.bitmap.is_empty() {
            sync = self
                .inner
                .drain_done
                .wait(sync)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Stop the worker and remove the on-disk bitmap (clean shutdown).
    /// Call [`flush`](Self::flush) first if pending parity must be written.
    pub fn stop(&mut self) {
        {
            let mut sync = self.inner.lock();
            sync.running = false;
            self.inner.wake.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("journal: worker thread panicked");
            }
        }
        let _ = fs::remove_file(&self.inner.bitmap_path);
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn worker_loop(inner: &JournalInner) {
    let timeout = inner.interval.min(inner.save_interval);
    let mut last_save = Instant::now();

    loop {
        let sync = inner.lock();
        if !sync.running {
            return;
        }
        let (sync, _) = inner
            .wake
            .wait_timeout(sync, timeout)
            .unwrap_or_else(|e| e.into_inner());
        if !sync.running {
            return;
        }
        drop(sync);

        // Persistence comes before the swap: the saved bitmap must contain
        // the positions about to be drained, so a crash mid-drain re-drains
        // them on the next mount.
        if last_save.elapsed() >= inner.save_interval {
            persist(inner);
            last_save = Instant::now();
        }

        // Swap the bitmap out; the processing flag closes the window where
        // the bitmap is empty but parity writes are still in flight.
        let batch = {
            let mut sync = inner.lock();
            if sync.bitmap.is_empty() {
                None
            } else {
                sync.processing = true;
                Some(std::mem::take(&mut sync.bitmap))
            }
        };

        if let Some(batch) = batch {
            drain(inner, &batch);
        }

        {
            let mut sync = inner.lock();
            sync.processing = false;
            inner.drain_done.notify_all();
        }

        if SCRUB_REQUESTED.swap(false, Ordering::Relaxed) {
            let r = parity::scrub(&inner.shared, false);
            info!(
                "scrub: {} positions checked, {} parity mismatches, {} read errors",
                r.positions_checked, r.mismatches, r.read_errors
            );
        }
        if REPAIR_REQUESTED.swap(false, Ordering::Relaxed) {
            let r = parity::scrub(&inner.shared, true);
            info!(
                "repair: {} positions checked, {} mismatches, {} fixed, {} read errors",
                r.positions_checked, r.mismatches, r.fixed, r.read_errors
            );
        }
    }
}

/// Write the content file and the on-disk bitmap. Called from the worker on
/// the save interval; also invoked once more during engine shutdown.
fn persist(inner: &JournalInner) {
    {
        let st = inner.shared.read_state();
        if let Err(e) = content::save(&inner.shared.cfg, &st) {
            warn!("journal: periodic content save failed: {e}");
        }
    }
    let words = {
        let sync = inner.lock();
        sync.bitmap.words().to_vec()
    };
    save_bitmap_file(&inner.bitmap_path, &words);
}

fn drain(inner: &JournalInner, batch: &DirtyBitmap) {
    let ph = match &inner.shared.parity {
        Some(ph) if ph.levels() > 0 => ph,
        _ => return,
    };
    let shared = &inner.shared;
    let nd = shared.cfg.drives.len();
    let np = ph.levels();
    let bs = shared.cfg.block_size;

    let positions = batch.positions();
    if positions.is_empty() {
        return;
    }

    let threads = inner.threads.clamp(1, 64).min(positions.len());
    if threads <= 1 {
        let mut v = BlockVec::new(nd + np, bs);
        for &pos in &positions {
            let st = shared.read_state();
            if let Err(e) = parity::update_position(&st, ph, pos, &mut v) {
                warn!("journal: parity update failed at position {pos}: {e}");
            }
        }
        return;
    }

    // Contiguous slices, one scratch vector per thread.
    let chunk = positions.len().div_ceil(threads);
    thread::scope(|scope| {
        for slice in positions.chunks(chunk) {
            scope.spawn(move || {
                let mut v = BlockVec::new(nd + np, bs);
                for &pos in slice {
                    let st = shared.read_state();
                    if let Err(e) = parity::update_position(&st, ph, pos, &mut v) {
                        warn!("journal: parity update failed at position {pos}: {e}");
                    }
                }
            });
        }
    });
}

/// Bitmap file: `"LRBM"`, little-endian u32 word count, then the u64 words
/// in host byte order (not portable across endianness).
fn save_bitmap_file(path: &Path, words: &[u64]) {
    if words.iter().all(|&w| w == 0) {
        // Nothing dirty: a stale file would only cause useless re-drains.
        let _ = fs::remove_file(path);
        return;
    }

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    let write = || -> std::io::Result<()> {
        let mut f = File::create(tmp)?;
        f.write_all(BITMAP_MAGIC)?;
        f.write_all(&(words.len() as u32).to_le_bytes())?;
        f.write_all(bytemuck::cast_slice(words))?;
        f.sync_all()?;
        Ok(())
    };
    if let Err(e) = write() {
        warn!("journal: cannot write bitmap '{}': {e}", tmp.display());
        let _ = fs::remove_file(tmp);
        return;
    }
    if let Err(e) = fs::rename(tmp, path) {
        warn!("journal: failed to save bitmap '{}': {e}", path.display());
        let _ = fs::remove_file(tmp);
    }
}

fn load_bitmap_file(path: &Path) -> Option<Vec<u64>> {
    let mut f = File::open(path).ok()?;

    let mut header = [0u8; 8];
    f.read_exact(&mut header).ok()?;
    if &header[..4] != BITMAP_MAGIC {
        return None;
    }
    let words = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if words == 0 || words > BITMAP_WORDS_MAX {
        return None;
    }

    let mut out = vec![0u64; words as usize];
    f.read_exact(bytemuck::cast_slice_mut(&mut out)).ok()?;
    Some(out)
}

/// One final content + bitmap save during shutdown, after the last flush.
pub(crate) fn persist_for_shutdown(shared: &Shared) {
    let st = shared.read_state();
    if let Err(e) = content::save(&shared.cfg, &st) {
        error!("shutdown content save failed: {e}");
    }
}
