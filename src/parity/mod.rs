use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use log::warn;

use crate::config::Config;
use crate::state::{Shared, State};
use crate::Error;

pub mod gf;

/// One 64-byte lane of the block arena. The alignment carries over to every
/// block because the configured block size is a multiple of 64.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct Lane([u8; 64]);

// Safety: size equals alignment, no padding, every bit pattern is valid.
unsafe impl Zeroable for Lane {}
unsafe impl Pod for Lane {}

/// A contiguous arena of equally sized, 64-byte-aligned blocks, the scratch
/// space for encode and decode.
pub struct BlockVec {
    lanes: Vec<Lane>,
    block_size: usize,
}

impl BlockVec {
    pub fn new(blocks: usize, block_size: u32) -> Self {
        let block_size = block_size as usize;
        assert!(block_size > 0 && block_size % 64 == 0);
        Self {
            lanes: vec![Lane([0; 64]); blocks * (block_size / 64)],
            block_size,
        }
    }

    pub fn block(&self, i: usize) -> &[u8] {
        let bs = self.block_size;
        &bytemuck::cast_slice(&self.lanes)[i * bs..(i + 1) * bs]
    }

    pub fn block_mut(&mut self, i: usize) -> &mut [u8] {
        let bs = self.block_size;
        &mut bytemuck::cast_slice_mut(&mut self.lanes)[i * bs..(i + 1) * bs]
    }

    /// Split into bytes of blocks `[0, mid)` and `[mid, ..)`.
    pub fn split_mut(&mut self, mid: usize) -> (&mut [u8], &mut [u8]) {
        let bs = self.block_size;
        bytemuck::cast_slice_mut(&mut self.lanes).split_at_mut(mid * bs)
    }
}

/// Scrub / repair counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScrubResult {
    pub positions_checked: u32,
    pub mismatches: u32,
    pub fixed: u32,
    pub read_errors: u32,
}

/// Open parity files plus the Cauchy encode matrix, built once at mount.
#[derive(Debug)]
pub struct ParityHandle {
    files: Vec<File>,
    nd: usize,
    np: usize,
    block_size: u32,
    /// `(nd+np) x nd`, row-major; first `nd` rows are the identity.
    enc_matrix: Vec<u8>,
}

impl ParityHandle {
    pub fn open(cfg: &Config) -> Result<Self, Error> {
        let nd = cfg.drives.len();
        let np = cfg.parity_levels();
        if nd + np > 256 {
            return Err(Error::Invalid(format!(
                "{nd} drives + {np} parity levels exceed the GF(2^8) limit of 256"
            )));
        }

        let mut files = Vec::with_capacity(np);
        for path in &cfg.parity_paths {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .map_err(|e| {
                    Error::Invalid(format!("cannot open parity file '{}': {e}", path.display()))
                })?;
            files.push(f);
        }

        let enc_matrix = if nd > 0 && np > 0 {
            gf::gen_cauchy1_matrix(nd, np)
        } else {
            Vec::new()
        };

        Ok(Self {
            files,
            nd,
            np,
            block_size: cfg.block_size,
            enc_matrix,
        })
    }

    pub fn levels(&self) -> usize {
        self.np
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// The `np` parity rows of the encode matrix.
    fn parity_rows(&self) -> &[u8] {
        &self.enc_matrix[self.nd * self.nd..]
    }

    /// Read the block at `pos` of parity level `level`. Reads past the end
    /// of the file come back zeroed; the file is never truncated.
    pub fn read_block(&self, level: usize, pos: u32, buf: &mut [u8]) -> Result<(), Error> {
        if level >= self.np {
            return Err(Error::Invalid(format!("parity level {level} out of range")));
        }
        let offset = pos as u64 * self.block_size as u64;
        let mut total = 0;
        while total < buf.len() {
            let n = self.files[level].read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf[total..].fill(0);
        Ok(())
    }

    pub fn write_block(&self, level: usize, pos: u32, buf: &[u8]) -> Result<(), Error> {
        if level >= self.np {
            return Err(Error::Invalid(format!("parity level {level} out of range")));
        }
        let offset = pos as u64 * self.block_size as u64;
        self.files[level].write_all_at(buf, offset)?;
        Ok(())
    }

    /// Encode data blocks `[0, nd)` of `v` into parity blocks
    /// `[nd, nd+np)`.
    fn encode(&self, v: &mut BlockVec) {
        let bs = self.block_size as usize;
        let (data, rest) = v.split_mut(self.nd);
        let sources: Vec<&[u8]> = data.chunks_exact(bs).collect();
        let mut outputs: Vec<&mut [u8]> = rest[..self.np * bs].chunks_exact_mut(bs).collect();
        gf::encode_blocks(self.nd, self.parity_rows(), &sources, &mut outputs);
    }
}

/// Read one block of a real file, zero-padding a short tail.
/// Returns the number of bytes actually read.
fn read_file_block(path: &Path, blk_off: u32, buf: &mut [u8]) -> io::Result<usize> {
    let file = File::open(path)?;
    let offset = blk_off as u64 * buf.len() as u64;
    let mut total = 0;
    while total < buf.len() {
        let n = file.read_at(&mut buf[total..], offset + total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf[total..].fill(0);
    Ok(total)
}

fn fill_data_block(st: &State, drive_idx: usize, pos: u32, buf: &mut [u8]) -> io::Result<usize> {
    match st.find_file_at_pos(drive_idx, pos) {
        None => {
            buf.fill(0);
            Ok(0)
        }
        Some(f) => {
            let blk_off = pos - f.parity_pos_start;
            read_file_block(&f.real_path, blk_off, buf)
        }
    }
}

/// Recompute and write all parity levels for position `pos`.
///
/// `v` must hold at least `nd + np` blocks; the caller holds the state lock
/// in read mode. Positions nobody occupies encode as zero blocks, as do
/// unreadable drive files.
pub fn update_position(
    st: &State,
    ph: &ParityHandle,
    pos: u32,
    v: &mut BlockVec,
) -> Result<(), Error> {
    if ph.np == 0 {
        return Ok(());
    }

    for d in 0..ph.nd {
        if fill_data_block(st, d, pos, v.block_mut(d)).is_err() {
            v.block_mut(d).fill(0);
        }
    }

    ph.encode(v);

    let mut result = Ok(());
    for p in 0..ph.np {
        if let Err(e) = ph.write_block(p, pos, v.block(ph.nd + p)) {
            warn!("parity write failed at level {p} position {pos}: {e}");
            result = Err(e);
        }
    }
    result
}

/// Reconstruct the data block of `drive_idx` at position `pos` into `out`.
///
/// Further drives failing mid-read are detected on the fly, up to `np` total
/// failures. The caller holds the state lock in read mode.
pub fn recover_block(
    st: &State,
    ph: &ParityHandle,
    drive_idx: usize,
    pos: u32,
    out: &mut [u8],
) -> Result<(), Error> {
    if ph.np == 0 || drive_idx >= ph.nd {
        return Err(Error::Invalid("parity recovery unavailable".into()));
    }
    let nd = ph.nd;
    let bs = ph.block_size;

    let mut v = BlockVec::new(nd + ph.np, bs);

    // Failed-drive list, kept sorted: the decode submatrix rows below depend
    // on this order.
    let mut failed = vec![drive_idx];
    for d in 0..nd {
        if d == drive_idx {
            continue;
        }
        let readable = match st.find_file_at_pos(d, pos) {
            None => true,
            Some(f) => {
                let blk_off = pos - f.parity_pos_start;
                read_file_block(&f.real_path, blk_off, v.block_mut(d)).is_ok()
            }
        };
        if !readable {
            if failed.len() >= ph.np {
                return Err(Error::TooManyFailures);
            }
            let at = failed.partition_point(|&x| x < d);
            failed.insert(at, d);
            v.block_mut(d).fill(0);
        }
    }

    // One parity level per failure; unreadable parity decodes as zeros.
    let k = failed.len();
    for p in 0..k {
        if ph.read_block(p, pos, v.block_mut(nd + p)).is_err() {
            v.block_mut(nd + p).fill(0);
        }
    }

    // Submatrix of surviving rows: identity rows of the survivors followed
    // by the first k parity rows.
    let mut surv_rows: Vec<usize> = (0..nd).filter(|d| !failed.contains(d)).collect();
    surv_rows.extend((0..k).map(|p| nd + p));

    let mut sub = Vec::with_capacity(nd * nd);
    for &r in &surv_rows {
        sub.extend_from_slice(&ph.enc_matrix[r * nd..(r + 1) * nd]);
    }
    let inv = gf::invert_matrix(&sub, nd)
        .ok_or_else(|| Error::Invalid("parity decode matrix is singular".into()))?;

    // Row `drive_idx` of the inverse maps the surviving blocks back onto the
    // lost one.
    let coeffs = &inv[drive_idx * nd..(drive_idx + 1) * nd];
    out.fill(0);
    for (c, &row) in surv_rows.iter().enumerate() {
        gf::xor_mul(out, v.block(row), coeffs[c]);
    }
    Ok(())
}

/// Verify (and with `repair` rewrite) parity across every position below the
/// highest allocator high-water mark. Takes the state lock per position.
pub fn scrub(shared: &Shared, repair: bool) -> ScrubResult {
    let mut result = ScrubResult::default();
    let ph = match &shared.parity {
        Some(ph) if ph.np > 0 => ph,
        _ => return result,
    };
    let nd = ph.nd;
    let np = ph.np;
    let bs = ph.block_size;

    let max_pos = shared.read_state().max_next_free();

    // nd data + np computed-parity + np stored-parity slots.
    let mut v = BlockVec::new(nd + 2 * np, bs);

    for pos in 0..max_pos {
        let mut read_err = false;
        {
            let st = shared.read_state();
            for d in 0..nd {
                match fill_data_block(&st, d, pos, v.block_mut(d)) {
                    Ok(_) => {}
                    Err(_) => {
                        // Occupied position but the block is unreadable;
                        // nothing to compare parity against.
                        v.block_mut(d).fill(0);
                        read_err = true;
                    }
                }
            }
        }

        result.positions_checked += 1;
        if read_err {
            result.read_errors += 1;
            continue;
        }

        ph.encode(&mut v);

        let mut mismatch = false;
        let mut parity_read_err = false;
        for p in 0..np {
            if ph.read_block(p, pos, v.block_mut(nd + np + p)).is_err() {
                parity_read_err = true;
                break;
            }
            if v.block(nd + p) != v.block(nd + np + p) {
                mismatch = true;
            }
        }

        if parity_read_err {
            result.read_errors += 1;
        } else if mismatch {
            result.mismatches += 1;
            if repair {
                let mut write_err = false;
                for p in 0..np {
                    if ph.write_block(p, pos, v.block(nd + p)).is_err() {
                        write_err = true;
                    }
                }
                if !write_err {
                    result.fixed += 1;
                }
            }
        }
    }

    result
}
