//! The content file: a line-oriented text snapshot of the file, directory
//! and symlink tables plus per-drive allocator state, finished with a CRC32
//! footer and written by atomic rename.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;

use log::{info, warn};

use crate::config::Config;
use crate::state::{blocks_for_size, DirRecord, FileRecord, State, SymlinkRecord};
use crate::Error;

const META_VERSION: u32 = 1;

/// CRC32, IEEE polynomial 0xEDB88320.
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(0xFFFF_FFFF, data) ^ 0xFFFF_FFFF
}

fn crc32_update(mut crc: u32, data: &[u8]) -> u32 {
    static TABLE: std::sync::OnceLock<[u32; 256]> = std::sync::OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut t = [0u32; 256];
        for (i, slot) in t.iter_mut().enumerate() {
            let mut c = i as u32;
            for _ in 0..8 {
                c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            }
            *slot = c;
        }
        t
    });
    for &b in data {
        crc = table[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc
}

fn render(cfg: &Config, st: &State) -> String {
    let mut body = String::new();
    body.push_str("# liveraid content\n");
    let _ = writeln!(body, "# version: {META_VERSION}");
    let _ = writeln!(body, "# blocksize: {}", cfg.block_size);
    for d in &st.drives {
        let _ = writeln!(body, "# drive_next_free: {} {}", d.name, d.alloc.next_free());
        for e in d.alloc.extents() {
            let _ = writeln!(body, "# drive_free_extent: {} {} {}", d.name, e.start, e.count);
        }
    }
    for f in st.files.values() {
        let _ = writeln!(
            body,
            "file|{}|{}|{}|{}|{}|{}|{}|{:o}|{}|{}",
            st.drives[f.drive_idx].name,
            f.vpath,
            f.size,
            f.parity_pos_start,
            f.block_count,
            f.mtime_sec,
            f.mtime_nsec,
            f.mode,
            f.uid,
            f.gid,
        );
    }
    for d in st.dirs.values() {
        let _ = writeln!(
            body,
            "dir|{}|{:o}|{}|{}|{}|{}",
            d.vpath, d.mode, d.uid, d.gid, d.mtime_sec, d.mtime_nsec,
        );
    }
    for s in st.symlinks.values() {
        let _ = writeln!(
            body,
            "symlink|{}|{}|{}|{}|{}|{}",
            s.vpath, s.target, s.mtime_sec, s.mtime_nsec, s.uid, s.gid,
        );
    }
    body
}

fn write_to_path(path: &Path, content: &str) -> Result<(), Error> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    let mut f = File::create(tmp)?;
    if let Err(e) = f.write_all(content.as_bytes()).and_then(|_| f.sync_all()) {
        let _ = fs::remove_file(tmp);
        return Err(e.into());
    }
    drop(f);

    if let Err(e) = fs::rename(tmp, path) {
        let _ = fs::remove_file(tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Snapshot the tables to every configured content path. The caller holds
/// the state lock (read mode is enough).
pub fn save(cfg: &Config, st: &State) -> Result<(), Error> {
    let mut body = render(cfg, st);
    let crc = crc32(body.as_bytes());
    let _ = writeln!(body, "# crc32: {crc:08X}");

    let mut result = Ok(());
    for path in &cfg.content_paths {
        if let Err(e) = write_to_path(path, &body) {
            warn!("content save to '{}' failed: {e}", path.display());
            result = Err(e);
        }
    }
    result
}

/// Load the first openable content path into `st`. A missing file is a
/// normal first-run state. A CRC mismatch warns but parsing continues.
pub fn load(cfg: &Config, st: &mut State) -> Result<(), Error> {
    let (path, text) = match cfg
        .content_paths
        .iter()
        .find_map(|p| fs::read_to_string(p).ok().map(|t| (p, t)))
    {
        Some(found) => found,
        None => return Ok(()),
    };

    let mut running_crc = 0xFFFF_FFFFu32;
    for (lineno, raw) in text.split_inclusive('\n').enumerate() {
        let lineno = lineno + 1;
        let line = raw.trim_end_matches('\n').trim_end_matches('\r');

        if let Some(rest) = line.strip_prefix("# crc32:") {
            let stored = u32::from_str_radix(rest.trim(), 16).unwrap_or(0);
            let computed = running_crc ^ 0xFFFF_FFFF;
            if stored != computed {
                warn!(
                    "content: CRC mismatch in '{}' (stored {stored:08X}, computed {computed:08X}), \
                     file may be corrupt",
                    path.display()
                );
            }
            break; // no records after the footer
        }
        running_crc = crc32_update(running_crc, raw.as_bytes());

        if let Some(rest) = line.strip_prefix("# drive_next_free:") {
            let mut it = rest.split_whitespace();
            if let (Some(name), Some(Ok(nfp))) = (it.next(), it.next().map(str::parse::<u32>)) {
                if let Some(d) = st.drives.iter_mut().find(|d| d.name == name) {
                    d.alloc.cover(nfp);
                }
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("# drive_free_extent:") {
            let mut it = rest.split_whitespace();
            if let (Some(name), Some(Ok(start)), Some(Ok(count))) = (
                it.next(),
                it.next().map(str::parse::<u32>),
                it.next().map(str::parse::<u32>),
            ) {
                if let Some(d) = st.drives.iter_mut().find(|d| d.name == name) {
                    d.alloc.free(start, count);
                }
            }
            continue;
        }
        // Old single-namespace headers: per-drive next_free is derived from
        // the file records instead.
        if line.starts_with("# next_free_pos:") || line.starts_with("# free_extent:") {
            continue;
        }
        if line.starts_with('#') || line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("dir|") {
            if let Some(d) = parse_dir(rest) {
                st.insert_dir(d);
            } else {
                warn!("content: malformed dir record at line {lineno}, skipping");
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("symlink|") {
            if let Some(s) = parse_symlink(rest) {
                st.insert_symlink(s);
            } else {
                warn!("content: malformed symlink record at line {lineno}, skipping");
            }
            continue;
        }
        let rest = match line.strip_prefix("file|") {
            Some(rest) => rest,
            None => continue,
        };
        match parse_file(rest, st, cfg.block_size) {
            FileParse::Ok(f) => st.insert_file(f),
            FileParse::UnknownDrive(name) => {
                warn!("content: unknown drive '{name}' at line {lineno}, skipping");
            }
            FileParse::Malformed => {
                warn!("content: malformed file record at line {lineno}, skipping");
            }
        }
    }

    for idx in 0..st.drives.len() {
        st.rebuild_pos_index(idx);
    }

    // Overlapping ranges on one drive mean the snapshot is corrupt.
    for d in 0..st.drives.len() {
        let index = st.pos_index(d);
        for k in 1..index.len() {
            let prev_end = index[k - 1].pos_start + index[k - 1].block_count;
            if index[k].pos_start < prev_end {
                warn!(
                    "content: overlapping parity positions on drive '{}': [{},{}) and [{},{})",
                    st.drives[d].name,
                    index[k - 1].pos_start,
                    prev_end,
                    index[k].pos_start,
                    index[k].pos_start + index[k].block_count,
                );
            }
        }
    }

    info!(
        "content: loaded {} file(s), {} dir(s), {} symlink(s) from '{}'",
        st.files.len(),
        st.dirs.len(),
        st.symlinks.len(),
        path.display()
    );
    Ok(())
}

fn parse_dir(rest: &str) -> Option<DirRecord> {
    let mut it = rest.split('|');
    let vpath = it.next()?.to_string();
    let mut mode = u32::from_str_radix(it.next()?, 8).ok()?;
    let uid = it.next()?.parse().ok()?;
    let gid = it.next()?.parse().ok()?;
    let mtime_sec = it.next()?.parse().ok()?;
    let mtime_nsec = it.next()?.parse().ok()?;
    if mode == 0 {
        mode = libc::S_IFDIR | 0o755;
    }
    Some(DirRecord {
        vpath,
        mode,
        uid,
        gid,
        mtime_sec,
        mtime_nsec,
    })
}

fn parse_symlink(rest: &str) -> Option<SymlinkRecord> {
    let mut it = rest.split('|');
    let vpath = it.next()?.to_string();
    let target = it.next()?.to_string();
    let mtime_sec = it.next()?.parse().ok()?;
    let mtime_nsec = it.next()?.parse().ok()?;
    let uid = it.next()?.parse().ok()?;
    let gid = it.next()?.parse().ok()?;
    Some(SymlinkRecord {
        vpath,
        target,
        uid,
        gid,
        mtime_sec,
        mtime_nsec,
    })
}

enum FileParse {
    Ok(FileRecord),
    UnknownDrive(String),
    Malformed,
}

fn parse_file(rest: &str, st: &mut State, block_size: u32) -> FileParse {
    let fields: Vec<&str> = rest.split('|').collect();
    if fields.len() < 7 {
        return FileParse::Malformed;
    }

    let drive_name = fields[0];
    let drive_idx = match st.drives.iter().position(|d| d.name == drive_name) {
        Some(i) => i,
        None => return FileParse::UnknownDrive(drive_name.to_string()),
    };
    let vpath = fields[1].to_string();

    let parsed = (|| -> Option<(i64, u32, u32, i64, i64)> {
        Some((
            fields[2].parse().ok()?,
            fields[3].parse().ok()?,
            fields[4].parse().ok()?,
            fields[5].parse().ok()?,
            fields[6].parse().ok()?,
        ))
    })();
    let (size, parity_pos_start, mut block_count, mtime_sec, mtime_nsec) = match parsed {
        Some(v) => v,
        None => return FileParse::Malformed,
    };

    // Records written before per-file ownership carry no mode/uid/gid.
    let (mut mode, uid, gid) = if fields.len() >= 10 {
        match (
            u32::from_str_radix(fields[7], 8),
            fields[8].parse(),
            fields[9].parse(),
        ) {
            (Ok(m), Ok(u), Ok(g)) => (m, u, g),
            _ => return FileParse::Malformed,
        }
    } else {
        (0, 0, 0)
    };
    if mode == 0 {
        mode = libc::S_IFREG | 0o644;
    }

    let expected = blocks_for_size(size.max(0) as u64, block_size);
    if block_count != expected {
        warn!("content: block_count mismatch for {vpath}: stored {block_count}, computed {expected}");
        block_count = expected;
    }

    let real_path = st.drives[drive_idx].real_path(&vpath);
    st.drives[drive_idx]
        .alloc
        .cover(parity_pos_start + block_count);

    FileParse::Ok(FileRecord {
        vpath,
        real_path,
        drive_idx,
        size,
        parity_pos_start,
        block_count,
        mtime_sec,
        mtime_nsec,
        mode,
        uid,
        gid,
        open_count: 0,
    })
}
