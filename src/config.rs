use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::Error;

/// GF(2^8) row indices must be distinct bytes, so data drives + parity
/// levels together may not exceed 256.
pub const LEVEL_MAX: usize = 6;
pub const DRIVE_MAX: usize = 256 - LEVEL_MAX;

pub const DEFAULT_BLOCK_SIZE: u32 = 256 * 1024;
pub const DEFAULT_SAVE_INTERVAL_S: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Drive with the most free bytes.
    MostFree,
    /// Cycle through drives in configuration order.
    RoundRobin,
    /// Least free space: fill the fullest drive first.
    LeastFree,
    /// Weighted random, probability proportional to free bytes.
    ProportionalRandom,
}

#[derive(Debug, Clone)]
pub struct DriveConf {
    pub name: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub drives: Vec<DriveConf>,
    pub parity_paths: Vec<PathBuf>,
    pub content_paths: Vec<PathBuf>,
    pub mountpoint: PathBuf,
    pub block_size: u32,
    pub placement: Placement,
    pub parity_threads: usize,
    pub save_interval_s: u64,
}

impl Config {
    /// Parse the configuration file at `path`.
    ///
    /// Lines are `directive args...`; `#` starts a comment; unknown
    /// directives warn and are skipped. Missing required directives,
    /// malformed values and parity level gaps abort with [`Error::Invalid`].
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Invalid(format!("cannot open '{}': {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut drives = Vec::new();
        let mut parity_slots: [Option<PathBuf>; LEVEL_MAX] = Default::default();
        let mut content_paths = Vec::new();
        let mut mountpoint = None;
        let mut block_size = DEFAULT_BLOCK_SIZE;
        let mut placement = Placement::MostFree;
        let mut parity_threads = 1usize;
        let mut save_interval_s = DEFAULT_SAVE_INTERVAL_S;

        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = match raw.find('#') {
                Some(i) => &raw[..i],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, rest) = match line.split_once(char::is_whitespace) {
                Some((k, r)) => (k, r.trim()),
                None => (line, ""),
            };

            match key {
                "data" => {
                    let (name, dir) = rest
                        .split_once(char::is_whitespace)
                        .map(|(n, d)| (n.trim(), d.trim()))
                        .ok_or_else(|| Error::Invalid(format!("line {lineno}: bad 'data' line")))?;
                    if name.is_empty() || dir.is_empty() {
                        return Err(Error::Invalid(format!("line {lineno}: bad 'data' line")));
                    }
                    if drives.len() >= DRIVE_MAX {
                        return Err(Error::Invalid(format!("line {lineno}: too many drives")));
                    }
                    drives.push(DriveConf {
                        name: name.to_string(),
                        dir: PathBuf::from(dir),
                    });
                }
                "parity" => {
                    let (level, path) = rest
                        .split_once(char::is_whitespace)
                        .map(|(l, p)| (l.trim(), p.trim()))
                        .ok_or_else(|| {
                            Error::Invalid(format!(
                                "line {lineno}: expected: parity LEVEL(1-{LEVEL_MAX}) PATH"
                            ))
                        })?;
                    let level: usize = level.parse().map_err(|_| {
                        Error::Invalid(format!("line {lineno}: bad parity level '{level}'"))
                    })?;
                    if !(1..=LEVEL_MAX).contains(&level) || path.is_empty() {
                        return Err(Error::Invalid(format!(
                            "line {lineno}: expected: parity LEVEL(1-{LEVEL_MAX}) PATH"
                        )));
                    }
                    parity_slots[level - 1] = Some(PathBuf::from(path));
                }
                "content" => {
                    if rest.is_empty() {
                        return Err(Error::Invalid(format!("line {lineno}: bad 'content' line")));
                    }
                    content_paths.push(PathBuf::from(rest));
                }
                "mountpoint" => {
                    if rest.is_empty() {
                        return Err(Error::Invalid(format!(
                            "line {lineno}: bad 'mountpoint' line"
                        )));
                    }
                    mountpoint = Some(PathBuf::from(rest));
                }
                "blocksize" => {
                    let kib: i64 = rest.parse().map_err(|_| {
                        Error::Invalid(format!("line {lineno}: bad blocksize '{rest}'"))
                    })?;
                    if kib <= 0 || kib > (u32::MAX / 1024) as i64 || (kib * 1024) % 64 != 0 {
                        return Err(Error::Invalid(format!(
                            "line {lineno}: blocksize must be positive KiB, a multiple of 64 bytes"
                        )));
                    }
                    block_size = (kib * 1024) as u32;
                }
                "placement" => {
                    placement = match rest {
                        "mostfree" => Placement::MostFree,
                        "roundrobin" => Placement::RoundRobin,
                        "lfs" => Placement::LeastFree,
                        "pfrd" => Placement::ProportionalRandom,
                        other => {
                            return Err(Error::Invalid(format!(
                                "line {lineno}: unknown placement policy '{other}'"
                            )))
                        }
                    };
                }
                "parity_threads" => {
                    let n: usize = rest.parse().map_err(|_| {
                        Error::Invalid(format!("line {lineno}: bad parity_threads '{rest}'"))
                    })?;
                    if !(1..=64).contains(&n) {
                        return Err(Error::Invalid(format!(
                            "line {lineno}: parity_threads must be between 1 and 64"
                        )));
                    }
                    parity_threads = n;
                }
                "bitmap_interval" => {
                    let secs: u64 = rest.parse().map_err(|_| {
                        Error::Invalid(format!("line {lineno}: bad bitmap_interval '{rest}'"))
                    })?;
                    save_interval_s = secs;
                }
                other => {
                    warn!("config: line {lineno}: unknown directive '{other}'");
                }
            }
        }

        // Parity levels must be contiguous from 1.
        let highest = parity_slots.iter().rposition(Option::is_some);
        let mut parity_paths = Vec::new();
        if let Some(highest) = highest {
            for (i, slot) in parity_slots.iter_mut().enumerate().take(highest + 1) {
                match slot.take() {
                    Some(p) => parity_paths.push(p),
                    None => {
                        return Err(Error::Invalid(format!(
                            "parity levels have a gap: parity {} is missing",
                            i + 1
                        )))
                    }
                }
            }
        }

        if drives.is_empty() {
            return Err(Error::Invalid("no data drives defined".into()));
        }
        if content_paths.is_empty() {
            return Err(Error::Invalid("no content file defined".into()));
        }
        let mountpoint =
            mountpoint.ok_or_else(|| Error::Invalid("no mountpoint defined".into()))?;

        Ok(Self {
            drives,
            parity_paths,
            content_paths,
            mountpoint,
            block_size,
            placement,
            parity_threads,
            save_interval_s,
        })
    }

    pub fn parity_levels(&self) -> usize {
        self.parity_paths.len()
    }

    /// Path of the persistent dirty bitmap (next to the first content file).
    pub fn bitmap_path(&self) -> PathBuf {
        append_ext(&self.content_paths[0], "bitmap")
    }

    /// Path of the control socket (next to the first content file).
    pub fn ctrl_path(&self) -> PathBuf {
        append_ext(&self.content_paths[0], "ctrl")
    }

    /// Log the effective configuration at startup.
    pub fn dump(&self) {
        info!("block_size: {} bytes", self.block_size);
        info!("mountpoint: {}", self.mountpoint.display());
        for (i, d) in self.drives.iter().enumerate() {
            info!("drive[{i}]: name={} dir={}", d.name, d.dir.display());
        }
        for (i, p) in self.parity_paths.iter().enumerate() {
            info!("parity[{i}]: {}", p.display());
        }
        for (i, p) in self.content_paths.iter().enumerate() {
            info!("content[{i}]: {}", p.display());
        }
        let placement = match self.placement {
            Placement::MostFree => "mostfree",
            Placement::RoundRobin => "roundrobin",
            Placement::LeastFree => "lfs",
            Placement::ProportionalRandom => "pfrd",
        };
        info!("placement: {placement}");
    }
}

/// `"/a/b/content"` + `"ctrl"` → `"/a/b/content.ctrl"`.
fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::{Config, Placement, DEFAULT_BLOCK_SIZE};

    const MINIMAL: &str = "\
        data d0 /mnt/d0\n\
        content /var/lib/lr/content\n\
        mountpoint /mnt/pool\n";

    #[test]
    fn minimal_defaults() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert_eq!(cfg.drives.len(), 1);
        assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cfg.placement, Placement::MostFree);
        assert_eq!(cfg.parity_threads, 1);
        assert_eq!(cfg.parity_levels(), 0);
        assert_eq!(cfg.save_interval_s, 300);
    }

    #[test]
    fn full_config() {
        let text = "\
            # array of two\n\
            data alpha /mnt/alpha   # first drive\n\
            data beta  /mnt/beta\n\
            parity 1 /mnt/p1/pool.parity\n\
            parity 2 /mnt/p2/pool.parity\n\
            content /var/lib/lr/content\n\
            content /mnt/alpha/content\n\
            mountpoint /mnt/pool\n\
            blocksize 64\n\
            placement roundrobin\n\
            parity_threads 4\n\
            bitmap_interval 30\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.drives[1].name, "beta");
        assert_eq!(cfg.parity_levels(), 2);
        assert_eq!(cfg.content_paths.len(), 2);
        assert_eq!(cfg.block_size, 64 * 1024);
        assert_eq!(cfg.placement, Placement::RoundRobin);
        assert_eq!(cfg.parity_threads, 4);
        assert_eq!(cfg.save_interval_s, 30);
    }

    #[test]
    fn parity_gap_rejected() {
        let text = format!("{MINIMAL}parity 2 /mnt/p2/pool.parity\n");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn missing_required_rejected() {
        assert!(Config::parse("data d0 /mnt/d0\nmountpoint /m\n").is_err());
        assert!(Config::parse("content /c\nmountpoint /m\n").is_err());
        assert!(Config::parse("data d0 /mnt/d0\ncontent /c\n").is_err());
    }

    #[test]
    fn bad_blocksize_rejected() {
        // 1 KiB is fine (1024 % 64 == 0) but 0 and negatives are not.
        assert!(Config::parse(&format!("{MINIMAL}blocksize 0\n")).is_err());
        assert!(Config::parse(&format!("{MINIMAL}blocksize -4\n")).is_err());
        assert!(Config::parse(&format!("{MINIMAL}blocksize x\n")).is_err());
        assert!(Config::parse(&format!("{MINIMAL}blocksize 1\n")).is_ok());
    }

    #[test]
    fn unknown_directive_is_nonfatal() {
        let cfg = Config::parse(&format!("{MINIMAL}frobnicate on\n")).unwrap();
        assert_eq!(cfg.drives.len(), 1);
    }

    #[test]
    fn side_paths() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert_eq!(
            cfg.bitmap_path().to_str().unwrap(),
            "/var/lib/lr/content.bitmap"
        );
        assert_eq!(cfg.ctrl_path().to_str().unwrap(), "/var/lib/lr/content.ctrl");
    }
}
