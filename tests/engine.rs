//! End-to-end engine scenarios over real temporary directories: multi-drive
//! loss recovery, parallel drain hygiene, crash-journal replay, and a full
//! unmount/remount cycle.

use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use liveraid::config::Config;
use liveraid::journal::{DirtyBitmap, Journal};
use liveraid::parity;
use liveraid::Engine;

fn config_text(root: &std::path::Path, nd: usize, np: usize, extra: &str) -> String {
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
    text.push_str("blocksize 1\nplacement roundrobin\n");
    text.push_str(extra);
    text
}

fn create_write(engine: &Engine, vpath: &str, body: &[u8]) {
    let h = engine.create(vpath, 0o644, libc::O_WRONLY).unwrap();
    engine.write(&h, 0, body).unwrap();
    engine.release(h);
}

fn read_all(engine: &Engine, vpath: &str, len: usize) -> Vec<u8> {
    let h = engine.open(vpath, libc::O_RDONLY).unwrap();
    let mut buf = vec![0u8; len];
    let n = engine.read(&h, 0, &mut buf).unwrap();
    engine.release(h);
    buf.truncate(n);
    buf
}

/// Eight files over four drives with two parity levels; drives 0 and 1 lose
/// their backing files, yet every body reads back through the namespace.
#[test]
fn two_drive_loss_recovery() {
    let tmp = TempDir::new().unwrap();
    let cfg = Config::parse(&config_text(tmp.path(), 4, 2, "parity_threads 4\n")).unwrap();
    let mut engine = Engine::start(cfg).unwrap();

    let bodies: Vec<(String, Vec<u8>)> = (1..=8u32)
        .map(|k| (format!("/f{k}"), format!("content of file {k}").into_bytes()))
        .collect();
    for (vpath, body) in &bodies {
        create_write(&engine, vpath, body);
    }
    engine.journal().unwrap().flush();

    let victims: Vec<_> = {
        let st = engine.shared().read_state();
        st.files
            .values()
            .filter(|f| f.drive_idx < 2)
            .map(|f| f.real_path.clone())
            .collect()
    };
    assert!(!victims.is_empty(), "round-robin must hit drives 0 and 1");
    for real in victims {
        fs::remove_file(real).unwrap();
    }

    for (vpath, body) in &bodies {
        assert_eq!(&read_all(&engine, vpath, 256), body, "{vpath}");
    }
    engine.shutdown();
}

/// Parallel drain leaves parity byte-exact: a repair pass finds nothing.
#[test]
fn parallel_drain_leaves_no_mismatches() {
    let tmp = TempDir::new().unwrap();
    let cfg = Config::parse(&config_text(tmp.path(), 4, 2, "parity_threads 4\n")).unwrap();
    let mut engine = Engine::start(cfg).unwrap();

    for k in 0..20u32 {
        // 192 KiB at 1 KiB blocks exercises many positions per file.
        let body: Vec<u8> = (0..192 * 1024u32)
            .map(|i| (i.wrapping_mul(2654435761).wrapping_add(k) >> 8) as u8)
            .collect();
        create_write(&engine, &format!("/r{k}"), &body);
    }
    engine.journal().unwrap().flush();

    let result = parity::scrub(engine.shared(), true);
    assert_eq!(result.mismatches, 0);
    assert_eq!(result.fixed, 0);
    assert_eq!(result.read_errors, 0);
    engine.shutdown();
}

/// A crash that leaves the on-disk bitmap behind: the next session merges
/// it, drains once, and a repair pass comes back clean.
#[test]
fn crash_journal_replay() {
    let tmp = TempDir::new().unwrap();
    let text = config_text(tmp.path(), 2, 1, "bitmap_interval 3\n");

    let body = vec![0xABu8; 1024 * 1024];
    {
        let cfg = Config::parse(&text).unwrap();
        let engine = Engine::standalone(cfg).unwrap();
        create_write(&engine, "/big", &body);

        // The periodic save fired before the crash: bitmap on disk, parity
        // never written, no clean shutdown.
        let max = engine.shared().read_state().max_next_free();
        let mut bm = DirtyBitmap::default();
        bm.set_range(0, max);
        let mut raw = b"LRBM".to_vec();
        raw.extend_from_slice(&(bm.words().len() as u32).to_le_bytes());
        for w in bm.words() {
            raw.extend_from_slice(&w.to_ne_bytes());
        }
        fs::write(engine.cfg().bitmap_path(), raw).unwrap();
        liveraid::content::save(engine.cfg(), &engine.shared().read_state()).unwrap();
    }
    let cfg = Config::parse(&text).unwrap();
    assert!(cfg.bitmap_path().exists(), "crash left the bitmap behind");

    // Remount: one drain plus a repair pass restores consistency.
    let engine = Engine::standalone(cfg).unwrap();
    let mut journal = Journal::start(Arc::clone(engine.shared()), 50).unwrap();
    journal.flush();
    journal.stop();

    let result = parity::scrub(engine.shared(), true);
    assert_eq!(result.mismatches, 0);
    assert_eq!(result.read_errors, 0);
    assert_eq!(&read_all(&engine, "/big", body.len() + 1), &body);
}

/// Unmount/remount round trip: tables, sizes and positions all survive via
/// the content file.
#[test]
fn remount_preserves_namespace() {
    let tmp = TempDir::new().unwrap();
    let text = config_text(tmp.path(), 3, 1, "");

    let (pos_b, drive_b) = {
        let cfg = Config::parse(&text).unwrap();
        let mut engine = Engine::start(cfg).unwrap();
        engine.mkdir("/docs", 0o750).unwrap();
        create_write(&engine, "/docs/a", b"alpha");
        create_write(&engine, "/docs/b", b"bravo");
        engine.symlink("/docs/a", "/link", 0, 0).unwrap();
        let st = engine.shared().read_state();
        let f = st.find_file("/docs/b").unwrap();
        let out = (f.parity_pos_start, f.drive_idx);
        drop(st);
        engine.shutdown();
        out
    };

    let cfg = Config::parse(&text).unwrap();
    let mut engine = Engine::start(cfg).unwrap();
    assert_eq!(read_all(&engine, "/docs/a", 16), b"alpha");
    assert_eq!(engine.readlink("/link").unwrap(), "/docs/a");
    {
        let st = engine.shared().read_state();
        let f = st.find_file("/docs/b").unwrap();
        assert_eq!((f.parity_pos_start, f.drive_idx), (pos_b, drive_b));
        assert!(st.find_dir("/docs").is_some());
    }
    engine.shutdown();
}
