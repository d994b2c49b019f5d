//! Control channel: a local stream socket next to the first content path.
//! One command per connection; used for live rebuild and scrub/repair while
//! the filesystem is mounted.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::fs;
use std::thread::{self, JoinHandle};

use log::{info, warn};

use crate::parity;
use crate::rebuild::{self, FileOutcome};
use crate::state::Shared;
use crate::Error;

/// Accepts connections at `<first_content_path>.ctrl` on its own thread.
pub struct CtrlServer {
    sock_path: PathBuf,
    raw_fd: i32,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CtrlServer {
    pub fn start(shared: Arc<Shared>) -> Result<Self, Error> {
        let sock_path = shared.cfg.ctrl_path();
        // A stale socket from an unclean exit would make bind fail.
        let _ = fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path)?;
        let raw_fd = {
            use std::os::unix::io::AsRawFd;
            listener.as_raw_fd()
        };

        let running = Arc::new(AtomicBool::new(true));
        let accept_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("ctrl-accept".into())
            .spawn(move || {
                for conn in listener.incoming() {
                    if !accept_running.load(Ordering::Acquire) {
                        break;
                    }
                    match conn {
                        Ok(stream) => {
                            // Short-lived handler thread per connection; the
                            // Arc keeps the state alive past a shutdown that
                            // races a long scrub.
                            let shared = Arc::clone(&shared);
                            let _ = thread::Builder::new()
                                .name("ctrl-conn".into())
                                .spawn(move || handle_connection(&shared, stream));
                        }
                        Err(_) => break, // listener shut down
                    }
                }
            })
            .map_err(Error::from)?;

        info!("control socket listening at {}", sock_path.display());
        Ok(Self {
            sock_path,
            raw_fd,
            running,
            thread: Some(thread),
        })
    }

    /// Unblock accept, join the thread, unlink the socket.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        unsafe {
            libc::shutdown(self.raw_fd, libc::SHUT_RDWR);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = fs::remove_file(&self.sock_path);
    }
}

impl Drop for CtrlServer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn handle_connection(shared: &Shared, stream: UnixStream) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });
    let mut conn = stream;

    let mut line = String::new();
    if reader.read_line(&mut line).is_err() {
        return;
    }
    let line = line.trim_end_matches(['\n', '\r']);

    if let Some(drive) = line.strip_prefix("rebuild ") {
        live_rebuild(shared, &mut conn, drive);
    } else if line == "scrub repair" {
        let r = parity::scrub(shared, true);
        let _ = writeln!(
            conn,
            "done {} {} fixed={} errors={}",
            r.positions_checked, r.mismatches, r.fixed, r.read_errors
        );
    } else if line == "scrub" {
        let r = parity::scrub(shared, false);
        let _ = writeln!(
            conn,
            "done {} {} errors={}",
            r.positions_checked, r.mismatches, r.read_errors
        );
    } else {
        let _ = writeln!(conn, "error unknown command");
    }
}

/// Rebuild every file on `drive_name`, streaming progress to the client.
/// Open files are skipped; they can be rebuilt once closed.
fn live_rebuild(shared: &Shared, conn: &mut UnixStream, drive_name: &str) {
    let (drive_idx, vpaths) = {
        let st = shared.read_state();
        let drive_idx = match st.drives.iter().position(|d| d.name == drive_name) {
            Some(i) => i,
            None => {
                let _ = writeln!(conn, "error drive '{drive_name}' not found");
                return;
            }
        };
        let vpaths: Vec<String> = st
            .files
            .values()
            .filter(|f| f.drive_idx == drive_idx)
            .map(|f| f.vpath.clone())
            .collect();
        (drive_idx, vpaths)
    };

    let total = vpaths.len();
    let _ = writeln!(conn, "progress 0 {total} (starting)");

    let mut rebuilt = 0u32;
    let mut failed = 0u32;
    let mut skipped = 0u32;
    for (i, vpath) in vpaths.iter().enumerate() {
        let _ = writeln!(conn, "progress {} {total} {vpath}", i + 1);
        match rebuild::rebuild_one_file(shared, drive_idx, vpath, true) {
            FileOutcome::Rebuilt => {
                rebuilt += 1;
                let _ = writeln!(conn, "ok {vpath}");
            }
            FileOutcome::SkippedBusy => {
                skipped += 1;
                let _ = writeln!(conn, "skip {vpath} busy");
            }
            FileOutcome::SkippedGone => skipped += 1,
            FileOutcome::Failed(reason) => {
                failed += 1;
                warn!("live rebuild of {vpath} failed: {reason}");
                let _ = writeln!(conn, "fail {vpath} {reason}");
            }
        }
    }

    let _ = writeln!(conn, "done {rebuilt} {failed} skipped={skipped}");
}

/// Client side: run one command against a live control socket and stream
/// the reply lines through `on_line`. `None` if nothing is listening.
pub fn send_command(
    sock_path: &std::path::Path,
    command: &str,
    mut on_line: impl FnMut(&str),
) -> Option<bool> {
    let mut stream = UnixStream::connect(sock_path).ok()?;
    stream.write_all(command.as_bytes()).ok()?;
    stream.write_all(b"\n").ok()?;

    let reader = BufReader::new(stream);
    let mut had_failures = false;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if let Some(rest) = line.strip_prefix("done ") {
            let mut it = rest.split_whitespace();
            let _rebuilt: u32 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let failed: u32 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            if failed > 0 {
                had_failures = true;
            }
        } else if line.starts_with("error ") {
            had_failures = true;
        }
        on_line(&line);
    }
    Some(had_failures)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::{send_command, CtrlServer};
    use crate::config::Config;
    use crate::filesystem::Engine;

    fn engine(tmp: &TempDir, nd: usize, np: usize) -> Engine {
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
        text.push_str("blocksize 1\nplacement roundrobin\n");
        Engine::start(Config::parse(&text).unwrap()).unwrap()
    }

    #[test]
    fn unknown_command_is_reported() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 1, 1);
        let mut lines = Vec::new();
        let failed = send_command(&engine.cfg().ctrl_path(), "frobnicate", |l| {
            lines.push(l.to_string())
        })
        .expect("server is listening");
        assert!(failed);
        assert_eq!(lines, ["error unknown command"]);
        engine.shutdown();
    }

    #[test]
    fn scrub_over_socket() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 2, 1);
        let h = engine.create("/x", 0o644, libc::O_WRONLY).unwrap();
        engine.write(&h, 0, &[3u8; 2048]).unwrap();
        engine.release(h);
        engine.journal().unwrap().flush();

        let mut lines = Vec::new();
        let failed = send_command(&engine.cfg().ctrl_path(), "scrub", |l| {
            lines.push(l.to_string())
        })
        .expect("server is listening");
        assert!(!failed);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("done 2 0"), "got: {}", lines[0]);
        engine.shutdown();
    }

    #[test]
    fn rebuild_over_socket_with_busy_file() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp, 2, 1);
        let bodies = [b"first file".to_vec(), b"second file".to_vec()];
        for (i, body) in bodies.iter().enumerate() {
            let h = engine
                .create(&format!("/f{i}"), 0o644, libc::O_WRONLY)
                .unwrap();
            engine.write(&h, 0, body).unwrap();
            engine.release(h);
        }
        engine.journal().unwrap().flush();

        // Both files land on drive 0 and 1 round-robin; erase drive 0's one
        // and hold it open so the first rebuild skips it.
        let (victim_vpath, victim_real) = {
            let st = engine.shared().read_state();
            let f = st.files.values().find(|f| f.drive_idx == 0).unwrap();
            (f.vpath.clone(), f.real_path.clone())
        };
        fs::remove_file(&victim_real).unwrap();
        let held = engine.open(&victim_vpath, libc::O_RDONLY).unwrap();

        let mut lines = Vec::new();
        send_command(&engine.cfg().ctrl_path(), "rebuild d0", |l| {
            lines.push(l.to_string())
        })
        .expect("server is listening");
        assert!(
            lines.contains(&format!("skip {victim_vpath} busy")),
            "lines: {lines:?}"
        );

        engine.release(held);
        let mut lines = Vec::new();
        send_command(&engine.cfg().ctrl_path(), "rebuild d0", |l| {
            lines.push(l.to_string())
        })
        .expect("server is listening");
        assert!(
            lines.contains(&format!("ok {victim_vpath}")),
            "lines: {lines:?}"
        );
        assert!(victim_real.exists());

        engine.shutdown();
    }
}
