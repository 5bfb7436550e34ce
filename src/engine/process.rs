use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::util::{now_ms, Res};

/// What went wrong while reading a line from the engine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LineError {
    /// Pipe EOF or read error; the engine is gone.
    Terminated,
    /// A fragment without a terminating newline was orphaned by EOF.
    IncompleteLine,
}

/// One line from the engine's stdout, stamped with the harness clock at the
/// moment the terminating newline was read.
#[derive(Debug, Clone)]
#[must_use]
pub struct EngineLine {
    pub content: String,
    pub complete: bool,
    pub timestamp_ms: u64,
    pub error: Option<LineError>,
}

/// Spawns the engine executable with piped stdin/stdout. Stderr goes to the
/// given file, or to the null sink when none is configured.
pub fn spawn(
    path: &Path,
    args: &[String],
    working_dir: Option<&Path>,
    stderr_file: Option<&Path>,
) -> Res<(ProcessWriter, ProcessReader, ProcessGuard)> {
    let mut command = Command::new(path);
    _ = command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped());
    _ = match stderr_file {
        Some(p) => command.stderr(File::create(p)?),
        None => command.stderr(Stdio::null()),
    };
    if let Some(dir) = working_dir {
        _ = command.current_dir(dir);
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("Couldn't start engine executable '{}'", path.display()))?;
    let stdin = child.stdin.take().expect("stdin was requested piped");
    let stdout = child.stdout.take().expect("stdout was requested piped");
    let guard = ProcessGuard {
        child: Arc::new(Mutex::new(child)),
        executable: path.to_path_buf(),
    };
    Ok((
        ProcessWriter { stdin },
        ProcessReader {
            stdout,
            buffer: VecDeque::new(),
            fragment: Vec::new(),
            eof: false,
        },
        guard,
    ))
}

/// The write half of the pipe pair. Owned exclusively by the worker's write
/// thread.
#[derive(Debug)]
pub struct ProcessWriter {
    stdin: ChildStdin,
}

impl ProcessWriter {
    /// Writes `line` plus a newline and flushes. The returned timestamp is
    /// taken right after the bytes were handed to the OS; the game manager
    /// uses it as the authoritative clock start.
    pub fn write_line(&mut self, line: &str) -> Res<u64> {
        writeln!(self.stdin, "{line}")?;
        self.stdin.flush()?;
        Ok(now_ms())
    }
}

/// The read half. Owned exclusively by the worker's read thread. Buffers raw
/// bytes, splits on `\n`, strips trailing `\r`.
#[derive(Debug)]
pub struct ProcessReader {
    stdout: ChildStdout,
    buffer: VecDeque<EngineLine>,
    fragment: Vec<u8>,
    eof: bool,
}

impl ProcessReader {
    /// Blocks until one line (or the end of the stream) is available.
    pub fn read_line_blocking(&mut self) -> EngineLine {
        loop {
            if let Some(line) = self.buffer.pop_front() {
                return line;
            }
            if self.eof {
                if !self.fragment.is_empty() {
                    let content = String::from_utf8_lossy(&self.fragment).into_owned();
                    self.fragment.clear();
                    return EngineLine {
                        content,
                        complete: false,
                        timestamp_ms: now_ms(),
                        error: Some(LineError::IncompleteLine),
                    };
                }
                return EngineLine {
                    content: String::new(),
                    complete: false,
                    timestamp_ms: now_ms(),
                    error: Some(LineError::Terminated),
                };
            }
            let mut chunk = [0_u8; 4096];
            match self.stdout.read(&mut chunk) {
                Ok(0) | Err(_) => self.eof = true,
                Ok(n) => {
                    let stamp = now_ms();
                    for &byte in &chunk[..n] {
                        if byte == b'\n' {
                            let mut bytes = std::mem::take(&mut self.fragment);
                            if bytes.last() == Some(&b'\r') {
                                _ = bytes.pop();
                            }
                            self.buffer.push_back(EngineLine {
                                content: String::from_utf8_lossy(&bytes).into_owned(),
                                complete: true,
                                timestamp_ms: stamp,
                                error: None,
                            });
                        } else {
                            self.fragment.push(byte);
                        }
                    }
                }
            }
        }
    }
}

/// A shared handle to the child used for liveness checks and termination.
/// Cloning shares the underlying process.
#[derive(Debug, Clone)]
pub struct ProcessGuard {
    child: Arc<Mutex<Child>>,
    executable: PathBuf,
}

impl ProcessGuard {
    pub fn is_running(&self) -> bool {
        matches!(self.child.lock().unwrap().try_wait(), Ok(None))
    }

    pub fn id(&self) -> u32 {
        self.child.lock().unwrap().id()
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Waits for the child to exit, polling in small steps. Returns whether
    /// it exited within the timeout.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_running() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            sleep(Duration::from_millis(20));
        }
    }

    /// Kills the child if it is still alive and reaps it. Idempotent and
    /// infallible: if the process ignores the kill for more than 5 seconds
    /// the handle is dropped anyway.
    pub fn terminate(&self) {
        {
            let mut child = self.child.lock().unwrap();
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            _ = child.kill();
        }
        if self.wait_for_exit(Duration::from_millis(5000)) {
            // reap the zombie
            _ = self.child.lock().unwrap().wait();
        }
    }

    /// Resident set size in kilobytes, if the OS tells us.
    pub fn memory_usage_kb(&self) -> Option<u64> {
        memory_usage_kb(self.id())
    }
}

#[cfg(target_os = "linux")]
fn memory_usage_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(target_os = "macos")]
fn memory_usage_kb(pid: u32) -> Option<u64> {
    let out = Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    String::from_utf8_lossy(&out.stdout).trim().parse().ok()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn memory_usage_kb(_pid: u32) -> Option<u64> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> (ProcessWriter, ProcessReader, ProcessGuard) {
        spawn(
            &PathBuf::from("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn reads_lines_with_stripped_carriage_returns() {
        let (_w, mut reader, guard) = sh("printf 'one\\r\\ntwo\\n'");
        let line = reader.read_line_blocking();
        assert_eq!(line.content, "one");
        assert!(line.complete);
        let line = reader.read_line_blocking();
        assert_eq!(line.content, "two");
        let line = reader.read_line_blocking();
        assert_eq!(line.error, Some(LineError::Terminated));
        guard.terminate();
    }

    #[test]
    fn an_unterminated_fragment_is_reported_before_eof() {
        let (_w, mut reader, guard) = sh("printf 'complete\\nfragment'");
        assert_eq!(reader.read_line_blocking().content, "complete");
        let line = reader.read_line_blocking();
        assert_eq!(line.content, "fragment");
        assert_eq!(line.error, Some(LineError::IncompleteLine));
        assert!(!line.complete);
        assert_eq!(
            reader.read_line_blocking().error,
            Some(LineError::Terminated)
        );
        guard.terminate();
    }

    #[test]
    fn echoes_written_lines_back() {
        let (mut writer, mut reader, guard) = sh("read line; echo \"got $line\"");
        let stamp = writer.write_line("hello").unwrap();
        let line = reader.read_line_blocking();
        assert_eq!(line.content, "got hello");
        assert!(line.timestamp_ms >= stamp);
        guard.terminate();
    }

    #[test]
    fn terminate_is_idempotent_and_detects_exit() {
        let (_w, _r, guard) = sh("sleep 30");
        assert!(guard.is_running());
        guard.terminate();
        guard.terminate();
        assert!(!guard.is_running());
    }
}
