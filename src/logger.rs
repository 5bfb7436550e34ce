use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use colored::Colorize;
use lazy_static::lazy_static;

use crate::Res;

/// Severity of a log line. `Debug` is only emitted when verbose logging is on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Message {
    Debug,
    Info,
    Warning,
    Error,
}

impl Message {
    fn prefix(self) -> String {
        match self {
            Message::Debug => "Debug".dimmed().to_string(),
            Message::Info => "Info".green().to_string(),
            Message::Warning => "Warning".yellow().to_string(),
            Message::Error => "Error".red().to_string(),
        }
    }
}

struct LogSink {
    file: Option<File>,
    verbose: bool,
}

lazy_static! {
    // Append-only; the mutex makes interleaved writes from manager and worker
    // threads come out whole-line.
    static ref SINK: Mutex<LogSink> = Mutex::new(LogSink {
        file: None,
        verbose: false,
    });
}

/// Opens the log file (append) and sets verbosity. Called once during setup;
/// calling it again redirects subsequent output.
pub fn init(path: Option<&Path>, verbose: bool) -> Res<()> {
    let file = match path {
        Some(p) => Some(OpenOptions::new().create(true).append(true).open(p)?),
        None => None,
    };
    let mut sink = SINK.lock().unwrap();
    sink.file = file;
    sink.verbose = verbose;
    drop(sink);
    log(
        Message::Debug,
        &format!(
            "[logging started at {}]",
            chrono::offset::Utc::now().to_rfc2822()
        ),
    );
    Ok(())
}

/// Flushes and closes the log file.
pub fn teardown() {
    let mut sink = SINK.lock().unwrap();
    if let Some(file) = sink.file.as_mut() {
        _ = file.flush();
    }
    sink.file = None;
}

pub fn log(typ: Message, message: &str) {
    let mut sink = SINK.lock().unwrap();
    if typ == Message::Debug && !sink.verbose {
        return;
    }
    if let Some(file) = sink.file.as_mut() {
        _ = writeln!(file, "{typ:?}: {message}");
    }
    match typ {
        Message::Debug | Message::Info => println!("{}: {message}", typ.prefix()),
        Message::Warning | Message::Error => eprintln!("{}: {message}", typ.prefix()),
    }
}

/// Logs a line the harness sent to an engine. Direction prefixes follow the
/// usual GUI log convention: `(name)>` for outgoing, `<(name)` for incoming.
pub fn engine_send(name: &str, line: &str) {
    let mut sink = SINK.lock().unwrap();
    if !sink.verbose {
        return;
    }
    if let Some(file) = sink.file.as_mut() {
        _ = writeln!(file, "({name})> {line}");
    } else {
        println!("{} {line}", format!("({name})>").dimmed());
    }
}

/// Logs a line an engine sent to the harness.
pub fn engine_recv(name: &str, line: &str) {
    let mut sink = SINK.lock().unwrap();
    if !sink.verbose {
        return;
    }
    if let Some(file) = sink.file.as_mut() {
        _ = writeln!(file, "<({name}) {line}");
    } else {
        println!("{} {line}", format!("<({name})").dimmed());
    }
}
