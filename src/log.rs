use std::ffi::CString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{Local, TimeZone};

/// Operational log levels, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum Level {
    Error = 0,
    Notice = 1,
    Info = 2,
    Debug = 3,
}

impl Level {
    pub fn parse(s: &str) -> Option<Level> {
        match s {
            "error" | "err" => Some(Level::Error),
            "notice" => Some(Level::Notice),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            _ => None,
        }
    }
}

static USE_SYSLOG: AtomicBool = AtomicBool::new(false);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Route operational messages to syslog instead of stderr, and set the
/// highest level that still gets emitted.
pub fn init(use_syslog: bool, level: Level) {
    USE_SYSLOG.store(use_syslog, Ordering::Relaxed);
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn emit(level: Level, priority: libc::c_int, msg: &str) {
    if level as u8 > MAX_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    if USE_SYSLOG.load(Ordering::Relaxed) {
        syslog_raw(priority, msg);
    } else {
        eprintln!("{}: {}", env!("CARGO_PKG_NAME"), msg);
    }
}

fn syslog_raw(priority: libc::c_int, msg: &str) {
    let msg = CString::new(msg.replace('\0', "")).unwrap();
    unsafe { libc::syslog(priority, b"%s\0".as_ptr() as *const libc::c_char, msg.as_ptr()) };
}

pub fn error(msg: &str) {
    emit(Level::Error, libc::LOG_ERR, msg);
}

pub fn notice(msg: &str) {
    emit(Level::Notice, libc::LOG_NOTICE, msg);
}

pub fn info(msg: &str) {
    emit(Level::Info, libc::LOG_INFO, msg);
}

pub fn debug(msg: &str) {
    emit(Level::Debug, libc::LOG_DEBUG, msg);
}

/// Where to put the access log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    /// Write one access-log line.  Syslog lines omit the date, the log
    /// daemon supplies its own; the other sinks carry a CLF date.
    pub fn log(&mut self, now: libc::time_t, line: &str) {
        match self {
            Self::Stdout => {
                println!("{} {}", ClfDate(now), line);
            }
            Self::Syslog => {
                syslog_raw(libc::LOG_INFO, line);
            }
            Self::File(file) => {
                if writeln!(file, "{} {}", ClfDate(now), line).is_ok() {
                    file.flush().ok();
                }
            }
        }
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub libc::time_t);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = Local.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string for logging. Logs should not contain control characters or
/// double quotes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for i in 0..c.len_utf8() {
                    write!(f, "%{:02X}", buf[i])?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Seconds since the epoch, as the rest of the code counts time.
pub fn unix_now() -> libc::time_t {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as libc::time_t
}
