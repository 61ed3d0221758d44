use chrono::Local;
use once_cell::sync::Lazy;
use std::sync::Mutex;

// Thread-safe log history, mirrored to stdout as it is produced.
static LOGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "OK",
        }
    }
}

pub fn log(level: LogLevel, message: &str) {
    let timestamp = Local::now().format("%H:%M:%S").to_string();
    let formatted = format!("[{}] {:<5} {}", timestamp, level.prefix(), message);

    if matches!(level, LogLevel::Error) {
        eprintln!("{}", formatted);
    } else {
        println!("{}", formatted);
    }

    if let Ok(mut logs) = LOGS.lock() {
        logs.push(formatted);
    }
}

/// Returns the full log history, mostly useful for tests.
#[allow(dead_code)]
pub fn get_logs() -> Vec<String> {
    LOGS.lock().map(|l| l.clone()).unwrap_or_default()
}

#[allow(dead_code)]
pub fn debug(message: &str) {
    log(LogLevel::Debug, message);
}

pub fn info(message: &str) {
    log(LogLevel::Info, message);
}

pub fn warning(message: &str) {
    log(LogLevel::Warning, message);
}

pub fn error(message: &str) {
    log(LogLevel::Error, message);
}

pub fn success(message: &str) {
    log(LogLevel::Success, message);
}
