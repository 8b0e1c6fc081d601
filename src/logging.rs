//! Callback-based logging for frame traffic and error treatment.
//!
//! The `log` facade carries the engine's structured module logging; this
//! logger exists for the session debug flag, which promises the caller a
//! hex dump of every byte sent and received plus a notice whenever the
//! recovery policy reacts to an error. Applications plug in their own
//! sink through the callback, or use [`CallbackLogger::console`].

use std::sync::Arc;

use crate::error::ModbusError;
use crate::utils::format::bytes_to_hex;

/// Severity passed to the log callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Direction tag for frame dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Send,
    Receive,
}

impl FrameDirection {
    fn as_str(&self) -> &'static str {
        match self {
            FrameDirection::Send => "send",
            FrameDirection::Receive => "recv",
        }
    }
}

/// Callback receiving a level and a formatted message.
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger delivering engine output through a user callback.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
        }
    }

    /// A logger printing timestamped lines to stdout/stderr.
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{timestamp}] {}: {message}", level.as_str())
                }
                _ => println!("[{timestamp}] {}: {message}", level.as_str()),
            }
        });
        Self::new(Some(callback), LogLevel::Debug)
    }

    /// A logger that drops everything.
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    /// Hex dump of one frame.
    pub fn log_frame(&self, direction: FrameDirection, frame: &[u8]) {
        if !self.should_log(LogLevel::Debug) {
            return;
        }
        self.debug(&format!(
            "{} ({} bytes): {}",
            direction.as_str(),
            frame.len(),
            bytes_to_hex(frame)
        ));
    }

    /// Notice emitted when the recovery policy reacts to an error.
    pub fn log_error_treatment(&self, error: &ModbusError, action: &str) {
        self.error(&format!("error treatment ({action}): {error}"));
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn capture() -> (CallbackLogger, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let writer = sink.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            writer.lock().unwrap().push((level, message.to_string()));
        });
        (CallbackLogger::new(Some(callback), LogLevel::Debug), sink)
    }

    #[test]
    fn test_frame_dump() {
        let (logger, sink) = capture();
        logger.log_frame(FrameDirection::Send, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);

        let lines = sink.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogLevel::Debug);
        assert!(lines[0].1.contains("send (6 bytes): 01 03 00 00 00 01"));
    }

    #[test]
    fn test_error_treatment_notice() {
        let (logger, sink) = capture();
        logger.log_error_treatment(&ModbusError::crc_mismatch(0x1234, 0x4321), "flush");

        let lines = sink.lock().unwrap();
        assert_eq!(lines[0].0, LogLevel::Error);
        assert!(lines[0].1.contains("flush"));
        assert!(lines[0].1.contains("CRC"));
    }

    #[test]
    fn test_level_filtering() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let callback: LogCallback = Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let logger = CallbackLogger::new(Some(callback), LogLevel::Warn);

        logger.error("kept");
        logger.warn("kept");
        logger.info("dropped");
        logger.debug("dropped");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disabled_logger() {
        let logger = CallbackLogger::disabled();
        // Nothing to assert beyond "does not panic".
        logger.error("nowhere");
        logger.log_frame(FrameDirection::Receive, &[0x01]);
    }
}
