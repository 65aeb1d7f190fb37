use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::SystemTime;

const LOG_DIR: &str = "/var/log/instup";
const LOG_FILE: &str = "instup.log";

// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

// File logger for update operations
pub struct Logger {
    log_path: PathBuf,
    min_level: LogLevel,
    debug_mode: bool,
}

impl Logger {
    pub fn new() -> Result<Self, String> {
        Self::with_dir(LOG_DIR)
    }

    // Create logger with custom directory
    pub fn with_dir(log_dir: &str) -> Result<Self, String> {
        let log_dir = PathBuf::from(log_dir);

        fs::create_dir_all(&log_dir)
            .map_err(|e| format!("Failed to create log directory: {}", e))?;

        let debug_mode = std::env::var("INSTUP_DEBUG").is_ok();
        let min_level = if debug_mode {
            LogLevel::Debug
        } else {
            LogLevel::Info
        };

        Ok(Logger {
            log_path: log_dir.join(LOG_FILE),
            min_level,
            debug_mode,
        })
    }

    // Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if level < self.min_level {
            return;
        }

        let timestamp = Self::format_timestamp();
        let log_line = format!("[{}] [{}] {}\n", timestamp, level.as_str(), message);

        if let Err(e) = self.write_to_file(&log_line) {
            eprintln!("Failed to write to log file: {}", e);
        }

        // Mirror warnings and errors to stderr
        if level >= LogLevel::Warning || self.debug_mode {
            eprint!("{}", log_line);
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    fn write_to_file(&self, content: &str) -> Result<(), String> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| format!("Failed to open log file: {}", e))?;

        file.write_all(content.as_bytes())
            .map_err(|e| format!("Failed to write to log: {}", e))?;

        Ok(())
    }

    fn format_timestamp() -> String {
        let now = SystemTime::now();
        match now.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(duration) => {
                let secs = duration.as_secs();
                chrono::DateTime::from_timestamp(secs as i64, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| format!("{}", secs))
            }
            Err(_) => "UNKNOWN".to_string(),
        }
    }
}

// Global logger instance
static GLOBAL_LOGGER: OnceLock<Logger> = OnceLock::new();

// Initialize global logger; falls back to /tmp when the log dir is unusable
pub fn init_logger() {
    GLOBAL_LOGGER.get_or_init(|| {
        Logger::new().unwrap_or_else(|_| Logger {
            log_path: PathBuf::from("/tmp/instup.log"),
            min_level: LogLevel::Info,
            debug_mode: false,
        })
    });
}

pub fn get_logger() -> &'static Logger {
    GLOBAL_LOGGER.get_or_init(|| {
        Logger::new().unwrap_or_else(|_| Logger {
            log_path: PathBuf::from("/tmp/instup.log"),
            min_level: LogLevel::Info,
            debug_mode: false,
        })
    })
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::get_logger().debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::get_logger().info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::get_logger().warning(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::get_logger().error(&format!($($arg)*))
    };
}
