use clap::{Args, ValueEnum};
use log::LevelFilter;

/// Log level options for command-line argument.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Which native backend a tool should drive.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Real GPU through Vulkan.
    Vulkan,
    /// Command capture without a GPU.
    #[default]
    Capture,
}

/// Common command-line arguments for Meridian tools.
///
/// Meant to be flattened into a tool's own `clap::Parser`.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Set the log verbosity level
    #[arg(short = 'l', long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Native backend to run on
    #[arg(short = 'b', long = "backend", value_enum, default_value_t = BackendKind::Capture)]
    pub backend: BackendKind,

    /// Serve puffin profiling data on the default port
    #[arg(long = "profile")]
    pub profile: bool,
}
