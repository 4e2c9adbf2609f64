//! Logging infrastructure for gpuvas

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

use crate::config::{Config, LogLevel};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static RELOAD_HANDLE: OnceCell<FilterHandle> = OnceCell::new();

fn level_of(level: LogLevel) -> Option<Level> {
    match level {
        LogLevel::Off => None,
        LogLevel::Error => Some(Level::ERROR),
        LogLevel::Warn => Some(Level::WARN),
        LogLevel::Info => Some(Level::INFO),
        LogLevel::Debug => Some(Level::DEBUG),
        LogLevel::Trace => Some(Level::TRACE),
    }
}

fn filter_for(level: LogLevel) -> EnvFilter {
    match level_of(level) {
        Some(level) => EnvFilter::from_default_env().add_directive(level.into()),
        None => EnvFilter::new("off"),
    }
}

/// Initialize the logging system based on configuration
pub fn init(config: &Config) {
    let Some(level) = level_of(config.debug.log_level) else {
        return;
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true),
    );

    if config.debug.log_to_file {
        if let Ok(file) = std::fs::File::create(&config.debug.log_path) {
            let file_layer = fmt::layer().with_writer(file).with_ansi(false);
            let _ = subscriber.with(file_layer).try_init();
        } else {
            let _ = subscriber.try_init();
        }
    } else {
        let _ = subscriber.try_init();
    }
}

/// Initialize logging with default settings (for tests and quick starts)
pub fn init_default() {
    let filter = EnvFilter::from_default_env()
        .add_directive(Level::INFO.into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// Initialize logging with a filter that can be changed later via [`set_log_level`]
pub fn init_with_reload(level: LogLevel) {
    let (filter, handle) = reload::Layer::new(filter_for(level));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();

    if result.is_ok() {
        let _ = RELOAD_HANDLE.set(handle);
    }
}

/// Change the active log level, returns false if logging was not initialized with reload support
pub fn set_log_level(level: LogLevel) -> bool {
    match RELOAD_HANDLE.get() {
        Some(handle) => handle.reload(filter_for(level)).is_ok(),
        None => false,
    }
}

// Convenience macros for component-specific logging

/// Log a GMMU trace message
#[macro_export]
macro_rules! gmmu_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "gmmu", $($arg)*)
    };
}

/// Log a GMMU debug message
#[macro_export]
macro_rules! gmmu_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "gmmu", $($arg)*)
    };
}

/// Log an allocator trace message
#[macro_export]
macro_rules! alloc_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "allocator", $($arg)*)
    };
}

/// Log an allocator debug message
#[macro_export]
macro_rules! alloc_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "allocator", $($arg)*)
    };
}

/// Log a DMA trace message
#[macro_export]
macro_rules! dma_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "dma", $($arg)*)
    };
}
