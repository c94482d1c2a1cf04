// ABOUTME: Shared logging setup for wrpc binaries
// ABOUTME: init() for stderr, init_with_level() for verbosity flags, init_file*() for long-running jobs

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Standard logging to stderr. Default: INFO level, RUST_LOG override.
pub fn init() {
    init_with_level(Level::INFO);
}

/// Logging to stderr at `level`, with RUST_LOG still taking precedence per target.
/// The CLI maps `--verbose` to DEBUG through this.
pub fn init_with_level(level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .init();
}

/// File-based logging for unattended runs (long convergence waits). Default: INFO.
/// Logs to ~/.config/wrpc/{app_name}.log
/// If setup fails, prints a warning to stderr and falls back to stderr logging.
pub fn init_file(app_name: &str) {
    init_file_with_level(app_name, Level::INFO);
}

/// File-based logging at `level`. Falls back to stderr at the same level.
pub fn init_file_with_level(app_name: &str, level: Level) {
    if let Err(e) = init_file_inner(app_name, level) {
        eprintln!("Warning: failed to set up file logging: {e}");
        init_with_level(level);
    }
}

fn init_file_inner(app_name: &str, level: Level) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = log_dir().ok_or("could not determine config directory")?;
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{app_name}.log")))?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(filter(level))
        .with_ansi(false)
        .init();

    Ok(())
}

fn log_dir() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|d| d.join("wrpc"))
}

fn filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_init() {
        let _ = super::init as fn();
    }

    #[test]
    fn exports_init_with_level() {
        let _ = super::init_with_level as fn(Level);
    }

    #[test]
    fn exports_init_file() {
        let _ = super::init_file as fn(&str);
    }

    #[test]
    fn exports_init_file_with_level() {
        let _ = super::init_file_with_level as fn(&str, Level);
    }

    #[test]
    fn filter_uses_requested_level_by_default() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(
                filter(Level::DEBUG).max_level_hint(),
                Some(tracing_subscriber::filter::LevelFilter::DEBUG)
            );
        }
    }

    #[test]
    fn log_dir_is_under_wrpc() {
        if let Some(dir) = log_dir() {
            assert!(dir.ends_with("wrpc"));
        }
    }
}
