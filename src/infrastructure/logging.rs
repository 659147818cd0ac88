//! Tracing setup shared by the library consumers and the command line runner.

use crate::domain::settings::LogSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Target of every event emitted by this crate.
const LINK_TARGET: &str = "hover_robot_link";

/// Flushes the file writer when dropped. Keep it alive for the program's run.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// `RUST_LOG` when set, otherwise the global level with the link's own
/// level layered on top.
fn directives(settings: &LogSettings, env: Option<String>) -> String {
    match env.filter(|d| !d.trim().is_empty()) {
        Some(from_env) => from_env,
        None => format!(
            "{},{}={}",
            settings.level, LINK_TARGET, settings.link_level
        ),
    }
}

fn build_filter(settings: &LogSettings, env: Option<String>) -> EnvFilter {
    let wanted = directives(settings, env);
    EnvFilter::try_new(&wanted).unwrap_or_else(|e| {
        eprintln!("Invalid log filter {:?} ({}), using info", wanted, e);
        EnvFilter::new("info")
    })
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let filter = build_filter(settings, std::env::var(EnvFilter::DEFAULT_ENV).ok());

    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let (file_layer, file_guard) = if settings.file_logging_enabled {
        let appender = RollingFileAppender::builder()
            .rotation(rotation(&settings.rotation))
            .filename_prefix(&settings.file_name_prefix)
            .filename_suffix("log")
            .build(&settings.log_dir)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Logging initialized (level {}, link {})",
        settings.level,
        settings.link_level
    );
    if settings.file_logging_enabled {
        tracing::info!("Writing logs to {}", settings.log_dir);
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("HOURLY"), Rotation::HOURLY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn test_link_level_layered_on_global_level() {
        let settings = LogSettings::default();
        assert_eq!(directives(&settings, None), "info,hover_robot_link=debug");

        let quiet = LogSettings {
            level: "warn".to_string(),
            link_level: "info".to_string(),
            ..LogSettings::default()
        };
        assert_eq!(directives(&quiet, None), "warn,hover_robot_link=info");
    }

    #[test]
    fn test_env_overrides_settings() {
        let settings = LogSettings::default();
        assert_eq!(
            directives(&settings, Some("hover_robot_link=trace".to_string())),
            "hover_robot_link=trace"
        );
        assert_eq!(
            directives(&settings, Some("  ".to_string())),
            "info,hover_robot_link=debug"
        );
    }

    #[test]
    fn test_bad_level_falls_back() {
        let settings = LogSettings {
            link_level: "loud=".to_string(),
            ..LogSettings::default()
        };
        // Must not panic
        let _ = build_filter(&settings, None);
    }
}
