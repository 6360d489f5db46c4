use crate::config::{LogFormat, LogLevel, LoggingConfig};
use chrono::{DateTime, Utc};
use log::Record;
use serde_json::json;
use std::io::Write;

fn format_json(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let timestamp_str = timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let log_entry = json!({
        "timestamp": timestamp_str,
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "file": record.file().unwrap_or("unknown"),
        "line": record.line().unwrap_or(0),
        "message": record.args().to_string(),
    });

    serde_json::to_string(&log_entry).unwrap_or_else(|_| {
        json!({"error": "Failed to serialize log entry", "raw_message": record.args().to_string()})
            .to_string()
    })
}

fn builder(config: &LoggingConfig) -> env_logger::Builder {
    let level = config.level.clone().unwrap_or_default().to_string();
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if let LogFormat::Json = config.format.clone().unwrap_or_default() {
        builder.format(|buf, record| writeln!(buf, "{}", format_json(record)));
    }
    builder
}

/// Installs `env_logger` as the global logger. `RUST_LOG` still overrides the
/// configured level.
pub fn init(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    builder(config).try_init()?;
    Ok(())
}

// Parse string to LogLevel
pub fn parse_log_level(s: &str) -> Result<LogLevel, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s).into()),
    }
}

// Parse string to LogFormat
pub fn parse_log_format(s: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("DEBUG").unwrap(), LogLevel::Debug));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_parse_log_format() {
        assert!(matches!(parse_log_format("json").unwrap(), LogFormat::Json));
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn test_json_line_fields() {
        let line = format_json(
            &Record::builder()
                .args(format_args!("Establish direct connection 10.0.0.1:22"))
                .level(log::Level::Info)
                .target("tunnel_dialer::dialer")
                .build(),
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "info");
        assert_eq!(value["target"], "tunnel_dialer::dialer");
        assert_eq!(value["message"], "Establish direct connection 10.0.0.1:22");
    }
}
