use anyhow::{bail, Context, Result};
use clap::Parser;
use log::debug;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tunnel_dialer::config::{DialerConfig, LoggingConfig};
use tunnel_dialer::logging::{parse_log_format, parse_log_level};
use tunnel_dialer::{logging, TunnelDialer};

#[derive(Parser)]
#[clap(
    version,
    about = "Connects stdin/stdout to host:port, through the configured proxy when there is one",
    after_help = "Proxy settings come from SSH_PROXY, HTTPS_PROXY, HTTP_PROXY, ALL_PROXY and NO_PROXY \
                  unless --config is given. Set TUNNEL_DEBUG=1 to trace path decisions on stderr."
)]
struct Args {
    #[clap(value_name = "HOST", help = "Target host, or host:port")]
    host: String,

    #[clap(value_name = "PORT", help = "Target port when HOST has none")]
    port: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Dialer configuration file (JSON)")]
    config: Option<String>,

    #[clap(short, long, value_name = "SECONDS", help = "Connection timeout in seconds")]
    timeout: Option<u64>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Write a sample configuration file and exit")]
    generate_config: Option<String>,
}

fn is_true(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// `host port` or `host:port`; IPv6 hosts are bracketed when joined.
fn target_address(host: &str, port: Option<&str>) -> String {
    match port {
        Some(port) if host.contains(':') && !host.starts_with('[') => format!("[{}]:{}", host, port),
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn logging_config(args: &Args, config: Option<&DialerConfig>) -> Result<LoggingConfig> {
    let mut logging = config.and_then(|c| c.logging.clone()).unwrap_or_default();
    if let Some(level) = &args.log_level {
        logging.level = Some(parse_log_level(level).map_err(|e| anyhow::anyhow!("{}", e))?);
    }
    if let Some(format) = &args.log_format {
        logging.format = Some(parse_log_format(format).map_err(|e| anyhow::anyhow!("{}", e))?);
    }
    // stdout carries the tunnel; keep stderr quiet unless asked
    if logging.level.is_none() {
        logging.level = Some(tunnel_dialer::config::LogLevel::Warn);
    }
    Ok(logging)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        let sample = DialerConfig {
            proxy_server: Some("http://proxy.example.com:3128".to_string()),
            bypass_list: Some("localhost,127.0.0.0/8,.corp.example.com".to_string()),
            ..DialerConfig::default()
        };
        sample
            .to_file(path)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("failed to write {}", path))?;
        println!("Sample configuration file generated: {}", path);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Some(
            DialerConfig::from_file(path)
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("failed to load configuration {}", path))?,
        ),
        None => None,
    };

    if let Err(e) = logging::init(&logging_config(&args, config.as_ref())?) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let mut dialer = match &config {
        Some(config) => TunnelDialer::from_config(config)?,
        None => TunnelDialer::from_env()?,
    };
    if let Some(secs) = args.timeout {
        if secs == 0 {
            bail!("--timeout must be greater than zero");
        }
        dialer = dialer.with_timeout(Duration::from_secs(secs));
    }
    if std::env::var("TUNNEL_DEBUG").map(|v| is_true(&v)).unwrap_or(false) {
        dialer = dialer.with_debug_sink(Arc::new(|msg: &str| {
            let _ = writeln!(std::io::stderr(), "\x1b[33m{}\x1b[0m", msg);
        }));
    }

    let address = target_address(&args.host, args.port.as_deref());
    debug!("Use netcat to connect: {}", address);
    let conn = dialer
        .dial(&address)
        .await
        .with_context(|| format!("unable to dial {}", address))?;
    debug!("Address: {} remote: {} via {}", address, conn.peer_addr(), conn.kind());

    let (mut reader, mut writer) = tokio::io::split(conn);
    let upload = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut tokio::io::stdin(), &mut writer).await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
        copied
    });

    let mut stdout = tokio::io::stdout();
    let downloaded = tokio::io::copy(&mut reader, &mut stdout).await;
    tokio::io::AsyncWriteExt::flush(&mut stdout).await.ok();
    upload.abort();

    downloaded.context("connection closed with an error")?;
    Ok(())
}
