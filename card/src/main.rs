// Card simulator: one hex-encoded command APDU per stdin line, one hex
// response per stdout line. Log lines go to stderr.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use log::{Log, Metadata, Record};
use zereans_card_lib::{CardConfig, ConfigStore, DeviceContext};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn load_config() -> Result<CardConfig> {
    let from_env = CardConfig::from_env().context("Failed to load card configuration")?;
    match std::env::args().nth(1) {
        // The file is the base; ZEREANS_* variables still override it.
        Some(path) => ConfigStore::new(&path)
            .load_with_overrides(from_env.environment, |name| std::env::var(name).ok())
            .with_context(|| format!("Failed to load card configuration from {}", path)),
        None => Ok(from_env),
    }
}

fn main() -> Result<()> {
    log::set_logger(&LOGGER).map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;
    let config = load_config()?;
    log::set_max_level(config.log_filter()?);
    log::info!("Log level set to {}", log::max_level());

    let mut device = DeviceContext::new(config).context("Failed to create device")?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line.context("Failed to read command line")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
        match hex::decode(&compact) {
            Ok(apdu) => {
                let response = device.process(&apdu);
                writeln!(out, "{}", hex::encode_upper(response))?;
            }
            Err(err) => {
                log::warn!("Ignoring line that is not hex: {}", err);
                writeln!(out, "ERR {}", err)?;
            }
        }
        out.flush()?;
    }

    Ok(())
}
