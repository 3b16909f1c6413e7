use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{Level, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Map the `-d`/`-q` counters onto a level, INFO being the default.
pub fn level_for(debug: u8, quiet: u8) -> Level {
    match debug as i16 - quiet as i16 {
        i16::MIN..=-2 => Level::ERROR,
        -1 => Level::WARN,
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the command line.
pub fn init(level: Level, timestamps: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let layer = fmt::layer().with_target(false);
    if timestamps {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer.without_time())
            .try_init();
    }
}

/// Plain-text transcript of every CAPI command and final response (`-L`).
#[derive(Debug, Clone)]
pub struct SummaryLog {
    file: Arc<Mutex<File>>,
}

impl SummaryLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening summary log {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn line(&self, text: &str) {
        let Ok(mut f) = self.file.lock() else {
            return;
        };
        if let Err(e) = writeln!(f, "{}", text) {
            warn!("summary log write failed: {}", e);
        }
    }
}
