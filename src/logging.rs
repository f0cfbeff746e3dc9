//! Global tracing subscriber, installed once per process.
//!
//! Always writes to stderr: a child bridge's stdout carries the message
//! channel, and children inherit the host's stderr.

use crate::config::HostOptions;
use std::io::{self, IsTerminal};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Filter used when `RUST_LOG` is not set.
pub fn default_directive(options: &HostOptions) -> &'static str {
    if options.debug_mode_enabled {
        "debug"
    } else {
        "info"
    }
}

pub fn init(options: &HostOptions) {
    INIT.get_or_init(|| install(options));
}

fn install(options: &HostOptions) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(options)));
    let ansi = options.force_colour_logging || io::stderr().is_terminal();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(ansi)
        .with_target(false);
    let installed = if options.no_log_timestamps {
        builder.without_time().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("Failed to install log subscriber: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_lowers_default_level() {
        let mut options = HostOptions::default();
        assert_eq!(default_directive(&options), "info");
        options.debug_mode_enabled = true;
        assert_eq!(default_directive(&options), "debug");
    }

    #[test]
    fn init_is_idempotent() {
        let options = HostOptions {
            no_log_timestamps: true,
            ..HostOptions::default()
        };
        init(&options);
        init(&HostOptions::default());
        tracing::info!("still logging");
    }
}
