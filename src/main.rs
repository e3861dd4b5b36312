//! iprov - device farm provider for attached iOS devices
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::Parser;
use iprov_app::{load_settings, CONFIG_FILENAME};
use iprov_core::logging::{self, Verbosity};
use iprov_core::prelude::*;
use iprov_daemon::resolve_binary;

/// Provide attached iOS devices to a control floor
#[derive(Parser, Debug)]
#[command(name = "iprov")]
#[command(about = "Device farm provider for attached iOS devices", long_about = None)]
struct Args {
    /// Config file path
    #[arg(long, value_name = "PATH", default_value = CONFIG_FILENAME)]
    config: PathBuf,

    /// Use debug log level
    #[arg(long, conflicts_with = "warn")]
    debug: bool,

    /// Use warn log level
    #[arg(long)]
    warn: bool,

    /// Only provide these devices (repeatable)
    #[arg(long = "id", value_name = "UDID", num_args = 1..)]
    ids: Vec<String>,
}

impl Args {
    fn verbosity(&self) -> Verbosity {
        if self.debug {
            Verbosity::Debug
        } else if self.warn {
            Verbosity::Warn
        } else {
            Verbosity::Info
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    logging::init(args.verbosity())?;

    let mut settings = load_settings(&args.config)?;
    settings.id_list.extend(args.ids);

    let backend = resolve_binary(settings.bridge.backend_path())?;
    info!(
        "Using {} backend at {}",
        settings.bridge.backend,
        backend.display()
    );

    if let Err(e) = ios_provider::run(settings).await {
        error!("Provider stopped: {}", e);
        return Err(e.into());
    }

    info!("Provider exited cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["iprov"]).unwrap();
        assert_eq!(args.config, PathBuf::from("config.toml"));
        assert_eq!(args.verbosity(), Verbosity::Info);
        assert!(args.ids.is_empty());
    }

    #[test]
    fn test_args_ids_and_level() {
        let args =
            Args::try_parse_from(["iprov", "--debug", "--id", "AAA", "--id", "BBB"]).unwrap();
        assert_eq!(args.verbosity(), Verbosity::Debug);
        assert_eq!(args.ids, vec!["AAA", "BBB"]);
    }

    #[test]
    fn test_args_debug_conflicts_with_warn() {
        assert!(Args::try_parse_from(["iprov", "--debug", "--warn"]).is_err());
    }
}
