//! Provisions the device credentials held by a PKCS #11 token.

use std::process::ExitCode;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::command;
use clap::Parser;
use p11_token::Cryptoki;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use key_provisioning::KeyProvisioning;
use key_provisioning::ProvisioningConfig;

/// Provision the TLS credentials of this device into a PKCS#11 token.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(version)]
pub struct Args {
    /// The provisioning configuration file.
    #[arg(long, default_value = "./key-provisioning.toml")]
    config: Utf8PathBuf,

    /// The path to the PKCS#11 module, overriding `token.module_path`.
    #[arg(long)]
    module_path: Option<Utf8PathBuf>,

    /// The PIN for the PKCS#11 token, overriding `token.pin`.
    #[arg(long)]
    pin: Option<String>,

    /// Turn-on the debug log level.
    ///
    /// If off only reports ERROR, WARN, and INFO.
    /// If on also reports DEBUG and TRACE.
    #[arg(long)]
    debug: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let default_level = if args.debug {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = ProvisioningConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    if let Some(module_path) = args.module_path {
        config.token.module_path = Some(module_path);
    }
    if let Some(pin) = args.pin {
        config.token.pin = Some(pin.into());
    }

    let cryptoki_config = config.token.cryptoki_config()?;
    info!(?cryptoki_config, mode = ?config.mode(), "Using cryptoki configuration");
    let cryptoki = Cryptoki::new(cryptoki_config).context("Failed to load the PKCS#11 module")?;

    let mut provisioning = KeyProvisioning::new(&cryptoki, config, std::io::stdout());
    let report = provisioning.start_key_provisioning();

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
