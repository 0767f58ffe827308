//! Mock plugin executable.
//!
//! Serves the mock backend from `lockbox-plugin-mock`. The host launches it
//! like any other plugin; `--debug` runs it standalone and prints a
//! reattach configuration for `VAULT_REATTACH_PLUGINS`.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use lockbox::ServeConfig;
use lockbox::logging::init_plugin_tracing;
use lockbox_plugin_mock::MockFactory;

#[derive(Parser, Debug)]
#[command(name = "lockbox-mock-plugin")]
struct Args {
    /// Run without a host and print a reattach configuration.
    #[arg(long, env = "LOCKBOX_PLUGIN_DEBUG")]
    debug: bool,

    /// Name used in the reattach configuration.
    #[arg(long, default_value = "mock")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_plugin_tracing();

    let mut config = ServeConfig::new(args.name, Arc::new(MockFactory::new()));
    config.debug = args.debug;
    lockbox::serve(config).await?;
    Ok(())
}
