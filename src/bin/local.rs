//! `sslocal`: parses CLI flags (and an optional config file), sets up
//! logging, loads the access list, and runs the SOCKS5 listener.

use clap::Parser;
use log::error;

use ss_local_core::acl::AccessControl;
use ss_local_core::config::{Cli, Config};
use ss_local_core::Context;

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Logging needs to start before configuration errors are reported, but
    // verbosity itself comes from the CLI, so initialize before merging.
    init_logger(cli.verbose);

    let config = Config::from_cli(cli)?;

    let acl = match &config.acl_path {
        Some(path) => AccessControl::load_from_file(path)?,
        None => AccessControl::empty(),
    };

    let ctx = Context::new(config, acl);

    if let Err(err) = ss_local_core::run(ctx).await {
        error!("fatal: {err}");
        return Err(err.into());
    }

    Ok(())
}
