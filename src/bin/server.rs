//! CLI entry point: `server [-h] [-c <config>]`.

use std::env;
use std::process::ExitCode;

use anyhow::Context;

use nexa_storaged::config::Config;
use nexa_storaged::net::server::Server;

const USAGE: &str = "usage: server [-h] [-c <config>]";

enum Args {
    Help,
    Run { config_path: Option<String> },
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    raw.next(); // argv[0]
    let mut config_path = None;
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Args::Help),
            "-c" | "--config" => {
                let path = raw.next().context("-c requires a config file path")?;
                config_path = Some(path);
            }
            other => anyhow::bail!("unrecognized argument `{other}`\n{USAGE}"),
        }
    }
    Ok(Args::Run { config_path })
}

fn run() -> anyhow::Result<()> {
    env_logger::init();

    let args = parse_args(env::args())?;
    let config_path = match args {
        Args::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        Args::Run { config_path } => config_path,
    };

    let config = match config_path {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading config from {path}"))?,
        None => Config::default(),
    };

    log::info!(
        "starting on {} with {} workers (max_file_num={}, max_bytes={}, policy={:?})",
        config.socket_path,
        config.n_workers,
        config.max_file_num,
        config.max_bytes,
        config.eviction_policy,
    );

    let server = Server::bind(&config).with_context(|| format!("binding socket at {}", config.socket_path))?;
    server.run().context("master event loop failed")?;

    log::info!("clean shutdown");
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("server: {err:#}");
            ExitCode::FAILURE
        }
    }
}
