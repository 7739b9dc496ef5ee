// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::path::PathBuf;
use std::process::ExitCode;

use broker::{Broker, Config};
use clap::Parser;

/// High performance MQTT 5 broker.
#[derive(Debug, Parser)]
#[command(name = "broker", version, about = "MQTT 5 broker")]
struct Cli {
    /// Path to a TOML configuration file; defaults built into `Config` are used if omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Parse the configuration file and exit without binding a listener.
    #[arg(short, long)]
    test: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                log::error!("broker: failed to load {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    if cli.test {
        println!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    let (broker, mut events) = Broker::new(config);
    tokio::spawn(async move { while events.recv().await.is_some() {} });

    if let Err(err) = broker.serve().await {
        log::error!("broker: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
