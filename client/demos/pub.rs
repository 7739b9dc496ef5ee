// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::process::ExitCode;

use clap::Parser;
use client::async_client::AsyncClient;
use client::connect_options::ConnectOptions;
use codec::QoS;

/// Publish a single message to a topic and exit.
#[derive(Debug, Parser)]
#[command(name = "client-pub", version, about = "MQTT 5 publisher")]
struct Cli {
    /// Broker address, host:port.
    #[arg(short, long, default_value = "127.0.0.1:1883")]
    address: String,

    /// Topic to publish to.
    #[arg(short, long, default_value = "hebo/demo")]
    topic: String,

    /// Message payload.
    #[arg(short, long, default_value = "hello")]
    message: String,

    #[arg(short, long, default_value = "0")]
    qos: u8,

    /// Set the RETAIN flag on the published message.
    #[arg(short, long)]
    retain: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let qos = match cli.qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactOnce,
        _ => QoS::AtMostOnce,
    };

    let options = match ConnectOptions::new(&cli.address) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("client-pub: invalid address {}: {err}", cli.address);
            return ExitCode::FAILURE;
        }
    };

    let (client, _messages) = match AsyncClient::connect(&options).await {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("client-pub: connect failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = client.publish(&cli.topic, qos, cli.retain, cli.message.as_bytes()).await {
        eprintln!("client-pub: publish failed: {err}");
        return ExitCode::FAILURE;
    }
    if let Err(err) = client.disconnect().await {
        eprintln!("client-pub: disconnect failed: {err}");
    }
    println!("published to {}", cli.topic);
    ExitCode::SUCCESS
}
