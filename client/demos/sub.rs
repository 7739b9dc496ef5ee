// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::process::ExitCode;

use clap::Parser;
use client::async_client::AsyncClient;
use client::connect_options::ConnectOptions;
use codec::QoS;

/// Subscribe to a topic and print every message received.
#[derive(Debug, Parser)]
#[command(name = "client-sub", version, about = "MQTT 5 subscriber")]
struct Cli {
    /// Broker address, host:port.
    #[arg(short, long, default_value = "127.0.0.1:1883")]
    address: String,

    /// Topic filter to subscribe to.
    #[arg(short, long, default_value = "hebo/#")]
    topic: String,

    #[arg(short, long, default_value = "0")]
    qos: u8,
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
            eprintln!("client-sub: invalid address {}: {err}", cli.address);
            return ExitCode::FAILURE;
        }
    };

    let (client, mut messages) = match AsyncClient::connect(&options).await {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("client-sub: connect failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = client.subscribe(&[(&cli.topic, qos)]).await {
        eprintln!("client-sub: subscribe failed: {err}");
        return ExitCode::FAILURE;
    }
    println!("subscribed to {}", cli.topic);

    while let Some(message) = messages.recv().await {
        println!(
            "{}: {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
    }
    ExitCode::SUCCESS
}
