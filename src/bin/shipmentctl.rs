// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Command line entry point: runs the consumer worker, publishes single
//! updates and queries broker/producer health.

use anyhow::Context;
use clap::{Parser, Subcommand};
use shipment_relay::{
    config::{BrokerConfig, MonitorConfig},
    handler::LoggingHandler,
    logging::{init_tracing, LogFormat},
    message::ShipmentUpdate,
    monitor::Monitor,
    publisher::{Publisher, ShipmentPublisher},
    runtime::ConsumerRuntime,
    topology::inspect_queue,
};
use std::{process::ExitCode, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "shipmentctl", about = "Shipment update delivery pipeline")]
struct Cli {
    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume shipment updates until interrupted.
    Consume,
    /// Publish one shipment update given as a JSON object.
    Publish {
        /// e.g. '{"shipmentId":"S1","status":"IN_TRANSIT","timestamp":"2024-01-01T00:00:00Z"}'
        json: String,
    },
    /// Print message and consumer counts of a queue.
    Inspect {
        /// Defaults to QUEUE_NAME.
        queue: Option<String>,
    },
    /// Print the aggregated health report as JSON.
    Health,
    /// Print the monitor counters.
    Metrics,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = format!("{err:#}"), "shipmentctl failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    let broker = Arc::new(BrokerConfig::from_env().context("invalid broker configuration")?);

    match command {
        Command::Consume => consume(broker).await,
        Command::Publish { json } => {
            let update: ShipmentUpdate =
                serde_json::from_str(&json).context("invalid shipment update")?;
            ShipmentPublisher::new(broker).publish(&update).await?;
            info!(shipment_id = %update.shipment_id, "shipment update sent");
            Ok(())
        }
        Command::Inspect { queue } => {
            let name = queue.unwrap_or_else(|| broker.queue_name.clone());
            let stats = inspect_queue(&broker, &name).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Health => {
            let report = monitor(broker)?.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Metrics => {
            print!("{}", monitor(broker)?.metrics().await);
            Ok(())
        }
    }
}

async fn consume(broker: Arc<BrokerConfig>) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let runtime = ConsumerRuntime::new(broker, Arc::new(LoggingHandler), shutdown.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stopping consumer...");
        }
        shutdown.cancel();
    });

    runtime.run().await?;
    Ok(())
}

fn monitor(broker: Arc<BrokerConfig>) -> anyhow::Result<Monitor> {
    let cfg = MonitorConfig::from_env().context("invalid monitor configuration")?;
    Ok(Monitor::new(broker, cfg)?)
}
