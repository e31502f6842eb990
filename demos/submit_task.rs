use clap::Parser;
use lapin::options::BasicPublishOptions;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use serde_json::json;

use dispatch_lite::config::BusConfig;

#[derive(Parser, Debug)]
#[command(name = "submit-task")]
#[command(about = "CLI publisher for exercising a running dispatch-lite scheduler")]
struct Args {
    /// AMQP connection string
    #[arg(long, default_value = "amqp://127.0.0.1:5672/%2f")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Publish an ADD_TASK message
    Add {
        /// Task type (must have a catalog entry)
        #[arg(short, long)]
        task_type: String,
        /// Dispatch delay in minutes
        #[arg(short, long, default_value = "0")]
        delay: u32,
        /// Retry limit carried to the worker
        #[arg(long, default_value = "0")]
        max_retry: u32,
    },
    /// Publish a COMPLETE_TASK message
    Complete {
        /// Id of the dispatched task
        #[arg(long)]
        task_id: String,
        /// Worker that executed it
        #[arg(long)]
        server_id: String,
        #[arg(short, long)]
        task_type: String,
    },
    /// Publish a join or leave event for a worker
    Join {
        #[arg(long)]
        server_id: String,
        /// 1 = join, anything else = leave
        #[arg(long, default_value = "1")]
        status: i32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let bus = BusConfig {
        url: args.url.clone(),
        ..BusConfig::default()
    };

    let connection = Connection::connect(&bus.url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;

    let (exchange, routing_key, payload) = match args.command {
        Commands::Add {
            task_type,
            delay,
            max_retry,
        } => (
            bus.exchange.clone(),
            bus.task_routing_key.clone(),
            json!({
                "meta": {
                    "action": "ADD_TASK",
                    "taskType": task_type,
                    "maxRetry": max_retry,
                    "delay": delay,
                }
            }),
        ),
        Commands::Complete {
            task_id,
            server_id,
            task_type,
        } => (
            bus.exchange.clone(),
            bus.completion_routing_key.clone(),
            json!({
                "id": task_id,
                "meta": {
                    "action": "COMPLETE_TASK",
                    "taskType": task_type,
                    "serverId": server_id,
                }
            }),
        ),
        Commands::Join { server_id, status } => {
            channel
                .exchange_declare(
                    &bus.join_exchange,
                    ExchangeKind::Fanout,
                    lapin::options::ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            (
                bus.join_exchange.clone(),
                String::new(),
                json!({ "serverId": server_id, "status": status }),
            )
        }
    };

    let body = serde_json::to_vec(&payload)?;
    channel
        .basic_publish(
            &exchange,
            &routing_key,
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await?
        .await?;

    println!("published to exchange {exchange} with routing key \"{routing_key}\"");
    println!("{payload}");

    Ok(())
}
