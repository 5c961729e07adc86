use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use eventline_client::{ClientConfig, EventClient};
use eventline_protocol::Topic;

/// Tail envelopes from an eventline server.
#[derive(Debug, Parser)]
#[command(name = "eventline-tail")]
struct Args {
    /// WebSocket endpoint.
    #[arg(long, env = "EVENTLINE_URL", default_value = "ws://127.0.0.1:3000/ws/events")]
    url: String,

    /// Authentication token.
    #[arg(long, env = "EVENTLINE_TOKEN")]
    token: String,

    /// Topics to subscribe to, e.g. `ops` or `conversation:<uuid>`.
    #[arg(long = "topic", required = true)]
    topics: Vec<String>,

    /// Also print the reconstructed assistant text as it streams.
    #[arg(long)]
    follow_stream: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let topics = args
        .topics
        .iter()
        .map(|t| t.parse::<Topic>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut config = ClientConfig::new(args.url.clone(), args.token.clone());
    config.topics = topics;

    let client = Arc::new(EventClient::new(
        config,
        Box::new(|envelope| match serde_json::to_string(envelope) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "unprintable envelope"),
        }),
    ));

    if args.follow_stream {
        let client = client.clone();
        tokio::spawn(async move {
            let mut last = String::new();
            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let current = client.visible_content();
                if current != last {
                    eprintln!("--- {}", current);
                    last = current;
                }
            }
        });
    }

    {
        let client = client.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, closing");
                client.disconnect();
            }
        });
    }

    client.run().await?;
    Ok(())
}
