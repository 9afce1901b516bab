use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use lib_bridge::core::batcher::decode_frame_body;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Measures per-event-type rates on a bridge dashboard feed",
    long_about = None
)]
struct Args {
    /// Dashboard WebSocket endpoint
    #[clap(short, long, default_value = "ws://127.0.0.1:8092/ws")]
    url: String,

    /// Channels to subscribe to
    #[clap(short, long, value_delimiter = ',', default_value = "devices,alerts,system,scan,tak")]
    channels: Vec<String>,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_secs: u64,
}

#[derive(Default)]
struct Stats {
    batches: VecDeque<chrono::DateTime<Utc>>,
    compressed_batches: u64,
    per_type: HashMap<String, VecDeque<chrono::DateTime<Utc>>>,
}

fn prune(dq: &mut VecDeque<chrono::DateTime<Utc>>, cutoff: chrono::DateTime<Utc>) {
    while dq.front().is_some_and(|&t| t < cutoff) {
        dq.pop_front();
    }
}

fn record_frame(stats: &Mutex<Stats>, text: &str) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return,
    };
    if raw["type"] != "batch" {
        println!("control: {}", raw);
        return;
    }
    let compressed = raw["compressed"] == true;
    let Ok(batch) = decode_frame_body(text) else { return };

    let now = Utc::now();
    let mut data = stats.lock().unwrap_or_else(|p| p.into_inner());
    data.batches.push_back(now);
    if compressed {
        data.compressed_batches += 1;
    }
    for message in batch["messages"].as_array().into_iter().flatten() {
        let kind = message["type"].as_str().unwrap_or("unknown").to_string();
        data.per_type.entry(kind).or_default().push_back(now);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let stats = Arc::new(Mutex::new(Stats::default()));

    let stats_reporter = Arc::clone(&stats);
    let report_every = std::time::Duration::from_secs(args.report_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            sleep(report_every).await;
            let cutoff = Utc::now() - Duration::minutes(1);
            let mut data = stats_reporter.lock().unwrap_or_else(|p| p.into_inner());

            prune(&mut data.batches, cutoff);
            let batch_rate = data.batches.len();

            let mut rates: Vec<(String, usize)> = Vec::new();
            for (kind, dq) in data.per_type.iter_mut() {
                prune(dq, cutoff);
                if !dq.is_empty() {
                    rates.push((kind.clone(), dq.len()));
                }
            }
            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let report = rates
                .iter()
                .map(|(k, r)| format!("{}: {} msg/min", k, r))
                .collect::<Vec<_>>()
                .join(", ");

            println!("\n----- 1-Minute Summary -----");
            println!("Batches: {} /min ({} compressed total)", batch_rate, data.compressed_batches);
            println!("Events: {}", if report.is_empty() { "No data" } else { &report });
            println!("----------------------------\n");
        }
    });

    println!("Connecting to {}...", args.url);
    let (ws_stream, _) =
        connect_async(args.url.as_str()).await.context("connecting to dashboard feed")?;
    let (mut write, mut read) = ws_stream.split();

    let sub_msg = json!({ "subscribe": args.channels }).to_string();
    write.send(Message::Text(sub_msg.into())).await.context("sending subscription")?;
    println!("Subscribed to {:?}. Press Ctrl+C to stop.", args.channels);

    while let Some(Ok(msg)) = read.next().await {
        if let Message::Text(text) = msg {
            record_frame(&stats, text.as_str());
        }
    }
    println!("Feed closed.");
    Ok(())
}
