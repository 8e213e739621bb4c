//! mesh-sim — synthetic mesh-traffic feeder.
//!
//! Publishes the message shapes the backend ingests, without any radios:
//!   1. Position payloads with inline coordinates (direct-coords path)
//!   2. `/status` markers (online tracking independent of parsing)
//!   3. Packet blobs carrying a path header through intermediate fleet
//!      nodes (exercises the probe, decoder and path-resolution pipeline)
//!
//! Nodes drift on a ring around the configured center so trails and the
//! reaper have something to chew on.

mod fleet;

use std::time::Duration;

use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use tracing::{info, warn};

use fleet::Fleet;

#[derive(Parser, Debug)]
#[command(name = "mesh-sim", about = "Meshmap synthetic mesh-traffic feeder")]
struct Args {
    /// Broker host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Broker port
    #[arg(long, default_value = "1883")]
    port: u16,
    /// Topic root the backend subscribes to
    #[arg(long, default_value = "meshcore/v1")]
    topic_root: String,
    /// Number of simulated nodes
    #[arg(long, default_value = "6")]
    nodes: usize,
    /// Seconds between publish rounds
    #[arg(long, default_value = "5")]
    interval: u64,
    /// Map center latitude
    #[arg(long, default_value = "42.3601")]
    center_lat: f64,
    /// Map center longitude
    #[arg(long, default_value = "-71.0589")]
    center_lon: f64,
    /// Ring radius in kilometers
    #[arg(long, default_value = "5.0")]
    radius_km: f64,
    /// RNG seed, for reproducible fleets
    #[arg(long, default_value = "7")]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut fleet = Fleet::new(args.nodes, args.center_lat, args.center_lon, args.radius_km, args.seed);
    info!(nodes = args.nodes, host = %args.host, port = args.port, "mesh-sim starting");

    let mut options = MqttOptions::new("mesh-sim", args.host.clone(), args.port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 16);

    // The event loop must keep turning for publishes to flush.
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                warn!(error = %e, "broker connection error");
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    });

    let mut round = 0u64;
    loop {
        fleet.advance();
        for node in fleet.nodes() {
            let position = json!({
                "direction": "tx",
                "origin": node.id,
                "name": node.name,
                "role": node.role,
                "lat": node.lat,
                "lon": node.lon,
            });
            publish(&client, &format!("{}/{}/packets", args.topic_root, node.id), position.to_string()).await;

            publish(&client, &format!("{}/{}/status", args.topic_root, node.id), json!({
                "origin": node.name,
                "status": "online",
            }).to_string()).await;
        }

        // One multi-hop packet blob per round: a path header of node hashes
        // through 1-3 intermediate fleet nodes plus a random tail. The hops
        // resolve to real fleet nodes once a decoder script is configured
        // on the backend.
        if let Some((receiver, blob)) = fleet.random_packet() {
            let packet = json!({
                "direction": "rx",
                "packet": hex::encode(blob),
            });
            publish(&client, &format!("{}/{}/packets", args.topic_root, receiver), packet.to_string()).await;
        }

        round += 1;
        if round % 12 == 0 {
            info!(round, "still feeding");
        }
        tokio::time::sleep(Duration::from_secs(args.interval.max(1))).await;
    }
}

async fn publish(client: &AsyncClient, topic: &str, payload: String) {
    if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, payload).await {
        warn!(topic, error = %e, "publish failed");
    }
}
