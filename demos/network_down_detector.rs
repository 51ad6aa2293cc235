//! Feeds a canned `ping` transcript through a `DispatchingConnection` and
//! reports the moment a "network is unreachable"/"network is up" toggle is
//! detected — a runnable port of the `NetworkDownDetector`/
//! `NetworkUpDetector` pair pattern.
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use moler_rs::config::ConnectionSettings;
use moler_rs::connection::DispatchingConnection;
use moler_rs::event::{Event, EventMatcher, EventSettings};
use moler_rs::logging::init_tracing;
use moler_rs::runner::{Runner, TaskPerObserverRunner};
use moler_rs::transport::LoopbackTransport;
use tokio::time::Instant;

#[derive(Parser, Debug)]
struct Args {
    /// Address the toy ping transcript pretends to target.
    #[arg(long, default_value = "10.0.2.15")]
    net_ip: String,
}

struct NetworkToggleMatcher {
    detect_pattern: String,
}

impl EventMatcher for NetworkToggleMatcher {
    type Occurrence = ();

    fn on_line(&mut self, line: &str) -> Option<Self::Occurrence> {
        line.contains(&self.detect_pattern).then_some(())
    }
}

fn network_down_detector(conn: DispatchingConnection) -> Arc<Event<NetworkToggleMatcher>> {
    Event::new(
        conn,
        "network-down-detector",
        NetworkToggleMatcher { detect_pattern: "Network is unreachable".into() },
        EventSettings { timeout: Duration::from_secs(30), till_occurs_times: 1 },
    )
}

fn network_up_detector(conn: DispatchingConnection, net_ip: &str) -> Arc<Event<NetworkToggleMatcher>> {
    Event::new(
        conn,
        "network-up-detector",
        NetworkToggleMatcher { detect_pattern: format!("bytes from {net_ip}") },
        EventSettings { timeout: Duration::from_secs(30), till_occurs_times: 1 },
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("moler=info");
    let args = Args::parse();

    let conn = DispatchingConnection::new(
        Arc::new(LoopbackTransport::new()),
        ConnectionSettings::named("ping-session"),
    );
    let runner: Arc<dyn Runner> = Arc::new(TaskPerObserverRunner::default());

    let down = network_down_detector(conn.clone());
    down.start(&runner)?;
    let up = network_up_detector(conn.clone(), &args.net_ip);
    up.start(&runner)?;

    // Toy transcript: a few successful replies, a dropout, then recovery.
    let transcript = [
        format!("64 bytes from {}: icmp_req=1 ttl=64 time=0.045 ms\n", args.net_ip),
        format!("64 bytes from {}: icmp_req=2 ttl=64 time=0.041 ms\n", args.net_ip),
        "ping: sendmsg: Network is unreachable\n".to_string(),
        "ping: sendmsg: Network is unreachable\n".to_string(),
        format!("64 bytes from {}: icmp_req=7 ttl=64 time=0.123 ms\n", args.net_ip),
    ];

    for line in &transcript {
        conn.data_received(line.as_bytes(), Instant::now());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if !down.occurrences().is_empty() {
        println!("network {} is down", args.net_ip);
    }
    let recovered = up.await_done(Some(Duration::from_secs(1))).await;
    if recovered.is_ok() {
        println!("network {} is up", args.net_ip);
    }

    Ok(())
}
