use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug, Clone)]
#[clap(about = "WebSocket client simulator for load and latency testing", long_about = None)]
struct Args {
    /// WebSocket server URL.
    #[clap(long, default_value = "ws://localhost:8765/ws")]
    url: String,

    /// Number of concurrent connections.
    #[clap(long, default_value_t = 1)]
    concurrency: usize,

    /// Processing delay per message (ms). Simulates a slow consumer.
    #[clap(long, default_value_t = 0)]
    slow_ms: u64,

    /// Random jitter applied to the processing delay (ms).
    #[clap(long, default_value_t = 0)]
    jitter_ms: u64,

    /// Test duration (seconds).
    #[clap(long, default_value_t = 30)]
    duration: u64,

    /// Print stats every N messages.
    #[clap(long, default_value_t = 100)]
    print_every: u64,

    /// Client ID prefix.
    #[clap(long, default_value = "cli")]
    id_prefix: String,

    /// Echo each ts_send back as ack_ts so the server can sample
    /// end-to-end latency.
    #[clap(long)]
    ack: bool,
}

/// The fields of a broadcast envelope the simulator cares about. The
/// payload itself is opaque and skipped.
#[derive(Debug, Deserialize)]
struct EnvelopeMsg {
    seq: u64,
    ts_send: f64,
}

#[derive(Debug, Default)]
struct ClientStats {
    count: u64,
    latencies: Vec<f64>,
    last_seq: u64,
    drops_inferred: u64,
}

impl ClientStats {
    /// Min, mean and p95 over the collected latencies.
    fn latency_summary(&self) -> (f64, f64, f64) {
        if self.latencies.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let min = sorted[0];
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let idx = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);
        (min, mean, sorted[idx])
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn processing_delay(args: &Args) -> Duration {
    let mut delay_ms = args.slow_ms as f64;
    if args.jitter_ms > 0 {
        use rand::Rng;
        let jitter = (rand::rng().random::<f64>() - 0.5) * 2.0 * args.jitter_ms as f64;
        delay_ms += jitter;
    }
    Duration::from_secs_f64((delay_ms / 1000.0).max(0.0))
}

fn handle_envelope(
    args: &Args,
    name: &str,
    envelope: &EnvelopeMsg,
    stats: &Mutex<ClientStats>,
    started: Instant,
) {
    let mut stats = stats.lock().expect("stats lock poisoned");
    stats.latencies.push((now_secs() - envelope.ts_send) * 1000.0);

    // A gap in seq means the server shed frames for this client.
    if stats.last_seq > 0 && envelope.seq > stats.last_seq + 1 {
        stats.drops_inferred += envelope.seq - stats.last_seq - 1;
    }
    stats.last_seq = envelope.seq;
    stats.count += 1;

    if stats.count % args.print_every == 0 {
        print_client_stats(name, &stats, started);
    }
}

fn print_client_stats(name: &str, stats: &ClientStats, started: Instant) {
    let (min, mean, p95) = stats.latency_summary();
    let runtime = started.elapsed().as_secs_f64();
    let rate = if runtime > 0.0 {
        stats.count as f64 / runtime
    } else {
        0.0
    };
    println!(
        "[{}] Count: {:6} | Rate: {:6.1}/s | Latency min/avg/p95: {:6.1}/{:6.1}/{:6.1}ms | Drops: {}",
        name, stats.count, rate, min, mean, p95, stats.drops_inferred
    );
}

async fn client_worker(args: Args, index: usize, stats: Arc<Mutex<ClientStats>>, started: Instant) {
    let name = format!("{}-{}", args.id_prefix, index);
    let deadline = started + Duration::from_secs(args.duration);
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    while Instant::now() < deadline {
        match connect_async(args.url.as_str()).await {
            Ok((mut ws, _)) => {
                println!("[{}] Connected to {}", name, args.url);
                backoff = Duration::from_secs(1);

                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        let _ = ws.close(None).await;
                        return;
                    }
                    let frame = match tokio::time::timeout(deadline - now, ws.next()).await {
                        Err(_) => {
                            let _ = ws.close(None).await;
                            return;
                        }
                        Ok(None) => {
                            println!("[{}] Connection closed", name);
                            break;
                        }
                        Ok(Some(Err(err))) => {
                            println!("[{}] Error: {}", name, err);
                            break;
                        }
                        Ok(Some(Ok(frame))) => frame,
                    };

                    let Message::Text(text) = frame else {
                        continue;
                    };
                    let Ok(envelope) = serde_json::from_str::<EnvelopeMsg>(&text) else {
                        println!("[{}] Invalid JSON message", name);
                        continue;
                    };
                    handle_envelope(&args, &name, &envelope, &stats, started);

                    if args.ack {
                        let ack = serde_json::json!({ "ack_ts": envelope.ts_send }).to_string();
                        if ws.send(Message::Text(ack.into())).await.is_err() {
                            break;
                        }
                    }

                    if args.slow_ms > 0 {
                        tokio::time::sleep(processing_delay(&args)).await;
                    }
                }
            }
            Err(err) => println!("[{}] Error: {}", name, err),
        }

        // Exponential backoff for reconnection
        if Instant::now() < deadline {
            println!("[{}] Reconnecting in {}s...", name, backoff.as_secs());
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }
}

fn print_final_summary(args: &Args, all_stats: &[Arc<Mutex<ClientStats>>], started: Instant) {
    println!("\n{}", "=".repeat(80));
    println!("FINAL SUMMARY");
    println!("{}", "=".repeat(80));

    let runtime = started.elapsed().as_secs_f64();
    let mut total_messages = 0u64;
    let mut total_drops = 0u64;
    for stats in all_stats {
        let stats = stats.lock().expect("stats lock poisoned");
        total_messages += stats.count;
        total_drops += stats.drops_inferred;
    }

    println!("Total Runtime: {:.1}s", runtime);
    println!("Total Messages: {}", total_messages);
    println!("Total Drops: {}", total_drops);
    if runtime > 0.0 {
        println!("Overall Rate: {:.1} msg/s", total_messages as f64 / runtime);
    }
    println!();

    println!(
        "{:<15} {:<10} {:<8} {:<8} {:<8} {:<8} {:<8}",
        "Client", "Messages", "Rate/s", "Min", "Avg", "P95", "Drops"
    );
    println!("{}", "-".repeat(80));

    for (index, stats) in all_stats.iter().enumerate() {
        let stats = stats.lock().expect("stats lock poisoned");
        let name = format!("{}-{}", args.id_prefix, index);
        let (min, mean, p95) = stats.latency_summary();
        let rate = if runtime > 0.0 {
            stats.count as f64 / runtime
        } else {
            0.0
        };
        println!(
            "{:<15} {:<10} {:<8.1} {:<8.1} {:<8.1} {:<8.1} {:<8}",
            name, stats.count, rate, min, mean, p95, stats.drops_inferred
        );
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    println!(
        "Starting {} clients for {}s",
        args.concurrency, args.duration
    );
    println!("Target: {}", args.url);
    if args.slow_ms > 0 {
        println!("Slow mode: {}ms delay per message", args.slow_ms);
    }
    if args.jitter_ms > 0 {
        println!("Jitter: +/-{}ms", args.jitter_ms);
    }
    println!();

    let started = Instant::now();
    let mut handles = Vec::new();
    let mut all_stats = Vec::new();
    for index in 0..args.concurrency {
        let stats = Arc::new(Mutex::new(ClientStats::default()));
        all_stats.push(Arc::clone(&stats));
        handles.push(tokio::spawn(client_worker(
            args.clone(),
            index,
            stats,
            started,
        )));
    }

    tokio::select! {
        _ = futures_util::future::join_all(handles) => {}
        _ = tokio::signal::ctrl_c() => println!("\nInterrupted by user"),
    }

    print_final_summary(&args, &all_stats, started);
}
