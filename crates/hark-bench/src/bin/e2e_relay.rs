//! End-to-end relay benchmark for Hark.
//!
//! Pairs of clients register against a running server and one side of each
//! pair floods the other with private messages. Only delivered
//! `private-message` events are counted.

use futures_util::{SinkExt, StreamExt};
use hark_protocol::{codec, ClientEvent, ServerEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const SERVER_URL: &str = "ws://127.0.0.1:3001/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_pairs = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8);
    let url = args.get(2).cloned().unwrap_or_else(|| SERVER_URL.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║          Hark End-to-End Relay Benchmark                     ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_relay_benchmark(num_pairs, Arc::new(url)).await;
}

async fn run_relay_benchmark(num_pairs: usize, url: Arc<String>) {
    println!("📊 Private message relay: {} client pairs", num_pairs);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let delivered = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_pairs * 2 + 1));

    let mut handles = Vec::new();

    for pair in 0..num_pairs {
        let sender_id = format!("bench-sender-{}", pair);
        let receiver_id = format!("bench-receiver-{}", pair);

        let url_rx = Arc::clone(&url);
        let count = Arc::clone(&delivered);
        let barrier_rx = Arc::clone(&barrier);
        let receiver_name = receiver_id.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_receiver(&url_rx, &receiver_name, count, barrier_rx).await {
                eprintln!("Receiver {} error: {}", receiver_name, e);
            }
        }));

        let url_tx = Arc::clone(&url);
        let barrier_tx = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_sender(&url_tx, &sender_id, &receiver_id, barrier_tx).await {
                eprintln!("Sender {} error: {}", sender_id, e);
            }
        }));
    }

    // Wait for every client to register
    barrier.wait().await;
    println!("✓ All {} clients registered", num_pairs * 2);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Pairs:                {:>10}                           ║", num_pairs);
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!("║  Delivered:            {:>10}                           ║", total);
    println!("║  Throughput:           {:>10.0} msg/s                    ║", per_sec);
    println!(
        "║  Per-Pair:             {:>10.0} msg/s                    ║",
        per_sec / num_pairs as f64
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

/// Connect and register, returning once our own online status comes back.
async fn register(url: &str, user: &str) -> Result<Client, BoxError> {
    let (mut ws, _) = connect_async(url).await?;
    let register = codec::encode_json(&ClientEvent::register(user))?;
    ws.send(Message::Text(register)).await?;

    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg? {
            if let Ok(ServerEvent::Status(status)) = codec::decode_json(&text) {
                if status.user_id == user && status.status {
                    return Ok(ws);
                }
            }
        }
    }
    Err(format!("connection closed before {} was registered", user).into())
}

async fn run_receiver(
    url: &str,
    user: &str,
    delivered: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let mut ws = register(url, user).await?;
    barrier.wait().await;

    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg? {
            if let Ok(ServerEvent::PrivateMessage(_)) = codec::decode_json(&text) {
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    Ok(())
}

async fn run_sender(url: &str, user: &str, target: &str, barrier: Arc<Barrier>) -> Result<(), BoxError> {
    let ws = register(url, user).await?;
    let (mut sender, mut receiver) = ws.split();
    barrier.wait().await;

    // Presence broadcasts still arrive here; keep the socket drained.
    let drain = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    let payload = codec::encode_json(&ClientEvent::private_message(target, "x".repeat(64)))?;
    let message = Message::Text(payload);

    loop {
        if sender.send(message.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    drain.abort();
    Ok(())
}
