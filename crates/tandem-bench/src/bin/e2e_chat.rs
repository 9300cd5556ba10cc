//! End-to-end chat benchmark for Tandem.
//!
//! Connects many clients to a running server, lets them pair up, and has
//! every pair volley messages back and forth over real WebSockets.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_protocol::{codec, ClientFrame, ServerFrame};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_pairs: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Tandem End-to-End Chat Benchmark                  ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_chat_benchmark(num_pairs * 2).await;
}

async fn run_chat_benchmark(num_clients: usize) {
    println!("📊 Chat Benchmark: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let connect_start = Instant::now();
    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    // Wait for every client to be paired
    barrier.wait().await;
    println!(
        "✓ All {} clients paired in {:.2}ms",
        num_clients,
        connect_start.elapsed().as_secs_f64() * 1000.0
    );

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);
    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Pairs:                {:>10}                           ║",
        num_clients / 2
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Relayed Messages:     {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    let join = codec::encode_json(&ClientFrame::join(Some(format!("bench-{}", client_id))))?;
    sender.send(Message::Text(join)).await?;

    // Wait until paired
    loop {
        match next_frame(&mut receiver).await? {
            Some(ServerFrame::Paired { .. }) => break,
            Some(_) => continue,
            None => return Err("connection closed before pairing".into()),
        }
    }

    barrier.wait().await;

    let message = Message::Text(codec::encode_json(&ClientFrame::send("volley"))?);

    // Each side serves once, then answers every message it gets
    sender.send(message.clone()).await?;
    while let Some(frame) = next_frame(&mut receiver).await? {
        match frame {
            ServerFrame::Message { .. } => {
                message_count.fetch_add(1, Ordering::Relaxed);
                sender.send(message.clone()).await?;
            }
            ServerFrame::PartnerLeft { .. } => break,
            _ => {}
        }
    }

    Ok(())
}

async fn next_frame<S>(receiver: &mut S) -> Result<Option<ServerFrame>, BoxError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = receiver.next().await {
        if let Message::Text(text) = msg? {
            return Ok(Some(codec::decode_json(&text)?));
        }
    }
    Ok(None)
}
