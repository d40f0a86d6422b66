//! Example signaling server answering heartbeats and echoing data frames.
//!
//! Run with: `cargo run --example echo_server`
//!
//! Set `DROP_EVERY=<n>` to drop every n-th connection right after it is
//! accepted, which exercises the client's reconnect path.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tether::prelude::*;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

async fn handle_connection(session_id: u64, stream: TcpStream) {
    let clock = SystemClock;
    let mut framed = Framed::new(stream, ControlFrameCodec::new(64 * 1024));
    println!("[Server] Session {} connected", session_id);

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                eprintln!("[Server] Session {} read error: {}", session_id, e);
                break;
            }
        };

        let reply = match frame.body {
            SignalBody::PingPong(ping) if ping.kind == PingPongKind::Ping => {
                tracing::debug!("session {} ping {}", session_id, ping.ping_id);
                SignalFrame::ping_pong(PingPongFrame::pong(ping.ping_id))
                    .with_timestamp(clock.now_ms())
            }
            SignalBody::PingPong(_) => continue,
            SignalBody::Data(payload) => {
                println!(
                    "[Server] Session {} sent {} bytes",
                    session_id,
                    payload.len()
                );
                SignalFrame::data(payload).with_timestamp(clock.now_ms())
            }
        };

        if let Err(e) = framed.send(reply).await {
            eprintln!("[Server] Session {} write error: {}", session_id, e);
            break;
        }
    }

    println!("[Server] Session {} disconnected", session_id);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = "127.0.0.1:9100".parse()?;
    let drop_every: u64 = std::env::var("DROP_EVERY")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    let listener = TcpListener::bind(addr).await?;
    println!("Starting tether echo server on {}", addr);
    println!("Press Ctrl+C to stop");

    let sessions = Arc::new(AtomicU64::new(0));
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let session_id = sessions.fetch_add(1, Ordering::Relaxed) + 1;
                if drop_every > 0 && session_id % drop_every == 0 {
                    println!("[Server] Dropping session {} from {}", session_id, peer);
                    continue;
                }
                tokio::spawn(handle_connection(session_id, stream));
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    println!("Server stopped");
    Ok(())
}
