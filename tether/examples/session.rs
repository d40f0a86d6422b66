//! Example signaling session with heartbeats and automatic reconnects.
//!
//! Run with: `cargo run --example session`
//!
//! Make sure the server is running first: `cargo run --example echo_server`

use std::net::SocketAddr;
use std::time::Duration;
use tether::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = "127.0.0.1:9100".parse()?;

    println!("Connecting to tether echo server at {}", addr);

    let config = SessionConfig::default()
        .ping_interval_ms(1_000)
        .missed_pongs_threshold(3)
        .reconnect_timeout_ms(30_000);
    let (session, mut events) =
        SessionBuilder::tcp(TcpChannelConfig::new(addr).connect_timeout(Duration::from_secs(5)))
            .config(config)
            .build()?;

    session.start();

    let mut sent = 0u32;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Connecting { reconnecting }) => {
                    println!("[Client] Connecting (reconnecting: {})", reconnecting);
                }
                Some(SessionEvent::Connected) => println!("[Client] Connected to server"),
                Some(SessionEvent::Message(payload)) => match std::str::from_utf8(&payload) {
                    Ok(text) => println!("[Client] Received response: {}", text),
                    Err(_) => println!("[Client] Received response: {} bytes", payload.len()),
                },
                Some(SessionEvent::PongReceived { ping_id, clock_skew_ms, round_trip_ms }) => {
                    println!(
                        "[Client] Pong {}: rtt={}ms skew={}ms",
                        ping_id, round_trip_ms, clock_skew_ms
                    );
                }
                Some(SessionEvent::PongsMissed(count)) => {
                    eprintln!("[Client] Missed {} pong(s)", count);
                }
                Some(SessionEvent::Disconnected { code, reason }) => {
                    println!("[Client] Disconnected: {} {}", code, reason);
                    break;
                }
                None => break,
            },

            _ = ticker.tick() => {
                if session.current_state() != ConnectionState::Connected {
                    continue;
                }
                sent += 1;
                let payload = format!("Hello from tether session! Message #{}", sent);
                match session.send(payload.into_bytes()) {
                    Ok(()) => println!("[Client] Sent message #{}", sent),
                    Err(e) => eprintln!("[Client] Failed to send message #{}: {}", sent, e),
                }
                if sent == 10 {
                    println!("\nDisconnecting...");
                    session.stop();
                }
            }

            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                session.stop();
            }
        }
    }

    println!("Session stopped");
    Ok(())
}
