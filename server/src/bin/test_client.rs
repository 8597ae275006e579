//! Minimal WebSocket client for a running server.
//!
//! Usage: `test_client [URL] [FRAMES]`

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use protocol::transform::{FrameTransform, Identity};
use protocol::{decode, encode, ClientInputMessage, Message};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Parser, Debug)]
#[command(author, version, about = "Connects to the server and reports streamed frames")]
struct Args {
    /// WebSocket URL of the server
    #[arg(default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// Number of frames to receive before disconnecting
    #[arg(default_value_t = 10)]
    frames: usize,
}

// Current timestamp in milliseconds, truncated to the wire's u32
fn get_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u32
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    // Full-size frames exceed tungstenite's default frame limit
    let config = WebSocketConfig {
        max_message_size: None,
        max_frame_size: None,
        ..WebSocketConfig::default()
    };
    let (ws, _) = tokio_tungstenite::connect_async_with_config(args.url.as_str(), Some(config), true).await?;
    println!("Connected to {}", args.url);
    let (mut sink, mut stream) = ws.split();
    let transform = Identity;

    let mut received = 0;
    let mut sent_input = false;
    let mut last_frame: Option<Instant> = None;

    while received < args.frames {
        let Some(frame) = stream.next().await else {
            println!("Server closed the connection");
            break;
        };
        let data = match frame? {
            WsMessage::Binary(data) => data,
            WsMessage::Close(reason) => {
                println!("Server closed the connection: {:?}", reason);
                break;
            }
            _ => continue,
        };

        match decode(&data) {
            Ok(Message::ServerState(state)) => {
                println!(
                    "Session {}: {}x{}x{} grid, t = {:.3}s",
                    state.session_id, state.width, state.height, state.depth, state.time
                );
                if !sent_input {
                    let input = Message::ClientInput(ClientInputMessage {
                        x: 0.5,
                        y: 0.5,
                        z: 0.5,
                        value: 1.0,
                        timestamp: get_timestamp(),
                    });
                    sink.send(WsMessage::Binary(encode(&input)?)).await?;
                    sent_input = true;
                    println!("Sent source at grid centre");
                }
            }
            Ok(Message::ServerFrame(frame)) => {
                let now = Instant::now();
                let interval = last_frame.map(|last| now - last);
                last_frame = Some(now);
                received += 1;

                let payload = transform.inverse(frame.payload);
                match interval {
                    Some(interval) => println!(
                        "Frame {}: {} bytes, t = {:.3}s, +{:.1}ms",
                        received,
                        payload.len(),
                        frame.sim_time,
                        interval.as_secs_f64() * 1000.0
                    ),
                    None => println!(
                        "Frame {}: {} bytes, t = {:.3}s",
                        received,
                        payload.len(),
                        frame.sim_time
                    ),
                }
            }
            Ok(Message::ServerError(error)) => {
                println!("Server error: {}", error.message);
                break;
            }
            Ok(other) => println!("Unexpected {:?} from server", other.message_type()),
            Err(e) => println!("Failed to decode server message: {}", e),
        }
    }

    sink.close().await?;
    println!("Received {} frames", received);
    Ok(())
}
