//! Headless client for poking a running server from the command line.
//!
//! Joins, walks in a circle with sequenced inputs and logs the snapshots that
//! come back.

use clap::Parser;
use log::{info, warn};
use shared::{decode_server_message, encode_client_message, ClientMessage, ServerMessage, DEFAULT_PORT};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server address
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    server: SocketAddr,

    /// Display name to join with
    #[arg(short, long, default_value = "TestClient")]
    name: String,

    /// Number of inputs to send before leaving
    #[arg(short, long, default_value = "100")]
    inputs: u32,

    /// Join as admin (only honored from admin hosts)
    #[arg(long)]
    admin: bool,
}

async fn send(
    socket: &UdpSocket,
    server: SocketAddr,
    message: &ClientMessage,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = encode_client_message(message)?;
    socket.send_to(&data, server).await?;
    Ok(())
}

/// Waits up to `wait` for the next decodable message from the server.
async fn recv(socket: &UdpSocket, buf: &mut [u8], wait: Duration) -> Option<ServerMessage> {
    let (len, _) = timeout(wait, socket.recv_from(buf)).await.ok()?.ok()?;
    match decode_server_message(&buf[..len]) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Undecodable message from server: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    info!("Client socket bound to {}", socket.local_addr()?);

    let join = if args.admin {
        ClientMessage::AdminJoin { name: args.name.clone() }
    } else {
        ClientMessage::Join { name: args.name.clone() }
    };
    send(&socket, args.server, &join).await?;

    let mut buf = vec![0u8; 64 * 1024];
    let my_id = loop {
        match recv(&socket, &mut buf, Duration::from_secs(3)).await {
            Some(ServerMessage::JoinAck { id }) => break id,
            Some(other) => info!("Ignoring {:?} while joining", other),
            None => return Err("no join_ack from server".into()),
        }
    };
    info!("Joined {} as entity {}", args.server, my_id);

    let mut ticker = interval(Duration::from_millis(50));
    for seq in 1..=args.inputs {
        ticker.tick().await;
        let angle = seq as f32 * 0.1;
        let input = ClientMessage::Input {
            seq,
            x: angle.cos(),
            y: angle.sin(),
            speed: 5.0,
            time: seq as f64 * 0.05,
        };
        send(&socket, args.server, &input).await?;

        while let Some(message) = recv(&socket, &mut buf, Duration::from_millis(1)).await {
            match message {
                ServerMessage::State { players, metrics } => {
                    if let Some(me) = players.iter().find(|p| p.id == my_id) {
                        info!(
                            "seq {}: at ({:.2}, {:.2}, {:.2}), {} entities, {} players",
                            seq, me.x, me.y, me.z, metrics.total_entities, metrics.real_players
                        );
                    }
                }
                ServerMessage::Kicked { reason } => {
                    warn!("Kicked by server: {}", reason);
                    return Ok(());
                }
                ServerMessage::JoinAck { id } => info!("Unexpected join_ack {}", id),
            }
        }
    }

    send(&socket, args.server, &ClientMessage::Leave).await?;
    info!("Left after {} inputs", args.inputs);
    Ok(())
}
