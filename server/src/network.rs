//! Server network layer: UDP receive workers and the periodic tasks that drive
//! the simulation.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::game::Game;
use crate::transport::UdpTransport;
use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Largest datagram a receive worker accepts.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Bot loop statistics are logged every this many ticks.
const BOT_STATS_EVERY: u64 = 50;

/// Bound UDP socket plus the game it feeds
pub struct Server {
    socket: Arc<UdpSocket>,
    game: Arc<Game>,
}

impl Server {
    /// Binds the socket and builds the game. Must run inside a tokio runtime
    /// because the outbound sender task is spawned here.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let socket = Arc::new(socket);
        info!("Server listening on {}", socket.local_addr()?);

        let transport = Arc::new(UdpTransport::spawn(Arc::clone(&socket)));
        let game = Arc::new(Game::new(config, transport));
        Ok(Server { socket, game })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn game(&self) -> Arc<Game> {
        Arc::clone(&self.game)
    }

    /// Spawns the workers that read datagrams and hand them to the game.
    ///
    /// Workers share one socket, so a slow message never stalls the others.
    pub fn spawn_network_receivers(&self) -> Vec<JoinHandle<()>> {
        let workers = self.game.config().receiver_workers.max(1);
        (0..workers)
            .map(|worker| {
                let socket = Arc::clone(&self.socket);
                let game = Arc::clone(&self.game);
                tokio::spawn(async move {
                    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
                    loop {
                        match socket.recv_from(&mut buffer).await {
                            Ok((len, addr)) => game.handle_datagram(addr, &buffer[..len]).await,
                            Err(e) => {
                                error!("Receiver {} failed to read datagram: {}", worker, e);
                                tokio::time::sleep(Duration::from_millis(10)).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Spawns the fixed-rate bot update loop.
    pub fn spawn_bot_loop(&self) -> JoinHandle<()> {
        let game = Arc::clone(&self.game);
        tokio::spawn(async move {
            let mut ticker = interval(game.config().bot_tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut rng = StdRng::from_entropy();
            let mut ticks: u64 = 0;

            loop {
                ticker.tick().await;
                let started = Instant::now();
                let report = game.tick_bots(&mut rng, started);
                ticks += 1;

                if ticks % BOT_STATS_EVERY == 0 && report.processed > 0 {
                    debug!(
                        "Bot tick {}: {} processed, {} moved, {} deferred in {:?}",
                        ticks,
                        report.processed,
                        report.moved,
                        report.deferred,
                        started.elapsed()
                    );
                }
            }
        })
    }

    /// Spawns the task that drops silent sessions.
    pub fn spawn_timeout_checker(&self) -> JoinHandle<()> {
        let game = Arc::clone(&self.game);
        tokio::spawn(async move {
            let mut ticker = interval(game.config().timeout_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let expired = game.expire_sessions(Instant::now());
                if expired > 0 {
                    info!("Expired {} idle sessions", expired);
                }
            }
        })
    }

    /// Starts every task and runs until Ctrl+C or a task dies.
    pub async fn run(self) -> Result<(), ServerError> {
        let receivers = self.spawn_network_receivers();
        let bot_loop = self.spawn_bot_loop();
        let timeout_checker = self.spawn_timeout_checker();

        info!(
            "Server started with {} receive workers on {}",
            receivers.len(),
            self.local_addr()?
        );

        let any_receiver = first_finished(receivers);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            result = bot_loop => {
                if let Err(e) = result {
                    error!("Bot loop task panicked: {}", e);
                }
            }
            result = timeout_checker => {
                if let Err(e) = result {
                    error!("Timeout checker task panicked: {}", e);
                }
            }
            _ = any_receiver => {
                error!("Network receiver stopped");
            }
        }

        Ok(())
    }
}

/// Resolves when the first of `handles` finishes, logging a panic if any.
async fn first_finished(handles: Vec<JoinHandle<()>>) {
    let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<()>(1);
    for handle in handles {
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                error!("Receiver task panicked: {}", e);
            }
            let _ = done_tx.send(()).await;
        });
    }
    drop(done_tx);
    done_rx.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{decode_server_message, encode_client_message, ClientMessage, ServerMessage};

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            receiver_workers: 2,
            ..ServerConfig::default()
        }
    }

    async fn recv_message(socket: &UdpSocket) -> ServerMessage {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("reply in time")
            .unwrap();
        decode_server_message(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let result = Server::new(ServerConfig {
            bind_addr: "not-an-address".to_string(),
            ..ServerConfig::default()
        })
        .await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_join_over_udp() {
        let server = Server::new(local_config()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let game = server.game();
        let _receivers = server.spawn_network_receivers();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let join = encode_client_message(&ClientMessage::Join {
            name: "Alice".into(),
        })
        .unwrap();
        client.send_to(&join, server_addr).await.unwrap();

        match recv_message(&client).await {
            ServerMessage::JoinAck { id } => {
                assert_eq!(game.store().get(id).unwrap().name, "Alice");
            }
            other => panic!("expected join_ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_checker_expires_sessions() {
        let server = Server::new(ServerConfig {
            session_timeout: Duration::from_millis(50),
            timeout_check_interval: Duration::from_millis(20),
            ..local_config()
        })
        .await
        .unwrap();
        let game = server.game();
        game.join(
            "127.0.0.1:40000".parse().unwrap(),
            "Ghost",
            crate::entity::EntityFlags::PLAYER,
            Instant::now(),
        );
        let _checker = server.spawn_timeout_checker();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(game.sessions().is_empty());
        assert!(game.store().is_empty());
    }
}
