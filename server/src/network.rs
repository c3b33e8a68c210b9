//! Server network layer handling UDP communications and game loop coordination

use crate::client_manager::ClientManager;
use crate::game::GameState;
use crate::snapshots::snapshot_messages;
use log::{debug, error, info, warn};
use shared::transport::Envelope;
use shared::{PlayerInput, SendFlags, SystemMessage, SERVER_TICK_SPEED};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval_at;

/// Wall time of one simulation tick
pub const TICK_DURATION: Duration = Duration::from_millis(1000 / SERVER_TICK_SPEED as u64);

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        message: SystemMessage,
        addr: SocketAddr,
    },
    ClientTimeout {
        client_id: usize,
    },
}

/// Messages sent from game loop to network tasks
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        message: SystemMessage,
        flags: SendFlags,
        addr: SocketAddr,
    },
}

/// Reference server: simulates the world at the shared tick rate and
/// streams per-client delta snapshots
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    game_state: GameState,
    /// Wall time of tick zero
    start: Instant,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(addr: &str, max_clients: usize) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(max_clients))),
            game_state: GameState::new(),
            start: Instant::now(),
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wall time at which `tick` is simulated
    fn tick_start(&self, tick: i32) -> Instant {
        self.start + TICK_DURATION * tick.max(0) as u32
    }

    /// Milliseconds until `tick` is simulated, negative when it already was
    fn time_left_ms(&self, tick: i32, now: Instant) -> i32 {
        let target = self.tick_start(tick);
        if target >= now {
            target.duration_since(now).as_millis() as i32
        } else {
            -(now.duration_since(target).as_millis() as i32)
        }
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let message = Envelope::decode(&buffer[..len])
                            .map_err(|e| e.to_string())
                            .and_then(|envelope| {
                                SystemMessage::unpack(&envelope.payload).map_err(|e| e.to_string())
                            });
                        match message {
                            Ok(message) => {
                                if let Err(e) =
                                    server_tx.send(ServerMessage::PacketReceived { message, addr })
                                {
                                    error!("Failed to send packet to main loop: {}", e);
                                    break;
                                }
                            }
                            Err(e) => warn!("Failed to decode packet from {}: {}", addr, e),
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(GameMessage::SendPacket {
                message,
                flags,
                addr,
            }) = game_rx.recv().await
            {
                if let Err(e) = Self::send_packet_impl(&socket, &message, flags, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        break;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        message: &SystemMessage,
        flags: SendFlags,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = Envelope::new(flags, message.pack()).encode()?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, message: SystemMessage, flags: SendFlags, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket {
            message,
            flags,
            addr,
        }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Processes incoming packets and updates client state
    async fn handle_packet(&mut self, message: SystemMessage, addr: SocketAddr) {
        let client_id = {
            let clients = self.clients.read().await;
            clients.find_client_by_addr(addr)
        };

        match (message, client_id) {
            (SystemMessage::EnterGame, existing) => {
                info!("Client entering game from {}", addr);

                let mut clients = self.clients.write().await;
                if let Some(existing_id) = existing {
                    info!("Removing existing client {} from {}", existing_id, addr);
                    clients.remove_client(&existing_id);
                    self.game_state.remove_player(&existing_id);
                }

                match clients.add_client(addr) {
                    Some(client_id) => self.game_state.add_player(client_id),
                    None => warn!("Server full, ignoring {}", addr),
                }
            }

            (
                SystemMessage::Input {
                    ack_tick,
                    predicted_tick,
                    input,
                },
                Some(client_id),
            ) => {
                let now = Instant::now();
                let current_tick = self.game_state.tick();
                {
                    let mut clients = self.clients.write().await;
                    let Some(client) = clients.get_mut(client_id) else {
                        return;
                    };
                    client.acknowledge(ack_tick, now);
                    client.add_input(predicted_tick, input, current_tick);
                }

                let time_left_ms = self.time_left_ms(predicted_tick, now);
                self.send_packet(
                    SystemMessage::InputTiming {
                        intended_tick: predicted_tick,
                        time_left_ms,
                    },
                    SendFlags::NONE,
                    addr,
                );
            }

            (SystemMessage::Ping, Some(client_id)) => {
                self.clients.write().await.touch(client_id);
                self.send_packet(SystemMessage::PingReply, SendFlags::FLUSH, addr);
            }

            (_, None) => {
                debug!("Ignoring packet from unknown address {}", addr);
            }

            (message, Some(client_id)) => {
                warn!(
                    "Unexpected message {} from client {}",
                    message.id(),
                    client_id
                );
            }
        }
    }

    /// Simulates the next tick with every client's scheduled input
    async fn advance(&mut self) {
        let mut clients = self.clients.write().await;
        self.game_state.step(|id, tick| {
            clients
                .get_mut(id)
                .map_or_else(PlayerInput::default, |client| client.take_input(tick))
        });
    }

    /// Sends every client the current tick, delta-encoded against its ack
    async fn broadcast_snapshots(&mut self) {
        let now = Instant::now();
        let tick = self.game_state.tick();
        let mut outgoing = Vec::new();

        {
            let mut clients = self.clients.write().await;
            let latencies = clients.latencies();

            for client_id in clients.ids() {
                let snapshot = match self.game_state.snapshot_for(client_id, &latencies) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        error!("Failed to build snapshot for client {}: {}", client_id, e);
                        continue;
                    }
                };
                let Some(client) = clients.get_mut(client_id) else {
                    continue;
                };

                let ack_tick = client.ack_tick;
                let base = client.sent.get(ack_tick).map(|base| (ack_tick, base));
                if ack_tick >= 0 && base.is_none() {
                    debug!(
                        "Client {} acked unknown tick {}, sending keyframe",
                        client_id, ack_tick
                    );
                }

                let messages = snapshot_messages(tick, &snapshot, base);
                client.sent.add(tick, snapshot, now);
                outgoing.extend(messages.into_iter().map(|message| (message, client.addr)));
            }
        }

        for (message, addr) in outgoing {
            self.send_packet(message, SendFlags::NONE, addr);
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let first_tick = tokio::time::Instant::from_std(self.tick_start(self.game_state.tick() + 1));
        let mut tick_interval = interval_at(first_tick, TICK_DURATION);

        info!("Server started successfully");

        loop {
            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { message, addr }) => {
                            self.handle_packet(message, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            self.game_state.remove_player(&client_id);
                        },
                        None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                // Handle server tick events
                _ = tick_interval.tick() => {
                    self.advance().await;
                    self.broadcast_snapshots().await;

                    // Periodic monitoring
                    if self.game_state.tick() % (SERVER_TICK_SPEED * 5) == 0 {
                        let client_count = self.clients.read().await.len();
                        if client_count > 0 {
                            debug!("Tick {}: {} clients", self.game_state.tick(), client_count);
                        }
                    }
                },
            }
        }

        Ok(())
    }
}
