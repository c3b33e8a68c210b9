use clap::Parser;
use client::clock::SystemClock;
use client::coordinator::{ClientHooks, InputSource};
use client::network::UdpTransport;
use client::{ClientConfig, ConnectionCoordinator, DummyConfig, PredictionConfig, ResetOnSwitch};
use log::{error, info};
use shared::physics::{CollisionMap, WorldCore, ARENA_HEIGHT, ARENA_WIDTH};
use shared::{ConnectionId, PlayerInput, Snapshot, SERVER_TICK_SPEED};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Also connect a dummy
    #[arg(short = 'd', long)]
    dummy: bool,

    /// Let the dummy hammer the player
    #[arg(long)]
    hammer: bool,

    /// Mirror the player's moves onto the dummy
    #[arg(long)]
    copy_moves: bool,

    /// Swap to the dummy every N seconds, 0 to never swap
    #[arg(long, default_value = "0")]
    swap_every: u64,

    /// Prediction margin in milliseconds
    #[arg(short = 'm', long, default_value = "10")]
    margin: i64,

    /// Stop after this many seconds, 0 to run until Ctrl-C
    #[arg(short = 't', long, default_value = "0")]
    duration: u64,
}

/// Walks back and forth across the arena and jumps at each turn
struct Autopilot {
    samples: u32,
}

impl InputSource for Autopilot {
    fn sample(&mut self, _conn: ConnectionId, input: &mut PlayerInput) {
        self.samples += 1;
        let leg = self.samples / (SERVER_TICK_SPEED as u32 * 2);
        input.direction = if leg % 2 == 0 { 1 } else { -1 };
        input.jump = i32::from(self.samples % (SERVER_TICK_SPEED as u32 * 2) < 5);
        input.target_x = input.direction * 100;
        input.target_y = -20;
    }
}

struct LogHooks;

impl ClientHooks for LogHooks {
    fn on_new_snapshot(&mut self, conn: ConnectionId, tick: i32, snapshot: &Snapshot) {
        if tick % SERVER_TICK_SPEED == 0 {
            info!(
                "[{}] Snapshot {}: {} items, {} bytes",
                conn,
                tick,
                snapshot.len(),
                snapshot.data_size()
            );
        }
    }

    fn on_predicted_tick(
        &mut self,
        conn: ConnectionId,
        tick: i32,
        _previous: Option<&WorldCore>,
        world: Option<&WorldCore>,
    ) {
        if tick % SERVER_TICK_SPEED != 0 {
            return;
        }
        if let Some(world) = world {
            info!(
                "[{}] Predicted tick {} with {} characters",
                conn,
                tick,
                world.active_ids().len()
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let mut transport = UdpTransport::bind(&args.server).await?;
    if args.dummy {
        transport.open(ConnectionId::Dummy).await?;
    }

    let config = ClientConfig {
        prediction: PredictionConfig {
            margin_ms: args.margin,
            ..PredictionConfig::default()
        },
        dummy: DummyConfig {
            hammer: args.hammer,
            copy_moves: args.copy_moves,
            reset_on_switch: ResetOnSwitch::Inactive,
            restore_weapon: true,
        },
        ..ClientConfig::default()
    };
    let map = Arc::new(CollisionMap::arena(ARENA_WIDTH, ARENA_HEIGHT));
    let mut client = ConnectionCoordinator::new(transport, SystemClock::new(), config, map);

    client.connect(ConnectionId::Primary)?;
    if args.dummy {
        client.connect(ConnectionId::Dummy)?;
    }

    let mut autopilot = Autopilot { samples: 0 };
    let mut hooks = LogHooks;
    let mut frame_interval = interval(Duration::from_millis(16));
    let mut ping_interval = interval(Duration::from_secs(1));
    let swap_period = Duration::from_secs(args.swap_every.max(1));
    let mut swap_interval = interval_at(Instant::now() + swap_period, swap_period);
    let deadline = (args.duration > 0)
        .then(|| Instant::now() + Duration::from_secs(args.duration));

    loop {
        tokio::select! {
            _ = frame_interval.tick() => {
                if let Err(e) = client.pump_network(&mut hooks) {
                    error!("Error receiving: {}", e);
                }
                if let Err(e) = client.update(&mut autopilot, &mut hooks) {
                    error!("Error sending input: {}", e);
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    break;
                }
            },

            _ = ping_interval.tick() => {
                if let Err(e) = client.send_ping() {
                    error!("Error sending ping: {}", e);
                }
                if let Some(latency) = client.latency_ms() {
                    info!("Ping: {}ms", latency);
                }
            },

            _ = swap_interval.tick(), if args.dummy && args.swap_every > 0 => {
                if client.toggle_active_dummy() {
                    info!("Steering {}", client.active());
                }
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            },
        }
    }

    client.disconnect(ConnectionId::Primary);
    Ok(())
}
