//! Integration tests for the snapshot synchronisation pipeline
//!
//! These tests drive the client library and the reference server together,
//! without sockets: the server side runs in-process and talks to the client
//! through a loopback transport and a manual clock.

use client::clock::{millis, Clock, ManualClock, SystemClock};
use client::connection::{Connection, SyncError};
use client::coordinator::{ClientConfig, ClientHooks, ConnectionCoordinator, InputSource};
use client::fragment::{FragmentAssembler, PART_SIZE};
use client::history::SnapshotHistory;
use client::input::{InputHistory, InputSample};
use client::network::UdpTransport;
use client::prediction::{tick_duration, tick_start, PredictionEngine, PredictionInputs};
use client::smooth_time::{AdjustDirection, ClockConfig, ClockSmoother};
use client::PredictionConfig;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use server::client_manager::ClientManager;
use server::game::GameState;
use server::network::Server;
use server::snapshots::snapshot_messages;
use shared::physics::{CollisionMap, WorldCore, ARENA_HEIGHT, ARENA_WIDTH};
use shared::protocol::{self, SnapPart, OBJ_CHARACTER};
use shared::transport::LoopbackTransport;
use shared::{
    varint, ConnectionId, PlayerInput, Snapshot, SnapshotBuilder, SnapshotDelta, SystemMessage,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn arena() -> Arc<CollisionMap> {
    Arc::new(CollisionMap::arena(ARENA_WIDTH, ARENA_HEIGHT))
}

fn connection() -> Connection {
    let mut connection = Connection::new(
        ConnectionId::Primary,
        ClockConfig::default(),
        PredictionConfig::default(),
        arena(),
    );
    connection.connect();
    connection
}

fn keyframe(tick: i32, snapshot: &Snapshot, crc: u32) -> SystemMessage {
    SystemMessage::Snap(SnapPart {
        tick,
        delta_tick: -1,
        num_parts: 1,
        part: 0,
        crc,
        data: SnapshotDelta::encode(&Snapshot::empty(), snapshot).unwrap_or_default(),
    })
}

fn score_snapshot(tick: i32) -> Snapshot {
    let mut builder = SnapshotBuilder::new();
    builder.add_item(1, 0, &[tick, tick * 2]).unwrap();
    builder.finish()
}

/// LITERAL SCENARIOS
mod scenario_tests {
    use super::*;

    /// A single new item decoded against the empty base
    #[test]
    fn single_item_against_empty_base() {
        let stream = varint::compress(&[0, 1, 0, 7, 3, 1, 42]);
        let mut delta = SnapshotDelta::new();

        let snapshot = delta.decode(&Snapshot::empty(), &stream).unwrap();

        assert_eq!(snapshot.len(), 1);
        let item = &snapshot.items()[0];
        assert_eq!((item.key.type_id, item.key.id), (7, 3));
        assert_eq!(item.data, vec![42]);
        assert_eq!(snapshot.crc(), 458_797);
        assert_eq!(delta.data_updates(7), 1);
    }

    /// Two parts of 900 and 400 bytes arriving in reverse order
    #[test]
    fn reversed_fragments_complete_once() {
        let first: Vec<u8> = (0..900).map(|i| (i % 251) as u8).collect();
        let second: Vec<u8> = (0..400).map(|i| (i % 13) as u8 + 100).collect();
        assert!(first.len() <= PART_SIZE);

        let mut assembler = FragmentAssembler::new();
        assert_eq!(assembler.accept(50, 1, 2, &second).unwrap(), None);

        let complete = assembler.accept(50, 0, 2, &first).unwrap().unwrap();
        assert_eq!(complete.tick, 50);
        assert_eq!(complete.data.len(), 1300);
        assert_eq!(&complete.data[..900], &first[..]);
        assert_eq!(&complete.data[900..], &second[..]);
    }

    /// Ten checksum failures in a row resync exactly once
    #[test]
    fn ten_crc_failures_resync_once() {
        let mut connection = connection();

        for tick in 10..20 {
            let snapshot = score_snapshot(tick);
            let result = connection.handle(millis(tick as i64), &keyframe(tick, &snapshot, snapshot.crc() ^ 1));
            assert!(matches!(result, Err(SyncError::CrcMismatch { .. })));

            if tick < 19 {
                assert_eq!(connection.resyncs(), 0);
                assert_eq!(connection.crc_errors(), tick - 9);
            }
        }

        assert_eq!(connection.resyncs(), 1);
        assert_eq!(connection.crc_errors(), 0);
        assert_eq!(connection.ack_tick(), -1);
        assert!(connection.force_input());
    }

    /// Priming to predicting on ticks 100 and 101
    #[test]
    fn prediction_starts_from_first_tick() {
        for elapsed_ms in [0, 5, 16, 19, 25] {
            let mut connection = connection();
            let first = score_snapshot(100);
            let second = score_snapshot(101);
            connection.handle(0, &keyframe(100, &first, first.crc())).unwrap();
            connection.handle(0, &keyframe(101, &second, second.crc())).unwrap();

            let prediction = connection.prediction();
            assert_eq!(
                prediction.predicted_time(0) - prediction.margin(0),
                100 * tick_duration()
            );

            connection.update(millis(elapsed_ms));
            let pred_tick = connection.prediction().pred_tick();
            assert!(pred_tick >= 100);
            assert!(
                (101..=102).contains(&pred_tick),
                "predicted tick {} after {}ms",
                pred_tick,
                elapsed_ms
            );
        }
    }

    /// A delta against a tick the history never held
    #[test]
    fn missing_base_requests_keyframe() {
        let mut history = SnapshotHistory::new();
        for tick in [70, 75, 80] {
            history.add(tick, 0, score_snapshot(tick));
        }
        assert!(history.get(77).is_none());

        let mut connection = connection();
        for tick in [70, 75, 80] {
            let snapshot = score_snapshot(tick);
            connection
                .handle(millis(tick as i64), &keyframe(tick, &snapshot, snapshot.crc()))
                .unwrap();
        }
        assert_eq!(connection.ack_tick(), 80);

        let target = score_snapshot(81);
        let message = SystemMessage::Snap(SnapPart {
            tick: 81,
            delta_tick: 77,
            num_parts: 1,
            part: 0,
            crc: target.crc(),
            data: SnapshotDelta::encode(&score_snapshot(77), &target).unwrap(),
        });

        let result = connection.handle(millis(81), &message);
        assert!(matches!(result, Err(SyncError::MissingBase(77))));
        assert_eq!(connection.ack_tick(), -1);
        assert!(connection.force_input());
    }
}

/// PROPERTY TESTS
mod property_tests {
    use super::*;

    fn random_items(rng: &mut StdRng) -> BTreeMap<(u16, u16), Vec<i32>> {
        let count = rng.gen_range(0..40);
        (0..count)
            .map(|_| {
                let key = (rng.gen_range(1..6), rng.gen_range(0..30));
                let size = rng.gen_range(1..8);
                let data = (0..size).map(|_| rng.gen_range(-5000..5000)).collect();
                (key, data)
            })
            .collect()
    }

    fn build(items: &BTreeMap<(u16, u16), Vec<i32>>) -> Snapshot {
        let mut builder = SnapshotBuilder::new();
        for (&(type_id, id), data) in items {
            builder.add_item(type_id, id, data).unwrap();
        }
        builder.finish()
    }

    /// Removes, edits, resizes and adds items
    fn mutate(rng: &mut StdRng, items: &BTreeMap<(u16, u16), Vec<i32>>) -> BTreeMap<(u16, u16), Vec<i32>> {
        let mut next = BTreeMap::new();
        for (key, data) in items {
            match rng.gen_range(0..4) {
                0 => {}
                1 => {
                    let mut data = data.clone();
                    let index = rng.gen_range(0..data.len());
                    data[index] = data[index].wrapping_add(rng.gen_range(-100..100));
                    next.insert(*key, data);
                }
                2 => {
                    let size = rng.gen_range(1..8);
                    next.insert(*key, (0..size).map(|_| rng.gen()).collect());
                }
                _ => {
                    next.insert(*key, data.clone());
                }
            }
        }
        next.extend(random_items(rng));
        next
    }

    #[test]
    fn delta_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let base_items = random_items(&mut rng);
            let target_items = mutate(&mut rng, &base_items);
            let base = build(&base_items);
            let target = build(&target_items);

            let decoded = match SnapshotDelta::encode(&base, &target) {
                Some(bytes) => SnapshotDelta::new().decode(&base, &bytes).unwrap(),
                None => base.clone(),
            };

            assert_eq!(decoded, target);
            assert_eq!(decoded.crc(), target.crc());
        }
    }

    #[test]
    fn purge_is_idempotent() {
        let mut history = SnapshotHistory::new();
        for tick in 1..=10 {
            history.add(tick, millis(tick as i64), score_snapshot(tick));
        }

        assert_eq!(history.purge_until(5), 4);
        let after_once = history.ticks();
        assert_eq!(history.purge_until(5), 0);

        assert_eq!(history.ticks(), after_once);
        assert_eq!(after_once, (5..=10).collect::<Vec<_>>());
    }

    #[test]
    fn fragment_order_does_not_matter() {
        let mut rng = StdRng::seed_from_u64(11);

        for round in 0..50 {
            let num_parts = rng.gen_range(2..=8);
            let parts: Vec<Vec<u8>> = (0..num_parts)
                .map(|_| {
                    let len = rng.gen_range(1..=PART_SIZE);
                    (0..len).map(|_| rng.gen()).collect()
                })
                .collect();
            let expected: Vec<u8> = parts.concat();

            let mut order: Vec<usize> = (0..num_parts).collect();
            order.shuffle(&mut rng);

            let tick = 100 + round;
            let mut assembler = FragmentAssembler::new();
            for (delivered, &part) in order.iter().enumerate() {
                let result = assembler
                    .accept(tick, part as i32, num_parts as i32, &parts[part])
                    .unwrap();
                if delivered + 1 < num_parts {
                    assert!(result.is_none());
                } else {
                    let complete = result.unwrap();
                    assert_eq!(complete.tick, tick);
                    assert_eq!(complete.data, expected);
                }
            }
        }
    }

    #[test]
    fn clock_converges_without_overshoot() {
        let mut clock = ClockSmoother::new(ClockConfig::default());
        clock.init(0, 0);

        let lead = millis(100);
        let mut previous_offset = 0;
        for step in 1..=60 {
            let now = millis(50) * step;
            let offset = clock.get(now) - now;
            assert!(offset >= previous_offset);
            assert!(offset <= lead);
            previous_offset = offset;

            assert!(clock.retarget(now, now + lead, 0, AdjustDirection::Up));
        }

        assert!(lead - previous_offset < millis(1));
    }

    #[test]
    fn single_spike_is_ignored() {
        let mut clock = ClockSmoother::new(ClockConfig::default());
        clock.init(0, 0);
        for step in 1..=5 {
            clock.retarget(millis(20) * step, millis(20) * step, 0, AdjustDirection::Down);
        }

        let now = millis(120);
        let before = clock.clone();
        assert!(!clock.retarget(now, now + millis(300), -200, AdjustDirection::Up));

        let later = now + millis(100);
        assert_eq!(clock.get(later), before.get(later));
    }

    #[test]
    fn repeated_spikes_move_the_clock() {
        let mut clock = ClockSmoother::new(ClockConfig::default());
        clock.init(0, 0);
        let before = clock.clone();

        let now = millis(20);
        let accepted = (0..5)
            .filter(|_| clock.retarget(now, now + millis(300), -200, AdjustDirection::Up))
            .count();
        assert!(accepted > 0);

        let later = now + millis(100);
        assert!(clock.get(later) > before.get(later));
    }

    fn sample(tick: i32, direction: i32) -> InputSample {
        InputSample {
            tick,
            input: PlayerInput {
                direction,
                jump: i32::from(tick % 7 == 0),
                ..PlayerInput::default()
            },
            sent_at: 0,
            predicted_time: 0,
            margin: 0,
        }
    }

    /// Engine predicting `ticks` ahead of `confirmed_tick`
    fn predicting_engine(confirmed_tick: i32, ticks: i32) -> PredictionEngine {
        let mut engine = PredictionEngine::new(PredictionConfig::default(), arena());
        engine.start();
        engine.on_snapshot_stored(0, 2, confirmed_tick);
        engine.advance(tick_duration() * i64::from(ticks - 1), confirmed_tick);
        assert_eq!(engine.pred_tick(), confirmed_tick + ticks);
        engine
    }

    #[test]
    fn prediction_is_deterministic() {
        let mut game = GameState::new();
        game.add_player(0);
        game.add_player(1);
        for _ in 0..10 {
            game.step(|id, _| PlayerInput {
                direction: if id == 0 { 1 } else { -1 },
                ..PlayerInput::default()
            });
        }
        let confirmed = game.snapshot_for(0, &[]).unwrap();

        let mut inputs = InputHistory::new();
        for tick in 11..=16 {
            inputs.push(sample(tick, if tick < 14 { 1 } else { -1 }));
        }
        let prediction_inputs = PredictionInputs {
            local_id: Some(0),
            local: &inputs,
            partner: None,
        };

        let mut first = predicting_engine(10, 6);
        let mut second = predicting_engine(10, 6);
        assert!(first.predict(&confirmed, 10, &prediction_inputs));
        assert!(second.predict(&confirmed, 10, &prediction_inputs));

        let (a, b) = (first.current().unwrap(), second.current().unwrap());
        for id in [0, 1] {
            assert_eq!(
                a.character(id).unwrap().to_net(16),
                b.character(id).unwrap().to_net(16)
            );
        }
    }

    #[test]
    fn prediction_reproduces_server() {
        let mut game = GameState::new();
        game.add_player(0);
        for _ in 0..10 {
            game.step(|_, _| PlayerInput::default());
        }
        let confirmed = game.snapshot_for(0, &[]).unwrap();

        let mut inputs = InputHistory::new();
        for tick in 11..=15 {
            inputs.push(sample(tick, 1));
        }
        for _ in 11..=15 {
            let tick = game.tick() + 1;
            let input = inputs.get_for_tick(tick).unwrap().input;
            game.step(|_, _| input);
        }

        let mut engine = predicting_engine(10, 5);
        assert!(engine.predict(
            &confirmed,
            10,
            &PredictionInputs {
                local_id: Some(0),
                local: &inputs,
                partner: None,
            }
        ));

        let predicted = engine.current().unwrap().character(0).unwrap().to_net(15);
        let authoritative = game.world().character(0).unwrap().to_net(15);
        assert_eq!(predicted, authoritative);
    }
}

/// END-TO-END TESTS OVER A LOOPBACK TRANSPORT
mod end_to_end_tests {
    use super::*;

    fn addr_of(conn: ConnectionId) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000 + conn.index() as u16))
    }

    fn conn_of(addr: SocketAddr) -> ConnectionId {
        if addr == addr_of(ConnectionId::Primary) {
            ConnectionId::Primary
        } else {
            ConnectionId::Dummy
        }
    }

    /// The reference server's client bookkeeping, world and snapshot
    /// encoding, driven synchronously
    struct LoopbackServer {
        game: GameState,
        clients: ClientManager,
    }

    impl LoopbackServer {
        fn new() -> Self {
            Self {
                game: GameState::new(),
                clients: ClientManager::new(8),
            }
        }

        fn receive(&mut self, transport: &LoopbackTransport, now: i64) {
            for packet in transport.take_outgoing() {
                let addr = addr_of(packet.conn);
                let Ok(message) = SystemMessage::unpack(&packet.data) else {
                    continue;
                };

                match message {
                    SystemMessage::EnterGame => {
                        if let Some(id) = self.clients.add_client(addr) {
                            self.game.add_player(id);
                        }
                    }
                    SystemMessage::Input {
                        ack_tick,
                        predicted_tick,
                        input,
                    } => {
                        let current_tick = self.game.tick();
                        let Some(id) = self.clients.find_client_by_addr(addr) else {
                            continue;
                        };
                        let client = self.clients.get_mut(id).unwrap();
                        client.acknowledge(ack_tick, Instant::now());
                        client.add_input(predicted_tick, input, current_tick);

                        let time_left_ms = ((tick_start(predicted_tick) - now) / millis(1)) as i32;
                        let timing = SystemMessage::InputTiming {
                            intended_tick: predicted_tick,
                            time_left_ms,
                        };
                        transport.push_incoming(packet.conn, timing.pack());
                    }
                    SystemMessage::Ping => {
                        transport.push_incoming(packet.conn, SystemMessage::PingReply.pack());
                    }
                    _ => {}
                }
            }
        }

        fn tick(&mut self, transport: &LoopbackTransport, now: i64) {
            while tick_start(self.game.tick() + 1) <= now {
                let clients = &mut self.clients;
                self.game.step(|id, tick| {
                    clients
                        .get_mut(id)
                        .map_or_else(PlayerInput::default, |client| client.take_input(tick))
                });

                let tick = self.game.tick();
                let latencies = self.clients.latencies();
                for id in self.clients.ids() {
                    let snapshot = self.game.snapshot_for(id, &latencies).unwrap();
                    let client = self.clients.get_mut(id).unwrap();
                    let ack_tick = client.ack_tick;
                    let base = client.sent.get(ack_tick).map(|base| (ack_tick, base));
                    let messages = snapshot_messages(tick, &snapshot, base);
                    client.sent.add(tick, snapshot, Instant::now());

                    for message in messages {
                        transport.push_incoming(conn_of(client.addr), message.pack());
                    }
                }
            }
        }
    }

    struct HoldRight;

    impl InputSource for HoldRight {
        fn sample(&mut self, _conn: ConnectionId, input: &mut PlayerInput) {
            input.direction = 1;
        }
    }

    #[derive(Default)]
    pub(super) struct CountingHooks {
        pub(super) snapshots: usize,
        pub(super) predictions: usize,
    }

    impl ClientHooks for CountingHooks {
        fn on_new_snapshot(&mut self, _conn: ConnectionId, _tick: i32, _snapshot: &Snapshot) {
            self.snapshots += 1;
        }

        fn on_predicted_tick(
            &mut self,
            _conn: ConnectionId,
            _tick: i32,
            previous: Option<&WorldCore>,
            current: Option<&WorldCore>,
        ) {
            if previous.is_some() && current.is_some() {
                self.predictions += 1;
            }
        }
    }

    fn run(
        client: &mut ConnectionCoordinator<LoopbackTransport, ManualClock>,
        server: &mut LoopbackServer,
        transport: &LoopbackTransport,
        clock: &ManualClock,
        hooks: &mut CountingHooks,
        frames: usize,
    ) {
        for _ in 0..frames {
            clock.advance_ms(10);
            let now = clock.now();
            server.receive(transport, now);
            server.tick(transport, now);
            client.pump_network(hooks).unwrap();
            client.update(&mut HoldRight, hooks).unwrap();
        }
    }

    #[test]
    fn client_follows_server() {
        let transport = LoopbackTransport::new();
        let clock = ManualClock::new(0);
        let mut client = ConnectionCoordinator::new(
            transport.clone(),
            clock.clone(),
            ClientConfig::default(),
            arena(),
        );
        let mut server = LoopbackServer::new();
        let mut hooks = CountingHooks::default();

        client.connect(ConnectionId::Primary).unwrap();
        run(&mut client, &mut server, &transport, &clock, &mut hooks, 300);

        let connection = client.connection(ConnectionId::Primary);
        assert!(connection.received_snapshots() > 100);
        assert_eq!(connection.crc_errors(), 0);
        assert_eq!(connection.resyncs(), 0);
        assert_eq!(connection.local_id(), Some(0));
        assert!(connection.delta_stats().data_updates(OBJ_CHARACTER) > 0);
        assert!(hooks.snapshots > 100);
        assert!(hooks.predictions > 50);

        let prediction = connection.prediction();
        assert!(prediction.is_valid());
        assert!(prediction.pred_tick() > connection.ack_tick());
        assert!(prediction.pred_tick() <= connection.ack_tick() + 10);

        let server_client = server.clients.get(0).unwrap();
        assert!(server_client.ack_tick >= 0);

        let latest = connection.history().get(connection.ack_tick()).unwrap();
        let character = protocol::character(latest, 0).unwrap();
        assert!(character.core.x > 48 + 32);
    }

    #[test]
    fn dummy_runs_its_own_pipeline() {
        let transport = LoopbackTransport::new();
        let clock = ManualClock::new(0);
        let mut client = ConnectionCoordinator::new(
            transport.clone(),
            clock.clone(),
            ClientConfig::default(),
            arena(),
        );
        let mut server = LoopbackServer::new();
        let mut hooks = CountingHooks::default();

        client.connect(ConnectionId::Primary).unwrap();
        client.connect(ConnectionId::Dummy).unwrap();
        run(&mut client, &mut server, &transport, &clock, &mut hooks, 200);

        let primary = client.connection(ConnectionId::Primary);
        let dummy = client.connection(ConnectionId::Dummy);
        assert_eq!(primary.local_id(), Some(0));
        assert_eq!(dummy.local_id(), Some(1));
        assert!(primary.prediction().is_valid());
        assert!(dummy.prediction().is_valid());
        assert_eq!(server.clients.len(), 2);

        let latest = dummy.history().get(dummy.ack_tick()).unwrap();
        assert_eq!(protocol::characters(latest).len(), 2);
    }

    #[test]
    fn ping_round_trip() {
        let transport = LoopbackTransport::new();
        let clock = ManualClock::new(0);
        let mut client = ConnectionCoordinator::new(
            transport.clone(),
            clock.clone(),
            ClientConfig::default(),
            arena(),
        );
        let mut server = LoopbackServer::new();
        let mut hooks = CountingHooks::default();

        client.connect(ConnectionId::Primary).unwrap();
        run(&mut client, &mut server, &transport, &clock, &mut hooks, 5);

        client.send_ping().unwrap();
        run(&mut client, &mut server, &transport, &clock, &mut hooks, 1);

        assert_eq!(client.latency_ms(), Some(10));
    }
}

/// END-TO-END TESTS OVER UDP
mod udp_tests {
    use super::*;

    async fn start_server() -> SocketAddr {
        let mut server = tokio_test::assert_ok!(Server::new("127.0.0.1:0", 8).await);
        let addr = tokio_test::assert_ok!(server.local_addr());
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        addr
    }

    struct Idle;

    impl InputSource for Idle {
        fn sample(&mut self, _conn: ConnectionId, _input: &mut PlayerInput) {}
    }

    /// A real client against a real server on localhost
    #[tokio::test]
    async fn test_client_synchronises_over_udp() {
        let addr = start_server().await;
        let transport = UdpTransport::bind(&addr.to_string()).await.unwrap();
        let mut client = ConnectionCoordinator::new(
            transport,
            SystemClock::new(),
            ClientConfig::default(),
            arena(),
        );
        let mut hooks = end_to_end_tests::CountingHooks::default();

        client.connect(ConnectionId::Primary).unwrap();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.pump_network(&mut hooks).unwrap();
            client.update(&mut Idle, &mut hooks).unwrap();
        }

        let connection = client.connection(ConnectionId::Primary);
        assert_eq!(connection.local_id(), Some(0));
        assert!(connection.received_snapshots() > 10);
        assert_eq!(connection.crc_errors(), 0);
        assert!(connection.prediction().is_valid());
        assert!(hooks.snapshots > 10);
    }
}
