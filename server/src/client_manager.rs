//! Client connection management and input scheduling for the reference server
//!
//! This module handles the server-side view of every connected client:
//! - Connection lifecycle (enter game, disconnect, timeout)
//! - Snapshot acknowledgement and the delta base it implies
//! - Inputs scheduled by the tick the client predicted them for
//! - Latency measured from acknowledged snapshots
//!
//! Client ids are slot numbers, so they double as character ids in the
//! world and item ids in snapshots.

use crate::snapshots::SentSnapshots;
use log::{debug, info};
use shared::{PlayerInput, MAX_CLIENTS};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Silence after which a client is dropped
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);
/// Scheduled inputs kept per client
const MAX_PENDING_INPUTS: usize = 200;

/// Represents a connected client and its synchronisation state
#[derive(Debug)]
pub struct Client {
    /// Slot number, also the character id
    pub id: usize,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Newest snapshot tick the client confirmed, -1 when it needs a keyframe
    pub ack_tick: i32,
    /// Snapshots the client may still use as delta base
    pub sent: SentSnapshots,
    /// Round trip measured through the last acknowledgement
    pub latency_ms: i32,
    /// Input applied on the most recent tick, held until a newer one arrives
    pub latest_input: PlayerInput,
    pending_inputs: BTreeMap<i32, PlayerInput>,
}

impl Client {
    pub fn new(id: usize, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            ack_tick: -1,
            sent: SentSnapshots::new(),
            latency_ms: 0,
            latest_input: PlayerInput::default(),
            pending_inputs: BTreeMap::new(),
        }
    }

    /// Applies the acknowledgement carried by an input message
    ///
    /// A negative tick asks for a keyframe. Older acknowledgements than the
    /// current one arrive out of order and are ignored.
    pub fn acknowledge(&mut self, ack_tick: i32, now: Instant) {
        if ack_tick < 0 {
            if self.ack_tick >= 0 {
                debug!("Client {} requested a full snapshot", self.id);
            }
            self.ack_tick = -1;
            self.sent.clear();
            return;
        }
        if ack_tick <= self.ack_tick {
            return;
        }

        if let Some(sent_at) = self.sent.sent_at(ack_tick) {
            self.latency_ms = now.saturating_duration_since(sent_at).as_millis() as i32;
        }
        self.ack_tick = ack_tick;
        self.sent.purge_before(ack_tick);
    }

    /// Schedules `input` for `predicted_tick`, or for the next simulated tick
    /// when it arrived too late. Returns the tick it will be applied on.
    pub fn add_input(&mut self, predicted_tick: i32, input: PlayerInput, current_tick: i32) -> i32 {
        self.last_seen = Instant::now();

        let tick = predicted_tick.max(current_tick + 1);
        self.pending_inputs.insert(tick, input);
        while self.pending_inputs.len() > MAX_PENDING_INPUTS {
            self.pending_inputs.pop_first();
        }
        tick
    }

    /// Input for simulating `tick`: the newest one scheduled at or before
    /// it, else the previous tick's input
    pub fn take_input(&mut self, tick: i32) -> PlayerInput {
        let later = self.pending_inputs.split_off(&(tick + 1));
        let due = std::mem::replace(&mut self.pending_inputs, later);
        if let Some((_, input)) = due.into_iter().next_back() {
            self.latest_input = input;
        }
        self.latest_input
    }

    pub fn pending_inputs(&self) -> usize {
        self.pending_inputs.len()
    }

    /// Checks if the client has exceeded the connection timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected clients
pub struct ClientManager {
    /// Connected clients indexed by slot
    clients: HashMap<usize, Client>,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager; capacity never exceeds the world's slots
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients: max_clients.min(MAX_CLIENTS),
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns the lowest free slot, or None if the server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<usize> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = (0..self.max_clients).find(|id| !self.clients.contains_key(id))?;
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));

        Some(client_id)
    }

    /// Removes a client from the server
    pub fn remove_client(&mut self, client_id: &usize) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    /// Finds a client ID by their network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, client_id: usize) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: usize) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// Marks the client as alive
    pub fn touch(&mut self, client_id: usize) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_seen = Instant::now();
        }
    }

    /// Checks for and removes timed-out clients, returning their ids
    pub fn check_timeouts(&mut self) -> Vec<usize> {
        let timed_out: Vec<usize> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(CLIENT_TIMEOUT))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    /// Ids of connected clients, ascending
    pub fn ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Latency per connected client, as published in player infos
    pub fn latencies(&self) -> Vec<(usize, i32)> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.clients.get(&id).map(|client| (id, client.latency_ms)))
            .collect()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
