//! System messages exchanged between client and server, and the game
//! objects carried inside snapshots.
//!
//! Every message starts with a packed header `(id << 1) | 1`; the low bit
//! marks a system message. Fields follow in declaration order, all packed
//! with the varint codec.

use crate::packer::{Packer, Unpacker};
use crate::snapshot::{ItemKey, Snapshot};
use crate::varint::WireError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NETMSG_SNAP: i32 = 5;
pub const NETMSG_SNAP_EMPTY: i32 = 6;
pub const NETMSG_SNAP_SINGLE: i32 = 7;
pub const NETMSG_INPUT_TIMING: i32 = 9;
pub const NETMSG_ENTER_GAME: i32 = 15;
pub const NETMSG_INPUT: i32 = 16;
pub const NETMSG_PING: i32 = 20;
pub const NETMSG_PING_REPLY: i32 = 21;

/// Object type of a character item
pub const OBJ_CHARACTER: u16 = 9;
/// Object type of a player info item
pub const OBJ_PLAYER_INFO: u16 = 10;

/// Largest input payload accepted, in bytes
pub const MAX_INPUT_SIZE: i32 = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("message {0} is not a system message")]
    NotSystem(i32),
    #[error("unknown message id {0}")]
    UnknownMessage(i32),
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: i32 },
}

/// Player controls for one tick, sent with every `INPUT` message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInput {
    pub direction: i32,
    pub target_x: i32,
    pub target_y: i32,
    pub jump: i32,
    /// Press counter; odd while held
    pub fire: i32,
    pub hook: i32,
    pub player_flags: i32,
    /// Weapon slot plus one, zero for no change
    pub wanted_weapon: i32,
    pub next_weapon: i32,
    pub prev_weapon: i32,
}

impl PlayerInput {
    pub const INTS: usize = 10;

    pub fn to_ints(&self) -> [i32; Self::INTS] {
        [
            self.direction,
            self.target_x,
            self.target_y,
            self.jump,
            self.fire,
            self.hook,
            self.player_flags,
            self.wanted_weapon,
            self.next_weapon,
            self.prev_weapon,
        ]
    }

    pub fn from_ints(ints: &[i32]) -> Option<Self> {
        if ints.len() < Self::INTS {
            return None;
        }
        Some(Self {
            direction: ints[0],
            target_x: ints[1],
            target_y: ints[2],
            jump: ints[3],
            fire: ints[4],
            hook: ints[5],
            player_flags: ints[6],
            wanted_weapon: ints[7],
            next_weapon: ints[8],
            prev_weapon: ints[9],
        })
    }

    /// Clears movement while keeping aim and weapon choice
    pub fn reset_movement(&mut self) {
        self.direction = 0;
        self.jump = 0;
        self.hook = 0;
    }
}

/// One part of a (possibly fragmented) snapshot message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapPart {
    pub tick: i32,
    /// Tick of the base snapshot, negative for a keyframe
    pub delta_tick: i32,
    pub num_parts: i32,
    pub part: i32,
    pub crc: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    EnterGame,
    /// `SNAP_FULL` on the wire, or `SNAP_SINGLE` when there is exactly one part
    Snap(SnapPart),
    /// Nothing changed since `delta_tick`
    SnapEmpty { tick: i32, delta_tick: i32 },
    Input {
        ack_tick: i32,
        predicted_tick: i32,
        input: PlayerInput,
    },
    InputTiming { intended_tick: i32, time_left_ms: i32 },
    Ping,
    PingReply,
}

impl SystemMessage {
    pub fn id(&self) -> i32 {
        match self {
            SystemMessage::EnterGame => NETMSG_ENTER_GAME,
            SystemMessage::Snap(part) if part.num_parts == 1 && part.part == 0 => NETMSG_SNAP_SINGLE,
            SystemMessage::Snap(_) => NETMSG_SNAP,
            SystemMessage::SnapEmpty { .. } => NETMSG_SNAP_EMPTY,
            SystemMessage::Input { .. } => NETMSG_INPUT,
            SystemMessage::InputTiming { .. } => NETMSG_INPUT_TIMING,
            SystemMessage::Ping => NETMSG_PING,
            SystemMessage::PingReply => NETMSG_PING_REPLY,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut packer = Packer::new();
        packer.add_int((self.id() << 1) | 1);

        match self {
            SystemMessage::Snap(part) => {
                packer.add_int(part.tick).add_int(part.delta_tick);
                if self.id() == NETMSG_SNAP {
                    packer.add_int(part.num_parts).add_int(part.part);
                }
                packer
                    .add_int(part.crc as i32)
                    .add_int(part.data.len() as i32)
                    .add_raw(&part.data);
            }
            SystemMessage::SnapEmpty { tick, delta_tick } => {
                packer.add_int(*tick).add_int(*delta_tick);
            }
            SystemMessage::Input {
                ack_tick,
                predicted_tick,
                input,
            } => {
                packer
                    .add_int(*ack_tick)
                    .add_int(*predicted_tick)
                    .add_int((PlayerInput::INTS * 4) as i32);
                for value in input.to_ints() {
                    packer.add_int(value);
                }
            }
            SystemMessage::InputTiming {
                intended_tick,
                time_left_ms,
            } => {
                packer.add_int(*intended_tick).add_int(*time_left_ms);
            }
            SystemMessage::EnterGame | SystemMessage::Ping | SystemMessage::PingReply => {}
        }

        packer.finish()
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut unpacker = Unpacker::new(data);
        let header = unpacker.get_int()?;
        if header & 1 == 0 {
            return Err(ProtocolError::NotSystem(header >> 1));
        }

        let message = match header >> 1 {
            NETMSG_ENTER_GAME => SystemMessage::EnterGame,
            id @ (NETMSG_SNAP | NETMSG_SNAP_SINGLE) => {
                let tick = unpacker.get_int()?;
                let delta_tick = unpacker.get_int()?;
                let (num_parts, part) = if id == NETMSG_SNAP {
                    (unpacker.get_int()?, unpacker.get_int()?)
                } else {
                    (1, 0)
                };
                let crc = unpacker.get_int()? as u32;
                let size = unpacker.get_int()?;
                let data = unpacker.get_raw(size)?.to_vec();
                SystemMessage::Snap(SnapPart {
                    tick,
                    delta_tick,
                    num_parts,
                    part,
                    crc,
                    data,
                })
            }
            NETMSG_SNAP_EMPTY => SystemMessage::SnapEmpty {
                tick: unpacker.get_int()?,
                delta_tick: unpacker.get_int()?,
            },
            NETMSG_INPUT => {
                let ack_tick = unpacker.get_int()?;
                let predicted_tick = unpacker.get_int()?;
                let size = unpacker.get_int()?;
                if !(0..=MAX_INPUT_SIZE).contains(&size) || size % 4 != 0 {
                    return Err(ProtocolError::InvalidField {
                        field: "input size",
                        value: size,
                    });
                }
                let ints = (0..size / 4)
                    .map(|_| unpacker.get_int())
                    .collect::<Result<Vec<_>, _>>()?;
                let input = PlayerInput::from_ints(&ints).ok_or(ProtocolError::InvalidField {
                    field: "input size",
                    value: size,
                })?;
                SystemMessage::Input {
                    ack_tick,
                    predicted_tick,
                    input,
                }
            }
            NETMSG_INPUT_TIMING => SystemMessage::InputTiming {
                intended_tick: unpacker.get_int()?,
                time_left_ms: unpacker.get_int()?,
            },
            NETMSG_PING => SystemMessage::Ping,
            NETMSG_PING_REPLY => SystemMessage::PingReply,
            other => return Err(ProtocolError::UnknownMessage(other)),
        };

        Ok(message)
    }
}

/// Wire form of a character's physics core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCharacterCore {
    pub tick: i32,
    pub x: i32,
    pub y: i32,
    pub vel_x: i32,
    pub vel_y: i32,
    pub angle: i32,
    pub direction: i32,
    pub jumped: i32,
    pub hooked_player: i32,
    pub hook_state: i32,
    pub hook_tick: i32,
    pub hook_x: i32,
    pub hook_y: i32,
    pub hook_dx: i32,
    pub hook_dy: i32,
}

/// Character item: physics core plus weapon state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCharacter {
    pub core: NetCharacterCore,
    pub weapon: i32,
    pub attack_tick: i32,
}

impl NetCharacter {
    pub const INTS: usize = 17;

    pub fn to_ints(&self) -> Vec<i32> {
        let c = &self.core;
        vec![
            c.tick,
            c.x,
            c.y,
            c.vel_x,
            c.vel_y,
            c.angle,
            c.direction,
            c.jumped,
            c.hooked_player,
            c.hook_state,
            c.hook_tick,
            c.hook_x,
            c.hook_y,
            c.hook_dx,
            c.hook_dy,
            self.weapon,
            self.attack_tick,
        ]
    }

    pub fn from_ints(ints: &[i32]) -> Option<Self> {
        if ints.len() != Self::INTS {
            return None;
        }
        Some(Self {
            core: NetCharacterCore {
                tick: ints[0],
                x: ints[1],
                y: ints[2],
                vel_x: ints[3],
                vel_y: ints[4],
                angle: ints[5],
                direction: ints[6],
                jumped: ints[7],
                hooked_player: ints[8],
                hook_state: ints[9],
                hook_tick: ints[10],
                hook_x: ints[11],
                hook_y: ints[12],
                hook_dx: ints[13],
                hook_dy: ints[14],
            },
            weapon: ints[15],
            attack_tick: ints[16],
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetPlayerInfo {
    /// Set only in the snapshot sent to the player it describes
    pub local: bool,
    pub client_id: i32,
    pub team: i32,
    pub score: i32,
    pub latency: i32,
}

impl NetPlayerInfo {
    pub const INTS: usize = 5;

    pub fn to_ints(&self) -> Vec<i32> {
        vec![
            i32::from(self.local),
            self.client_id,
            self.team,
            self.score,
            self.latency,
        ]
    }

    pub fn from_ints(ints: &[i32]) -> Option<Self> {
        if ints.len() != Self::INTS {
            return None;
        }
        Some(Self {
            local: ints[0] != 0,
            client_id: ints[1],
            team: ints[2],
            score: ints[3],
            latency: ints[4],
        })
    }
}

/// Character items of a snapshot keyed by client id; malformed items are skipped
pub fn characters(snapshot: &Snapshot) -> Vec<(usize, NetCharacter)> {
    snapshot
        .items_of_type(OBJ_CHARACTER)
        .filter_map(|item| {
            NetCharacter::from_ints(&item.data).map(|character| (usize::from(item.key.id), character))
        })
        .collect()
}

pub fn character(snapshot: &Snapshot, client_id: usize) -> Option<NetCharacter> {
    let id = u16::try_from(client_id).ok()?;
    snapshot
        .find(ItemKey::new(OBJ_CHARACTER, id))
        .and_then(|item| NetCharacter::from_ints(&item.data))
}

/// Client id flagged as local in this snapshot's player infos
pub fn local_client_id(snapshot: &Snapshot) -> Option<usize> {
    snapshot
        .items_of_type(OBJ_PLAYER_INFO)
        .filter_map(|item| NetPlayerInfo::from_ints(&item.data))
        .find(|info| info.local)
        .and_then(|info| usize::try_from(info.client_id).ok())
}
