//! Deterministic character physics shared by the server simulation and the
//! client's prediction replay.
//!
//! Both sides must run exactly the same float operations in exactly the same
//! order, and quantize to wire precision after every tick, or the client's
//! prediction drifts away from what the server later confirms.

use crate::protocol::{NetCharacter, NetCharacterCore, PlayerInput};
use crate::{MAX_CLIENTS, SERVER_TICK_SPEED};
use std::f32::consts::PI;
use std::ops::{Add, AddAssign, Mul, MulAssign, Sub};
use std::sync::Arc;

/// Width and height of a character's collision box
pub const PHYS_SIZE: f32 = 28.0;
pub const TILE_SIZE: i32 = 32;
pub const NUM_WEAPONS: i32 = 6;
/// Size in tiles of the arena both binaries play in
pub const ARENA_WIDTH: i32 = 40;
pub const ARENA_HEIGHT: i32 = 16;
/// Characters never move faster than this per tick
const MAX_VELOCITY: f32 = 6000.0;

///Represents a vector in 2D space.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec2 {
    ///Value along the x-axis.
    /// Positive direction is to the right.
    pub x: f32,
    ///Value along the y-axis.
    /// Positive direction is down.
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    ///Returns the magnitude of the vector.
    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    ///Returns the normalized vector, or zero for a zero vector.
    pub fn normalize(self) -> Vec2 {
        let len = self.length();
        if len == 0.0 {
            Vec2::ZERO
        } else {
            Vec2::new(self.x / len, self.y / len)
        }
    }

    pub fn distance(self, other: Vec2) -> f32 {
        (self - other).length()
    }

    pub fn dot(self, other: Vec2) -> f32 {
        self.x * other.x + self.y * other.y
    }

    ///Linear interpolation towards `other`.
    pub fn mix(self, other: Vec2, amount: f32) -> Vec2 {
        self + (other - self) * amount
    }
}

impl Add for Vec2 {
    type Output = Vec2;
    fn add(self, other: Vec2) -> Vec2 {
        Vec2::new(self.x + other.x, self.y + other.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, other: Vec2) -> Vec2 {
        Vec2::new(self.x - other.x, self.y - other.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;
    fn mul(self, scalar: f32) -> Vec2 {
        Vec2::new(self.x * scalar, self.y * scalar)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, other: Vec2) {
        self.x += other.x;
        self.y += other.y;
    }
}

impl MulAssign<f32> for Vec2 {
    fn mul_assign(&mut self, scalar: f32) {
        self.x *= scalar;
        self.y *= scalar;
    }
}

pub fn closest_point_on_line(from: Vec2, to: Vec2, point: Vec2) -> Vec2 {
    let segment = to - from;
    let len_sq = segment.dot(segment);
    if len_sq == 0.0 {
        return from;
    }
    let t = ((point - from).dot(segment) / len_sq).clamp(0.0, 1.0);
    from + segment * t
}

/// Adds `modifier` to `current` without pushing it past `min`/`max`; a value
/// already outside the range is left alone.
pub fn saturated_add(min: f32, max: f32, current: f32, modifier: f32) -> f32 {
    if modifier < 0.0 {
        if current < min {
            return current;
        }
        (current + modifier).max(min)
    } else {
        if current > max {
            return current;
        }
        (current + modifier).min(max)
    }
}

pub fn round_to_int(value: f32) -> i32 {
    if value > 0.0 {
        (value + 0.5) as i32
    } else {
        (value - 0.5) as i32
    }
}

fn velocity_ramp(value: f32, start: f32, range: f32, curvature: f32) -> f32 {
    if value < start {
        return 1.0;
    }
    1.0 / curvature.powf((value - start) / range)
}

/// Movement tuning, per tick. Both ends must agree on these values.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningParams {
    pub ground_control_speed: f32,
    pub ground_control_accel: f32,
    pub ground_friction: f32,
    pub ground_jump_impulse: f32,
    pub air_jump_impulse: f32,
    pub air_control_speed: f32,
    pub air_control_accel: f32,
    pub air_friction: f32,
    pub hook_length: f32,
    pub hook_fire_speed: f32,
    pub hook_drag_accel: f32,
    pub hook_drag_speed: f32,
    pub gravity: f32,
    pub velramp_start: f32,
    pub velramp_range: f32,
    pub velramp_curvature: f32,
    pub player_collision: bool,
    pub player_hooking: bool,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            ground_control_speed: 10.0,
            ground_control_accel: 100.0 / SERVER_TICK_SPEED as f32,
            ground_friction: 0.5,
            ground_jump_impulse: 13.2,
            air_jump_impulse: 12.0,
            air_control_speed: 250.0 / SERVER_TICK_SPEED as f32,
            air_control_accel: 1.5,
            air_friction: 0.95,
            hook_length: 380.0,
            hook_fire_speed: 80.0,
            hook_drag_accel: 3.0,
            hook_drag_speed: 15.0,
            gravity: 0.5,
            velramp_start: 550.0,
            velramp_range: 2000.0,
            velramp_curvature: 1.4,
            player_collision: true,
            player_hooking: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tile {
    Air,
    Solid,
    /// Solid, and hooks bounce off it
    NoHook,
}

/// Static tile grid the characters collide with
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionMap {
    width: i32,
    height: i32,
    tiles: Vec<Tile>,
}

impl CollisionMap {
    pub fn new(width: i32, height: i32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            tiles: vec![Tile::Air; (width * height) as usize],
        }
    }

    /// Empty room enclosed by solid walls, floor and ceiling
    pub fn arena(width: i32, height: i32) -> Self {
        let mut map = Self::new(width, height);
        for x in 0..map.width {
            map.set_tile(x, 0, Tile::Solid);
            map.set_tile(x, map.height - 1, Tile::Solid);
        }
        for y in 0..map.height {
            map.set_tile(0, y, Tile::Solid);
            map.set_tile(map.width - 1, y, Tile::Solid);
        }
        map
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn set_tile(&mut self, x: i32, y: i32, tile: Tile) {
        if (0..self.width).contains(&x) && (0..self.height).contains(&y) {
            self.tiles[(y * self.width + x) as usize] = tile;
        }
    }

    /// Tile under a world position; positions outside the map read the nearest edge tile
    pub fn tile_at(&self, x: f32, y: f32) -> Tile {
        let tx = (round_to_int(x) / TILE_SIZE).clamp(0, self.width - 1);
        let ty = (round_to_int(y) / TILE_SIZE).clamp(0, self.height - 1);
        self.tiles[(ty * self.width + tx) as usize]
    }

    pub fn check_point(&self, x: f32, y: f32) -> bool {
        self.tile_at(x, y) != Tile::Air
    }

    /// First colliding point along a line as `(tile, hit, last free point)`
    pub fn intersect_line(&self, from: Vec2, to: Vec2) -> Option<(Tile, Vec2, Vec2)> {
        let distance = from.distance(to);
        let end = (distance + 1.0) as i32;
        let mut last = from;

        for i in 0..=end {
            let pos = from.mix(to, i as f32 / end as f32);
            let tile = self.tile_at(pos.x, pos.y);
            if tile != Tile::Air {
                return Some((tile, pos, last));
            }
            last = pos;
        }

        None
    }

    pub fn test_box(&self, pos: Vec2, size: Vec2) -> bool {
        let half = size * 0.5;
        self.check_point(pos.x - half.x, pos.y - half.y)
            || self.check_point(pos.x + half.x, pos.y - half.y)
            || self.check_point(pos.x - half.x, pos.y + half.y)
            || self.check_point(pos.x + half.x, pos.y + half.y)
    }

    /// Moves a box by `vel` in unit-length steps, sliding along whichever axis is blocked
    pub fn move_box(&self, pos: &mut Vec2, vel: &mut Vec2, size: Vec2, elasticity: f32) {
        let distance = vel.length();
        if distance <= 0.00001 {
            return;
        }

        let max = distance as i32;
        let fraction = 1.0 / (max + 1) as f32;
        let mut current = *pos;
        let mut velocity = *vel;

        for _ in 0..=max {
            let mut next = current + velocity * fraction;

            if self.test_box(next, size) {
                let mut hits = 0;

                if self.test_box(Vec2::new(current.x, next.y), size) {
                    next.y = current.y;
                    velocity.y *= -elasticity;
                    hits += 1;
                }

                if self.test_box(Vec2::new(next.x, current.y), size) {
                    next.x = current.x;
                    velocity.x *= -elasticity;
                    hits += 1;
                }

                // corner case: neither axis alone collides
                if hits == 0 {
                    next = current;
                    velocity *= -elasticity;
                }
            }

            current = next;
        }

        *pos = current;
        *vel = velocity;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Retracted,
    Idle,
    /// Retraction animation, stages 1 to 3
    Retracting(u8),
    Flying,
    Grabbed,
}

impl HookState {
    const RETRACT_END: u8 = 3;

    pub fn to_wire(self) -> i32 {
        match self {
            HookState::Retracted => -1,
            HookState::Idle => 0,
            HookState::Retracting(stage) => i32::from(stage),
            HookState::Flying => 4,
            HookState::Grabbed => 5,
        }
    }

    pub fn from_wire(value: i32) -> Self {
        match value {
            -1 => HookState::Retracted,
            1..=3 => HookState::Retracting(value as u8),
            4 => HookState::Flying,
            5 => HookState::Grabbed,
            _ => HookState::Idle,
        }
    }
}

/// Physics state of one character
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterCore {
    pub pos: Vec2,
    pub vel: Vec2,
    pub hook_pos: Vec2,
    pub hook_dir: Vec2,
    pub hook_tick: i32,
    pub hook_state: HookState,
    pub hooked_player: Option<usize>,
    /// Bit 0: jump held since last jump. Bit 1: air jump used.
    pub jumped: i32,
    pub direction: i32,
    pub angle: i32,
    pub input: PlayerInput,
    pub weapon: i32,
    pub attack_tick: i32,
}

impl CharacterCore {
    pub fn spawn(pos: Vec2) -> Self {
        Self {
            pos,
            vel: Vec2::ZERO,
            hook_pos: pos,
            hook_dir: Vec2::ZERO,
            hook_tick: 0,
            hook_state: HookState::Idle,
            hooked_player: None,
            jumped: 0,
            direction: 0,
            angle: 0,
            input: PlayerInput::default(),
            weapon: 1,
            attack_tick: 0,
        }
    }

    fn release_hook(&mut self) {
        self.hooked_player = None;
        self.hook_state = HookState::Retracted;
        self.hook_pos = self.pos;
    }

    /// Advances one tick. `others` holds every other character; this
    /// character's own slot must be empty.
    fn tick(
        &mut self,
        use_input: bool,
        tuning: &TuningParams,
        collision: &CollisionMap,
        others: &mut [Option<CharacterCore>],
    ) {
        let half = PHYS_SIZE / 2.0;
        let grounded = collision.check_point(self.pos.x + half, self.pos.y + half + 5.0)
            || collision.check_point(self.pos.x - half, self.pos.y + half + 5.0);

        let target_direction =
            Vec2::new(self.input.target_x as f32, self.input.target_y as f32).normalize();

        self.vel.y += tuning.gravity;

        let (max_speed, accel, friction) = if grounded {
            (
                tuning.ground_control_speed,
                tuning.ground_control_accel,
                tuning.ground_friction,
            )
        } else {
            (
                tuning.air_control_speed,
                tuning.air_control_accel,
                tuning.air_friction,
            )
        };

        if use_input {
            self.direction = self.input.direction;

            let mut angle = if self.input.target_x == 0 {
                (self.input.target_y as f32).atan()
            } else {
                (self.input.target_y as f32 / self.input.target_x as f32).atan()
            };
            if self.input.target_x < 0 {
                angle += PI;
            }
            self.angle = (angle * 256.0) as i32;

            if self.input.jump != 0 {
                if self.jumped & 1 == 0 {
                    if grounded {
                        self.vel.y = -tuning.ground_jump_impulse;
                        self.jumped |= 1;
                    } else if self.jumped & 2 == 0 {
                        self.vel.y = -tuning.air_jump_impulse;
                        self.jumped |= 3;
                    }
                }
            } else {
                self.jumped &= !1;
            }

            if self.input.hook != 0 {
                if self.hook_state == HookState::Idle {
                    self.hook_state = HookState::Flying;
                    self.hook_pos = self.pos + target_direction * PHYS_SIZE * 1.5;
                    self.hook_dir = target_direction;
                    self.hooked_player = None;
                    self.hook_tick = 0;
                }
            } else {
                self.hooked_player = None;
                self.hook_state = HookState::Idle;
                self.hook_pos = self.pos;
            }

            if self.input.wanted_weapon > 0 {
                self.weapon = (self.input.wanted_weapon - 1).clamp(0, NUM_WEAPONS - 1);
            }
        }

        if self.direction < 0 {
            self.vel.x = saturated_add(-max_speed, max_speed, self.vel.x, -accel);
        }
        if self.direction > 0 {
            self.vel.x = saturated_add(-max_speed, max_speed, self.vel.x, accel);
        }
        if self.direction == 0 {
            self.vel.x *= friction;
        }

        if grounded {
            self.jumped &= !2;
        }

        match self.hook_state {
            HookState::Idle => {
                self.hooked_player = None;
                self.hook_pos = self.pos;
            }
            HookState::Retracting(stage) if stage < HookState::RETRACT_END => {
                self.hook_state = HookState::Retracting(stage + 1);
            }
            HookState::Retracting(_) => {
                self.hook_state = HookState::Retracted;
            }
            HookState::Flying => self.fly_hook(tuning, collision, others),
            HookState::Retracted | HookState::Grabbed => {}
        }

        if self.hook_state == HookState::Grabbed {
            if let Some(hooked) = self.hooked_player {
                match others.get(hooked).and_then(Option::as_ref) {
                    Some(target) => self.hook_pos = target.pos,
                    None => self.release_hook(),
                }
            }

            if self.hooked_player.is_none() && self.hook_pos.distance(self.pos) > 46.0 {
                let mut hook_vel = (self.hook_pos - self.pos).normalize() * tuning.hook_drag_accel;
                // pulls up harder than down
                if hook_vel.y > 0.0 {
                    hook_vel.y *= 0.3;
                }
                if (hook_vel.x < 0.0 && self.direction < 0) || (hook_vel.x > 0.0 && self.direction > 0)
                {
                    hook_vel.x *= 0.95;
                } else {
                    hook_vel.x *= 0.75;
                }

                let new_vel = self.vel + hook_vel;
                if new_vel.length() < tuning.hook_drag_speed || new_vel.length() < self.vel.length() {
                    self.vel = new_vel;
                }
            }

            self.hook_tick += 1;
            if let Some(hooked) = self.hooked_player {
                let gone = others.get(hooked).map_or(true, Option::is_none);
                if self.hook_tick > SERVER_TICK_SPEED + SERVER_TICK_SPEED / 5 || gone {
                    self.release_hook();
                }
            }
        }

        for (id, slot) in others.iter_mut().enumerate() {
            let Some(other) = slot.as_mut() else {
                continue;
            };

            let distance = self.pos.distance(other.pos);
            let dir = (self.pos - other.pos).normalize();

            if tuning.player_collision && distance < PHYS_SIZE * 1.25 && distance > 0.0 {
                let a = PHYS_SIZE * 1.45 - distance;
                let mut velocity = 0.5;
                if self.vel.length() > 0.0001 {
                    velocity = 1.0 - (self.vel.normalize().dot(dir) + 1.0) / 2.0;
                }
                self.vel += dir * a * (velocity * 0.75);
                self.vel *= 0.85;
            }

            if self.hooked_player == Some(id) && tuning.player_hooking && distance > PHYS_SIZE * 1.5 {
                let accel = tuning.hook_drag_accel * (distance / tuning.hook_length);
                let drag = tuning.hook_drag_speed;

                other.vel.x = saturated_add(-drag, drag, other.vel.x, accel * dir.x * 1.5);
                other.vel.y = saturated_add(-drag, drag, other.vel.y, accel * dir.y * 1.5);

                self.vel.x = saturated_add(-drag, drag, self.vel.x, -accel * dir.x * 0.25);
                self.vel.y = saturated_add(-drag, drag, self.vel.y, -accel * dir.y * 0.25);
            }
        }

        if self.vel.length() > MAX_VELOCITY {
            self.vel = self.vel.normalize() * MAX_VELOCITY;
        }
    }

    fn fly_hook(
        &mut self,
        tuning: &TuningParams,
        collision: &CollisionMap,
        others: &[Option<CharacterCore>],
    ) {
        let mut new_pos = self.hook_pos + self.hook_dir * tuning.hook_fire_speed;
        if self.pos.distance(new_pos) > tuning.hook_length {
            self.hook_state = HookState::Retracting(1);
            new_pos = self.pos + (new_pos - self.pos).normalize() * tuning.hook_length;
        }

        let mut hit_ground = false;
        let mut hit_no_hook = false;
        if let Some((tile, hit, _)) = collision.intersect_line(self.hook_pos, new_pos) {
            new_pos = hit;
            if tile == Tile::NoHook {
                hit_no_hook = true;
            } else {
                hit_ground = true;
            }
        }

        if tuning.player_hooking {
            let mut best = 0.0;
            for (id, other) in others.iter().enumerate() {
                let Some(other) = other else {
                    continue;
                };
                let closest = closest_point_on_line(self.hook_pos, new_pos, other.pos);
                if other.pos.distance(closest) < PHYS_SIZE + 2.0 {
                    let distance = self.hook_pos.distance(other.pos);
                    if self.hooked_player.is_none() || distance < best {
                        self.hook_state = HookState::Grabbed;
                        self.hooked_player = Some(id);
                        best = distance;
                    }
                }
            }
        }

        if self.hook_state == HookState::Flying {
            if hit_ground {
                self.hook_state = HookState::Grabbed;
            } else if hit_no_hook {
                self.hook_state = HookState::Retracting(1);
            }
            self.hook_pos = new_pos;
        }
    }

    /// Moves by the current velocity, stopping short of other characters
    fn move_by_velocity(
        &mut self,
        tuning: &TuningParams,
        collision: &CollisionMap,
        others: &[Option<CharacterCore>],
    ) {
        let ramp = velocity_ramp(
            self.vel.length() * 50.0,
            tuning.velramp_start,
            tuning.velramp_range,
            tuning.velramp_curvature,
        );

        self.vel.x *= ramp;
        let mut new_pos = self.pos;
        collision.move_box(
            &mut new_pos,
            &mut self.vel,
            Vec2::new(PHYS_SIZE, PHYS_SIZE),
            0.0,
        );
        self.vel.x *= 1.0 / ramp;

        if tuning.player_collision {
            let distance = self.pos.distance(new_pos);
            if distance > 0.0 {
                let end = (distance + 1.0) as i32;
                let mut last = self.pos;
                for i in 0..end {
                    let a = i as f32 / distance;
                    let pos = self.pos.mix(new_pos, a);
                    for other in others.iter().flatten() {
                        let d = pos.distance(other.pos);
                        if d < PHYS_SIZE && d > 0.0 {
                            if a > 0.0 {
                                self.pos = last;
                            } else if new_pos.distance(other.pos) > d {
                                self.pos = new_pos;
                            }
                            return;
                        }
                    }
                    last = pos;
                }
            }
        }

        self.pos = new_pos;
    }

    pub fn write(&self, tick: i32) -> NetCharacterCore {
        NetCharacterCore {
            tick,
            x: round_to_int(self.pos.x),
            y: round_to_int(self.pos.y),
            vel_x: round_to_int(self.vel.x * 256.0),
            vel_y: round_to_int(self.vel.y * 256.0),
            angle: self.angle,
            direction: self.direction,
            jumped: self.jumped,
            hooked_player: self.hooked_player.map_or(-1, |id| id as i32),
            hook_state: self.hook_state.to_wire(),
            hook_tick: self.hook_tick,
            hook_x: round_to_int(self.hook_pos.x),
            hook_y: round_to_int(self.hook_pos.y),
            hook_dx: round_to_int(self.hook_dir.x * 256.0),
            hook_dy: round_to_int(self.hook_dir.y * 256.0),
        }
    }

    /// Overwrites the physics fields from their wire form; input and weapon are kept
    pub fn read(&mut self, core: &NetCharacterCore) {
        self.pos = Vec2::new(core.x as f32, core.y as f32);
        self.vel = Vec2::new(core.vel_x as f32 / 256.0, core.vel_y as f32 / 256.0);
        self.hook_state = HookState::from_wire(core.hook_state);
        self.hook_tick = core.hook_tick;
        self.hook_pos = Vec2::new(core.hook_x as f32, core.hook_y as f32);
        self.hook_dir = Vec2::new(core.hook_dx as f32 / 256.0, core.hook_dy as f32 / 256.0);
        self.hooked_player = usize::try_from(core.hooked_player)
            .ok()
            .filter(|&id| id < MAX_CLIENTS);
        self.jumped = core.jumped;
        self.direction = core.direction;
        self.angle = core.angle;
    }

    pub fn from_net(character: &NetCharacter) -> Self {
        let mut core = Self::spawn(Vec2::ZERO);
        core.read(&character.core);
        core.weapon = character.weapon;
        core.attack_tick = character.attack_tick;
        core
    }

    pub fn to_net(&self, tick: i32) -> NetCharacter {
        NetCharacter {
            core: self.write(tick),
            weapon: self.weapon,
            attack_tick: self.attack_tick,
        }
    }

    /// Rounds the state to wire precision
    pub fn quantize(&mut self) {
        let core = self.write(0);
        self.read(&core);
    }
}

/// Every character plus the shared tuning and map: one complete simulation
#[derive(Debug, Clone)]
pub struct WorldCore {
    pub tick: i32,
    pub tuning: TuningParams,
    collision: Arc<CollisionMap>,
    characters: Vec<Option<CharacterCore>>,
}

impl WorldCore {
    pub fn new(tuning: TuningParams, collision: Arc<CollisionMap>) -> Self {
        Self {
            tick: 0,
            tuning,
            collision,
            characters: vec![None; MAX_CLIENTS],
        }
    }

    pub fn collision(&self) -> &Arc<CollisionMap> {
        &self.collision
    }

    pub fn character(&self, id: usize) -> Option<&CharacterCore> {
        self.characters.get(id).and_then(Option::as_ref)
    }

    pub fn character_mut(&mut self, id: usize) -> Option<&mut CharacterCore> {
        self.characters.get_mut(id).and_then(Option::as_mut)
    }

    pub fn insert_character(&mut self, id: usize, core: CharacterCore) {
        if let Some(slot) = self.characters.get_mut(id) {
            *slot = Some(core);
        }
    }

    pub fn remove_character(&mut self, id: usize) -> Option<CharacterCore> {
        self.characters.get_mut(id).and_then(Option::take)
    }

    /// Ids of present characters, ascending
    pub fn active_ids(&self) -> Vec<usize> {
        self.characters
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn tick_character(&mut self, id: usize, use_input: bool) {
        let Some(mut core) = self.remove_character(id) else {
            return;
        };
        core.tick(use_input, &self.tuning, &self.collision, &mut self.characters);
        self.characters[id] = Some(core);
    }

    pub fn move_character(&mut self, id: usize) {
        let Some(mut core) = self.remove_character(id) else {
            return;
        };
        core.move_by_velocity(&self.tuning, &self.collision, &self.characters);
        self.characters[id] = Some(core);
    }

    /// One world step: every character in `order` ticks, then moves, then
    /// is quantized. `use_input` decides per character whether its current
    /// input is applied this tick.
    pub fn step(&mut self, order: &[usize], use_input: impl Fn(usize) -> bool) {
        for &id in order {
            self.tick_character(id, use_input(id));
        }
        for &id in order {
            self.move_character(id);
        }
        for &id in order {
            if let Some(core) = self.character_mut(id) {
                core.quantize();
            }
        }
        self.tick += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn small_arena() -> Arc<CollisionMap> {
        Arc::new(CollisionMap::arena(30, 12))
    }

    // resting height on the floor of `small_arena`
    const FLOOR_REST_Y: f32 = 337.0;

    fn world_with(characters: &[(usize, Vec2)]) -> WorldCore {
        let mut world = WorldCore::new(TuningParams::default(), small_arena());
        for &(id, pos) in characters {
            world.insert_character(id, CharacterCore::spawn(pos));
        }
        world
    }

    fn run(world: &mut WorldCore, ticks: usize) {
        for _ in 0..ticks {
            let order = world.active_ids();
            world.step(&order, |_| true);
        }
    }

    #[test]
    fn test_vector_math() {
        let v = Vec2::new(3.0, 4.0);
        assert_approx_eq!(v.length(), 5.0);
        assert_approx_eq!(v.normalize().x, 0.6);
        assert_eq!(Vec2::ZERO.normalize(), Vec2::ZERO);
        assert_eq!(v.mix(Vec2::ZERO, 0.5), Vec2::new(1.5, 2.0));
        assert_approx_eq!(v.dot(Vec2::new(1.0, 1.0)), 7.0);
    }

    #[test]
    fn test_closest_point() {
        let p = closest_point_on_line(Vec2::ZERO, Vec2::new(10.0, 0.0), Vec2::new(4.0, 5.0));
        assert_eq!(p, Vec2::new(4.0, 0.0));
        let p = closest_point_on_line(Vec2::ZERO, Vec2::new(10.0, 0.0), Vec2::new(-4.0, 5.0));
        assert_eq!(p, Vec2::ZERO);
        let p = closest_point_on_line(Vec2::ZERO, Vec2::ZERO, Vec2::new(1.0, 1.0));
        assert_eq!(p, Vec2::ZERO);
    }

    #[test]
    fn test_saturated_add() {
        assert_eq!(saturated_add(-10.0, 10.0, 9.0, 2.0), 10.0);
        assert_eq!(saturated_add(-10.0, 10.0, 12.0, 2.0), 12.0);
        assert_eq!(saturated_add(-10.0, 10.0, -9.0, -2.0), -10.0);
        assert_eq!(saturated_add(-10.0, 10.0, -12.0, -2.0), -12.0);
        assert_eq!(saturated_add(-10.0, 10.0, 0.0, 2.0), 2.0);
    }

    #[test]
    fn test_round_to_int() {
        assert_eq!(round_to_int(1.5), 2);
        assert_eq!(round_to_int(1.49), 1);
        assert_eq!(round_to_int(-1.5), -2);
        assert_eq!(round_to_int(-0.0), 0);
    }

    #[test]
    fn test_map_edges_are_clamped() {
        let map = CollisionMap::arena(10, 10);
        assert!(map.check_point(-100.0, 100.0));
        assert!(!map.check_point(100.0, 100.0));
        assert!(map.check_point(100.0, 10_000.0));
    }

    #[test]
    fn test_intersect_line() {
        let map = CollisionMap::arena(10, 10);
        let hit = map.intersect_line(Vec2::new(100.0, 100.0), Vec2::new(100.0, -100.0));
        let (tile, pos, before) = hit.unwrap();
        assert_eq!(tile, Tile::Solid);
        assert!(pos.y < 32.0);
        assert!(before.y >= pos.y);
        assert!(map
            .intersect_line(Vec2::new(100.0, 100.0), Vec2::new(200.0, 100.0))
            .is_none());
    }

    #[test]
    fn test_move_box_stops_at_wall() {
        let map = CollisionMap::arena(10, 10);
        let mut pos = Vec2::new(100.0, 100.0);
        let mut vel = Vec2::new(-200.0, 0.0);
        map.move_box(&mut pos, &mut vel, Vec2::new(PHYS_SIZE, PHYS_SIZE), 0.0);
        assert!(pos.x - PHYS_SIZE / 2.0 >= 31.0);
        assert_eq!(vel.x, 0.0);
    }

    #[test]
    fn test_character_falls_to_floor() {
        let mut world = world_with(&[(0, Vec2::new(100.0, 100.0))]);
        run(&mut world, 200);
        let core = world.character(0).unwrap();
        assert!((core.pos.y - FLOOR_REST_Y).abs() <= 1.0);
        assert!(core.vel.y.abs() < 0.01);
    }

    #[test]
    fn test_ground_jump() {
        let mut world = world_with(&[(0, Vec2::new(100.0, FLOOR_REST_Y))]);
        world.character_mut(0).unwrap().input.jump = 1;
        run(&mut world, 1);
        let core = world.character(0).unwrap();
        assert!(core.vel.y < -13.0);
        assert_eq!(core.jumped & 1, 1);
        assert!(core.pos.y < FLOOR_REST_Y);
    }

    #[test]
    fn test_walking_reaches_ground_speed() {
        let mut world = world_with(&[(0, Vec2::new(100.0, FLOOR_REST_Y))]);
        world.character_mut(0).unwrap().input.direction = 1;
        run(&mut world, 20);
        let core = world.character(0).unwrap();
        assert!(core.vel.x > 9.0);
        assert!(core.pos.x > 200.0);
    }

    #[test]
    fn test_hook_grabs_ceiling_and_pulls() {
        let mut world = world_with(&[(0, Vec2::new(100.0, FLOOR_REST_Y))]);
        {
            let input = &mut world.character_mut(0).unwrap().input;
            input.target_x = 0;
            input.target_y = -1;
            input.hook = 1;
        }
        run(&mut world, 8);
        let core = world.character(0).unwrap();
        assert_eq!(core.hook_state, HookState::Grabbed);
        assert!(core.hooked_player.is_none());
        assert!(core.pos.y < FLOOR_REST_Y);
    }

    #[test]
    fn test_hook_grabs_and_drags_player() {
        let mut world = world_with(&[
            (0, Vec2::new(100.0, FLOOR_REST_Y)),
            (1, Vec2::new(300.0, FLOOR_REST_Y)),
        ]);
        {
            let input = &mut world.character_mut(0).unwrap().input;
            input.target_x = 1;
            input.target_y = 0;
            input.hook = 1;
        }
        run(&mut world, 3);
        assert_eq!(world.character(0).unwrap().hooked_player, Some(1));
        assert!(world.character(1).unwrap().vel.x < 0.0);
    }

    #[test]
    fn test_quantize_is_idempotent() {
        let mut core = CharacterCore::spawn(Vec2::new(100.3, 200.7));
        core.vel = Vec2::new(1.234_567, -9.876_543);
        core.quantize();
        let once = core.clone();
        core.quantize();
        assert_eq!(core, once);
        assert_eq!(once.pos, Vec2::new(100.0, 201.0));
    }

    #[test]
    fn test_net_roundtrip_keeps_wire_state() {
        let mut core = CharacterCore::spawn(Vec2::new(64.0, 96.0));
        core.vel = Vec2::new(2.5, -1.0);
        core.hook_state = HookState::Retracting(2);
        core.hooked_player = Some(3);
        core.weapon = 4;
        core.quantize();

        let net = core.to_net(77);
        assert_eq!(net.core.tick, 77);
        assert_eq!(CharacterCore::from_net(&net), core);
    }

    #[test]
    fn test_hook_state_wire_values() {
        for state in [
            HookState::Retracted,
            HookState::Idle,
            HookState::Retracting(1),
            HookState::Retracting(3),
            HookState::Flying,
            HookState::Grabbed,
        ] {
            assert_eq!(HookState::from_wire(state.to_wire()), state);
        }
        assert_eq!(HookState::from_wire(99), HookState::Idle);
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let make = || {
            let mut world = world_with(&[
                (0, Vec2::new(100.0, 200.0)),
                (1, Vec2::new(180.0, 250.0)),
                (2, Vec2::new(400.0, 100.0)),
            ]);
            let input = &mut world.character_mut(0).unwrap().input;
            input.direction = 1;
            input.target_x = 10;
            input.target_y = 3;
            input.hook = 1;
            world
        };
        let mut a = make();
        let mut b = make();
        for tick in 0..150 {
            for world in [&mut a, &mut b] {
                if tick == 40 {
                    world.character_mut(1).unwrap().input.jump = 1;
                }
                let order = world.active_ids();
                world.step(&order, |id| id != 2);
            }
        }
        for id in 0..3 {
            assert_eq!(a.character(id), b.character(id));
        }
        assert_eq!(a.tick, 150);
    }
}
