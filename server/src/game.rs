use log::info;
use shared::physics::{
    CharacterCore, CollisionMap, TuningParams, Vec2, WorldCore, ARENA_HEIGHT, ARENA_WIDTH,
    TILE_SIZE,
};
use shared::protocol::{NetPlayerInfo, OBJ_CHARACTER, OBJ_PLAYER_INFO};
use shared::snapshot::SnapshotError;
use shared::{PlayerInput, Snapshot, SnapshotBuilder};
use std::sync::Arc;

/// Authoritative world: the same physics the clients predict with, stepped
/// once per server tick
#[derive(Debug, Clone)]
pub struct GameState {
    world: WorldCore,
}

impl GameState {
    pub fn new() -> Self {
        Self::with_map(Arc::new(CollisionMap::arena(ARENA_WIDTH, ARENA_HEIGHT)))
    }

    pub fn with_map(collision: Arc<CollisionMap>) -> Self {
        Self {
            world: WorldCore::new(TuningParams::default(), collision),
        }
    }

    /// Tick of the last completed step
    pub fn tick(&self) -> i32 {
        self.world.tick
    }

    pub fn world(&self) -> &WorldCore {
        &self.world
    }

    pub fn add_player(&mut self, client_id: usize) {
        let spawn = self.spawn_point(client_id);
        self.world
            .insert_character(client_id, CharacterCore::spawn(spawn));
        info!("Added player {} at ({}, {})", client_id, spawn.x, spawn.y);
    }

    pub fn remove_player(&mut self, client_id: &usize) {
        if self.world.remove_character(*client_id).is_some() {
            info!("Removed player {}", client_id);
        }
    }

    pub fn has_player(&self, client_id: usize) -> bool {
        self.world.character(client_id).is_some()
    }

    /// Spreads players along the floor, one tile column apart per slot
    fn spawn_point(&self, client_id: usize) -> Vec2 {
        let collision = self.world.collision();
        let columns = (collision.width() - 2).max(1) as usize;
        let column = 1 + (client_id * 3) % columns;
        let row = (collision.height() - 2).max(0);
        Vec2::new(
            (column as i32 * TILE_SIZE + TILE_SIZE / 2) as f32,
            (row * TILE_SIZE + TILE_SIZE / 2) as f32,
        )
    }

    /// Simulates the next tick, feeding each player the input `input_for`
    /// yields for that tick
    pub fn step(&mut self, mut input_for: impl FnMut(usize, i32) -> PlayerInput) {
        let tick = self.world.tick + 1;
        let order = self.world.active_ids();
        for &id in &order {
            let input = input_for(id, tick);
            if let Some(core) = self.world.character_mut(id) {
                core.input = input;
            }
        }
        self.world.step(&order, |_| true);
    }

    /// Snapshot of the current tick as seen by `client_id`
    pub fn snapshot_for(
        &self,
        client_id: usize,
        latencies: &[(usize, i32)],
    ) -> Result<Snapshot, SnapshotError> {
        let mut builder = SnapshotBuilder::new();

        for id in self.world.active_ids() {
            let latency = latencies
                .iter()
                .find(|(other, _)| *other == id)
                .map_or(0, |(_, latency)| *latency);
            let info = NetPlayerInfo {
                local: id == client_id,
                client_id: id as i32,
                latency,
                ..NetPlayerInfo::default()
            };
            builder.add_item(OBJ_PLAYER_INFO, id as u16, &info.to_ints())?;

            if let Some(core) = self.world.character(id) {
                let character = core.to_net(self.world.tick);
                builder.add_item(OBJ_CHARACTER, id as u16, &character.to_ints())?;
            }
        }

        Ok(builder.finish())
    }
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol;

    #[test]
    fn test_players_spawn_inside_arena() {
        let mut game = GameState::new();
        for id in 0..8 {
            game.add_player(id);
        }

        let map = game.world().collision().clone();
        for id in 0..8 {
            let core = game.world().character(id).unwrap();
            assert!(!map.check_point(core.pos.x, core.pos.y));
        }
    }

    #[test]
    fn test_remove_player() {
        let mut game = GameState::new();
        game.add_player(2);
        assert!(game.has_player(2));

        game.remove_player(&2);
        assert!(!game.has_player(2));
        assert!(game.world().active_ids().is_empty());
    }

    #[test]
    fn test_step_applies_input() {
        let mut game = GameState::new();
        game.add_player(0);
        let start_x = game.world().character(0).unwrap().pos.x;

        for _ in 0..20 {
            game.step(|_, _| PlayerInput {
                direction: 1,
                ..PlayerInput::default()
            });
        }

        assert_eq!(game.tick(), 20);
        assert!(game.world().character(0).unwrap().pos.x > start_x);
    }

    #[test]
    fn test_step_passes_upcoming_tick() {
        let mut game = GameState::new();
        game.add_player(0);
        let mut seen = Vec::new();

        game.step(|id, tick| {
            seen.push((id, tick));
            PlayerInput::default()
        });

        assert_eq!(seen, vec![(0, 1)]);
    }

    #[test]
    fn test_snapshot_marks_local_player() {
        let mut game = GameState::new();
        game.add_player(0);
        game.add_player(1);

        let snapshot = game.snapshot_for(1, &[(0, 12), (1, 34)]).unwrap();

        assert_eq!(protocol::local_client_id(&snapshot), Some(1));
        assert_eq!(protocol::characters(&snapshot).len(), 2);
        assert_eq!(snapshot.items_of_type(OBJ_PLAYER_INFO).count(), 2);

        let info = snapshot
            .items_of_type(OBJ_PLAYER_INFO)
            .find_map(|item| NetPlayerInfo::from_ints(&item.data))
            .unwrap();
        assert_eq!(info.client_id, 0);
        assert_eq!(info.latency, 12);
        assert!(!info.local);
    }

    #[test]
    fn test_snapshot_character_matches_world() {
        let mut game = GameState::new();
        game.add_player(3);
        game.step(|_, _| PlayerInput::default());

        let snapshot = game.snapshot_for(3, &[]).unwrap();
        let character = protocol::character(&snapshot, 3).unwrap();
        let expected = game.world().character(3).unwrap().to_net(game.tick());

        assert_eq!(character, expected);
    }
}
