//! Procedural map construction: an ordered list of passes, each carrying
//! hooks that react to the values the pass computes. Generation is
//! synchronous; the events it produces buffer in the map's queue until the
//! in-game protocol drains them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use noise::{Fbm, MultiFractal, NoiseFn, Simplex};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::game::map::{Map, MapEvent, vicinity};
use crate::game::{GameError, Player};
use crate::rules::{TerrainType, UnitType};
use crate::util::{IdRegistry, lock};

/// Grid area the map grows by for every player. The subtraction keeps the
/// rounded-up square at 20x20 for a single player.
const AREA_PER_PLAYER: u32 = 20 * 20 - 1;

/// Mean and standard deviation of the raw fBm output, determined
/// empirically; pushing samples through the matching Gaussian CDF makes
/// them uniform in [0, 1].
const NOISE_SIGMA: f64 = 0.4433703902714217;

fn gaussian_cdf(x: f64, mu: f64, sigma: f64) -> f64 {
    0.5 * (1.0 + libm::erf((x - mu) / (sigma * std::f64::consts::SQRT_2)))
}

/// A cell hook runs for every cell the noise pass visits, with the cell's
/// noise value.
pub type CellHook = Box<dyn Fn(&Arc<Map>, (u32, u32), f64) -> Result<(), GameError> + Send + Sync>;

/// A player hook runs once per player with that player's base position.
pub type PlayerHook =
    Box<dyn Fn(&Arc<Map>, &Arc<Player>, (u32, u32)) -> Result<(), GameError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    /// Raw fBm output, roughly in [-1, 1].
    #[default]
    Raw,
    /// Output mapped to a uniform [0, 1] through the Gaussian CDF.
    Uniform,
}

#[derive(Debug, Clone)]
pub struct NoiseParams {
    pub scale_x: f64,
    pub scale_y: f64,
    pub octaves: usize,
    pub persistence: f64,
    pub lacunarity: f64,
    pub seed: u32,
    pub distribution: Distribution,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            scale_x: 1.0,
            scale_y: 1.0,
            octaves: 1,
            persistence: 0.5,
            lacunarity: 2.0,
            seed: 0,
            distribution: Distribution::Raw,
        }
    }
}

/// Evaluates 2D simplex fBm noise at every cell and feeds the value to its
/// hooks.
pub struct NoisePass {
    noise: Fbm<Simplex>,
    scale_x: f64,
    scale_y: f64,
    distribution: Distribution,
    hooks: Vec<CellHook>,
}

impl NoisePass {
    pub fn new(params: NoiseParams) -> Self {
        let noise = Fbm::<Simplex>::new(params.seed)
            .set_octaves(params.octaves)
            .set_persistence(params.persistence)
            .set_lacunarity(params.lacunarity);
        Self {
            noise,
            scale_x: params.scale_x,
            scale_y: params.scale_y,
            distribution: params.distribution,
            hooks: Vec::new(),
        }
    }

    pub fn add_hook(&mut self, hook: CellHook) {
        self.hooks.push(hook);
    }

    pub fn value_at(&self, (x, y): (u32, u32)) -> f64 {
        let raw = self
            .noise
            .get([f64::from(x) * self.scale_x, f64::from(y) * self.scale_y]);
        match self.distribution {
            Distribution::Raw => raw,
            Distribution::Uniform => gaussian_cdf(raw, 0.0, NOISE_SIGMA),
        }
    }

    fn generate(&self, map: &Arc<Map>) -> Result<(), GameError> {
        for x in 0..map.width {
            for y in 0..map.height {
                let value = self.value_at((x, y));
                for hook in &self.hooks {
                    hook(map, (x, y), value)?;
                }
            }
        }
        Ok(())
    }
}

/// Computes one base position per player, evenly spread on an ellipse
/// around the map center, pulled in so nobody starts against the edge.
#[derive(Default)]
pub struct PlayerBasePass {
    hooks: Vec<PlayerHook>,
}

impl PlayerBasePass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&mut self, hook: PlayerHook) {
        self.hooks.push(hook);
    }

    fn generate(&self, map: &Arc<Map>) -> Result<(), GameError> {
        let mut players: Vec<Arc<Player>> = lock(&map.players).iter().cloned().collect();
        players.sort_by_key(|player| player.id);
        if players.is_empty() {
            return Ok(());
        }
        let center_x = f64::from(map.width) / 2.0;
        let center_y = f64::from(map.height) / 2.0;
        let radius_x = center_x / std::f64::consts::SQRT_2;
        let radius_y = center_y / std::f64::consts::SQRT_2;
        let phi = std::f64::consts::TAU / players.len() as f64;
        for (index, player) in players.iter().enumerate() {
            let angle = phi * index as f64;
            let base_x = (center_x + radius_x * angle.cos()) as u32;
            let base_y = (center_y + radius_y * angle.sin()) as u32;
            for hook in &self.hooks {
                hook(map, player, (base_x, base_y))?;
            }
        }
        Ok(())
    }
}

pub enum Pass {
    Noise(NoisePass),
    PlayerBases(PlayerBasePass),
}

impl Pass {
    fn generate(&self, map: &Arc<Map>) -> Result<(), GameError> {
        match self {
            Pass::Noise(pass) => pass.generate(map),
            Pass::PlayerBases(pass) => pass.generate(map),
        }
    }
}

#[derive(Default)]
pub struct Generator {
    passes: Vec<Pass>,
}

impl Generator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pass(&mut self, pass: Pass) {
        self.passes.push(pass);
    }

    /// Build the world for the given players. The map announces itself
    /// before the first pass runs so clients can allocate state.
    pub fn generate(
        &self,
        players: Arc<Mutex<IdRegistry<Arc<Player>>>>,
    ) -> Result<(Arc<Map>, UnboundedReceiver<MapEvent>), GameError> {
        let count = lock(&players).len() as u32;
        let size = (f64::from(count * AREA_PER_PLAYER).sqrt() as u32) + 1;
        log::info!("generating map with dimensions {size}x{size} for {count} players");
        let (map, events) = Map::new(players, size, size);
        map.emit(MapEvent::Generated {
            width: map.width,
            height: map.height,
        });
        for pass in &self.passes {
            pass.generate(&map)?;
        }
        Ok((map, events))
    }
}

/// Fires when the noise value lands in `[lo, hi)` and paints the cell.
pub fn terrain_hook(terrain_type: Arc<TerrainType>, lo: f64, hi: f64) -> CellHook {
    Box::new(move |map, xy, value| {
        if lo <= value && value < hi {
            map.set_terrain(xy, &terrain_type)?;
        }
        Ok(())
    })
}

/// Fires when the noise value lands in `[lo, hi)` and places a neutral unit,
/// provided the cell's terrain carries the required tags and is empty.
pub fn resource_hook(
    unit_type: Arc<UnitType>,
    lo: f64,
    hi: f64,
    required_tags: HashSet<String>,
) -> CellHook {
    Box::new(move |map, xy, value| {
        if !(lo <= value && value < hi) {
            return Ok(());
        }
        let suitable = map
            .terrain_at(xy)?
            .is_some_and(|terrain| required_tags.is_subset(&terrain.tags));
        if suitable && map.unit_at(xy)?.is_none() {
            map.create_unit(xy, &unit_type, None)?;
        }
        Ok(())
    })
}

/// Places the player's starting unit on the buildable cell nearest the base
/// position.
pub fn player_unit_hook(unit_type: Arc<UnitType>) -> PlayerHook {
    let required: HashSet<String> = std::iter::once("build".to_string()).collect();
    Box::new(move |map, player, base| {
        let spot = find_spot(map, base, &required)?;
        map.create_unit(spot, &unit_type, Some(player))?;
        Ok(())
    })
}

/// The nearest empty cell around `origin` whose terrain carries the tags.
fn find_spot(
    map: &Arc<Map>,
    origin: (u32, u32),
    required_tags: &HashSet<String>,
) -> Result<(u32, u32), GameError> {
    for xy in vicinity(origin, map.width, map.height) {
        let suitable = map
            .terrain_at(xy)?
            .is_some_and(|terrain| required_tags.is_subset(&terrain.tags));
        if suitable && map.unit_at(xy)?.is_none() {
            return Ok(xy);
        }
    }
    Err(GameError::rule("No space to place unit"))
}

/// The built-in world recipe: a uniform-noise terrain pass, a uniform-noise
/// resource pass restricted to buildable ground, and a city per player.
pub fn default_generator(rules: &crate::rules::Rules) -> Generator {
    let grass = Arc::clone(rules.terrain_named("grass").expect("default catalog"));
    let mountain = Arc::clone(rules.terrain_named("mountain").expect("default catalog"));
    let water = Arc::clone(rules.terrain_named("water").expect("default catalog"));
    let forest = Arc::clone(rules.unit_type_named("forest").expect("default catalog"));
    let quarry = Arc::clone(rules.unit_type_named("quarry").expect("default catalog"));
    let city = Arc::clone(rules.unit_type_named("city").expect("default catalog"));

    let build: HashSet<String> = std::iter::once("build".to_string()).collect();
    let params = NoiseParams {
        scale_x: 100.0,
        scale_y: 100.0,
        distribution: Distribution::Uniform,
        ..NoiseParams::default()
    };

    let mut terrain = NoisePass::new(params.clone());
    terrain.add_hook(terrain_hook(grass, 0.0, 0.5));
    terrain.add_hook(terrain_hook(mountain, 0.5, 0.6));
    terrain.add_hook(terrain_hook(water, 0.6, 2.0));

    let mut resources = NoisePass::new(NoiseParams {
        seed: 1,
        ..params
    });
    resources.add_hook(resource_hook(forest, 0.0, 0.05, build.clone()));
    resources.add_hook(resource_hook(quarry, 0.2, 0.25, build));

    let mut bases = PlayerBasePass::new();
    bases.add_hook(player_unit_hook(city));

    let mut generator = Generator::new();
    generator.add_pass(Pass::Noise(terrain));
    generator.add_pass(Pass::Noise(resources));
    generator.add_pass(Pass::PlayerBases(bases));
    generator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Rules, default_rules};
    use tokio::sync::mpsc;

    fn players_registry(rules: &Rules, count: u32) -> Arc<Mutex<IdRegistry<Arc<Player>>>> {
        let players = Arc::new(Mutex::new(IdRegistry::new()));
        {
            let mut registry = lock(&players);
            for index in 0..count {
                let (tx, _rx) = mpsc::unbounded_channel();
                registry.insert_with(|id| {
                    Arc::new(Player::new(id, format!("player-{index}"), tx, rules))
                });
            }
        }
        players
    }

    #[test]
    fn gaussian_cdf_is_a_monotonic_map_onto_the_unit_interval() {
        assert!((gaussian_cdf(0.0, 0.0, NOISE_SIGMA) - 0.5).abs() < 1e-12);
        let mut previous = 0.0;
        for step in -40..=40 {
            let value = gaussian_cdf(f64::from(step) * 0.05, 0.0, NOISE_SIGMA);
            assert!((0.0..=1.0).contains(&value));
            assert!(value >= previous);
            previous = value;
        }
    }

    #[test]
    fn map_size_scales_with_the_player_count() {
        let rules = default_rules();
        let generator = default_generator(&rules);

        let (map, _events) = generator
            .generate(players_registry(&rules, 1))
            .expect("generate");
        assert_eq!((map.width, map.height), (20, 20));

        let (map, _events) = generator
            .generate(players_registry(&rules, 2))
            .expect("generate");
        assert_eq!((map.width, map.height), (29, 29));
    }

    #[test]
    fn generation_announces_the_map_then_paints_every_cell() {
        let rules = default_rules();
        let generator = default_generator(&rules);
        let (map, mut events) = generator
            .generate(players_registry(&rules, 1))
            .expect("generate");

        match events.try_recv() {
            Ok(MapEvent::Generated { width, height }) => {
                assert_eq!((width, height), (20, 20));
            }
            other => panic!("expected Generated first, got {other:?}"),
        }
        let mut painted = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, MapEvent::CellTerrain { .. }) {
                painted += 1;
            }
        }
        assert_eq!(painted, 400);
        for y in 0..map.height {
            for x in 0..map.width {
                assert!(map.terrain_at((x, y)).expect("in bounds").is_some());
            }
        }
    }

    #[test]
    fn every_player_gets_a_base_on_buildable_ground() {
        let rules = default_rules();
        let generator = default_generator(&rules);
        let (map, _events) = generator
            .generate(players_registry(&rules, 3))
            .expect("generate");

        let mut owners = Vec::new();
        for unit in map.units() {
            let Some(player) = unit.player() else {
                continue;
            };
            assert_eq!(unit.unit_type.name, "city");
            let position = map.location_of(&unit).expect("on the map");
            let terrain = map
                .terrain_at(position)
                .expect("in bounds")
                .expect("painted");
            assert!(terrain.tags.contains("build"));
            owners.push(player.id);
        }
        owners.sort_unstable();
        assert_eq!(owners, vec![1, 2, 3]);
    }

    #[test]
    fn resource_units_respect_the_terrain_tag_filter() {
        let rules = default_rules();
        let generator = default_generator(&rules);
        let (map, _events) = generator
            .generate(players_registry(&rules, 2))
            .expect("generate");

        for unit in map.units() {
            if unit.player().is_some() {
                continue;
            }
            let position = map.location_of(&unit).expect("on the map");
            let terrain = map
                .terrain_at(position)
                .expect("in bounds")
                .expect("painted");
            assert!(
                terrain.tags.contains("build"),
                "{} on non-buildable terrain {}",
                unit.unit_type.name,
                terrain.name
            );
        }
    }

    #[test]
    fn a_world_without_buildable_ground_cannot_place_bases() {
        let rules = default_rules();
        let water = Arc::clone(rules.terrain_named("water").expect("water"));
        let city = Arc::clone(rules.unit_type_named("city").expect("city"));

        let mut terrain = NoisePass::new(NoiseParams {
            distribution: Distribution::Uniform,
            ..NoiseParams::default()
        });
        terrain.add_hook(terrain_hook(water, 0.0, 2.0));
        let mut bases = PlayerBasePass::new();
        bases.add_hook(player_unit_hook(city));

        let mut generator = Generator::new();
        generator.add_pass(Pass::Noise(terrain));
        generator.add_pass(Pass::PlayerBases(bases));

        let err = generator
            .generate(players_registry(&rules, 1))
            .expect_err("no buildable cell anywhere");
        assert_eq!(err.to_string(), "No space to place unit");
    }
}
