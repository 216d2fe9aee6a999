//! Core simulation engine for the HexColony foraging simulation.
//!
//! The engine models ants foraging on an offset hexagonal grid: agents walk
//! the grid, pick food up, lay pheromone trails, and carry food back to
//! nests. Everything here is deterministic for a fixed seed: all randomness
//! flows through a single [`SmallRng`] owned by the [`Colony`], and agents
//! are processed strictly in spawn order within a tick. Rendering and
//! interactive drivers live outside this crate and consume the public
//! query/command surface only.

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

new_key_type! {
    /// Stable handle for nests.
    pub struct NestId;
}

/// Number of perceived cell properties: food, positive, negative, forage,
/// nest membership.
pub const SAMPLE_SIZE: usize = 5;

/// One of the six discrete headings on the offset hexagonal grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    UpLeft,
    Up,
    UpRight,
    DownRight,
    Down,
    DownLeft,
}

/// Coordinate deltas for cells on even rows, indexed by direction.
const DELTAS_EVEN: [(i32, i32); 6] = [(-1, -1), (-2, 0), (-1, 0), (1, 0), (2, 0), (1, -1)];
/// Coordinate deltas for cells on odd rows.
const DELTAS_ODD: [(i32, i32); 6] = [(-1, 0), (-2, 0), (-1, 1), (1, 1), (2, 0), (1, 0)];

impl Direction {
    /// All six directions in wheel order.
    pub const ALL: [Direction; 6] = [
        Direction::UpLeft,
        Direction::Up,
        Direction::UpRight,
        Direction::DownRight,
        Direction::Down,
        Direction::DownLeft,
    ];

    /// Rotate by `offset` positions around the six-direction wheel.
    #[must_use]
    pub fn rotated(self, offset: i32) -> Self {
        let index = (self as i32 + offset).rem_euclid(6) as usize;
        Self::ALL[index]
    }

    /// The opposite heading (a half turn, three wheel positions).
    #[must_use]
    pub fn reversed(self) -> Self {
        self.rotated(3)
    }
}

/// Offset hexagonal coordinate. May reference a position outside any grid;
/// geometry helpers never validate bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hex {
    pub x: i32,
    pub y: i32,
}

impl Hex {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The adjacent coordinate one step in `direction`. Adjacency depends on
    /// the parity of `x`, hence the two delta tables.
    #[must_use]
    pub fn neighbor(self, direction: Direction) -> Self {
        let table = if self.x.rem_euclid(2) == 0 {
            &DELTAS_EVEN
        } else {
            &DELTAS_ODD
        };
        let (dx, dy) = table[direction as usize];
        Self::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Number of hex cells within `radius` steps of a center, center included.
#[must_use]
pub const fn hex_area(radius: u32) -> u64 {
    let r = radius as u64;
    3 * r * (r + 1) + 1
}

/// Terrain classification of a grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CellKind {
    #[default]
    Empty,
    Wall,
    Nest,
}

/// State of one hexagonal grid location.
///
/// Pheromone channels stay within `[0, 1]`; deposits are capped and decay
/// only ever shrinks them. A `Wall` cell never holds food.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Cell {
    pub kind: CellKind,
    pub food: f32,
    pub positive: f32,
    pub negative: f32,
    pub forage: f32,
    /// Back-link to the owning nest, when part of a nest footprint.
    pub nest: Option<NestId>,
    /// 1.0 when part of a nest footprint, 0.0 otherwise. Kept as a scalar
    /// because it feeds directly into the perception sample vector.
    pub nest_value: f32,
}

impl Cell {
    /// Remove up to `amount` food, returning how much was actually taken.
    pub fn take_food(&mut self, amount: f32) -> f32 {
        let taken = amount.min(self.food).max(0.0);
        self.food -= taken;
        taken
    }

    pub fn add_food(&mut self, amount: f32) {
        self.food += amount.max(0.0);
    }

    /// Apply one tick of exponential decay to the three pheromone channels.
    pub fn decay(&mut self, rates: PheromoneDecay) {
        self.positive *= 1.0 - rates.positive;
        self.negative *= 1.0 - rates.negative;
        self.forage *= 1.0 - rates.forage;
    }
}

/// Per-channel exponential decay rates applied after every tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PheromoneDecay {
    pub positive: f32,
    pub negative: f32,
    pub forage: f32,
}

impl Default for PheromoneDecay {
    fn default() -> Self {
        Self {
            positive: 0.05,
            negative: 0.3,
            forage: 0.2,
        }
    }
}

/// Pheromone amounts deposited by agents. Empirically chosen values carried
/// over from the reference behavior; kept configurable rather than fixed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PheromoneDeposits {
    /// Laid on open ground by foraging agents.
    pub forage: f32,
    /// Laid on open ground by returning agents.
    pub positive: f32,
    /// Laid when the agent is congested, regardless of state.
    pub negative: f32,
}

impl Default for PheromoneDeposits {
    fn default() -> Self {
        Self {
            forage: 0.4,
            positive: 0.6,
            negative: 0.5,
        }
    }
}

/// Coefficients combining perceived cell properties into one attraction
/// score. Which coefficients apply depends on the agent state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AttractorWeights {
    pub food: f32,
    pub nest: f32,
    pub positive: f32,
    pub negative: f32,
    pub forage: f32,
}

impl Default for AttractorWeights {
    fn default() -> Self {
        Self {
            food: 20.0,
            nest: 20.0,
            positive: 12.0,
            negative: -10.0,
            forage: 12.0,
        }
    }
}

/// Fixed behavioral parameter set assigned to every spawned agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentParams {
    /// Maximum food an agent can carry.
    pub capacity: f32,
    /// Variance of the Gaussian field-of-view kernel over direction offsets.
    pub fov_variance: f32,
    /// Maximum raycast length for perceptual sampling, in steps.
    pub perception_range: u32,
    /// Exponential falloff rate over steps-from-self for perception samples.
    pub perception_falloff: f32,
    pub attractors: AttractorWeights,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            capacity: 0.5,
            fov_variance: 0.6,
            perception_range: 6,
            perception_falloff: 0.15,
            attractors: AttractorWeights::default(),
        }
    }
}

/// Errors raised when constructing a colony from configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Failure modes for placement commands. Callers decide whether to retry
/// elsewhere; nothing here is fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("position {0} is outside the grid")]
    OutOfBounds(Hex),
    #[error("position {0} is a wall")]
    Blocked(Hex),
    #[error("position {0} already holds an agent")]
    Occupied(Hex),
}

/// Static configuration for a colony simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColonyConfig {
    /// Grid extent along the x axis.
    pub width: u32,
    /// Grid extent along the y axis.
    pub height: u32,
    /// Noise samples above this value become walls during terrain
    /// generation.
    pub wall_threshold: f64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    pub decay: PheromoneDecay,
    pub deposits: PheromoneDeposits,
    /// An agent with more free neighbor directions than this deposits trail
    /// pheromone; at or below it deposits congestion pheromone.
    pub congestion_threshold: usize,
    /// Behavioral parameters assigned to newly spawned agents.
    pub agent: AgentParams,
    /// Maximum number of recent tick summaries retained; 0 disables history.
    pub history_capacity: usize,
}

impl Default for ColonyConfig {
    fn default() -> Self {
        Self {
            width: 100,
            height: 100,
            wall_threshold: 0.5,
            rng_seed: None,
            decay: PheromoneDecay::default(),
            deposits: PheromoneDeposits::default(),
            congestion_threshold: 2,
            agent: AgentParams::default(),
            history_capacity: 256,
        }
    }
}

impl ColonyConfig {
    /// Validates the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        if !self.wall_threshold.is_finite() {
            return Err(ConfigError::InvalidConfig("wall_threshold must be finite"));
        }
        let rates = [self.decay.positive, self.decay.negative, self.decay.forage];
        if rates.iter().any(|r| !(0.0..=1.0).contains(r)) {
            return Err(ConfigError::InvalidConfig(
                "pheromone decay rates must lie in [0, 1]",
            ));
        }
        let deposits = [
            self.deposits.forage,
            self.deposits.positive,
            self.deposits.negative,
        ];
        if deposits.iter().any(|d| !(0.0..=1.0).contains(d)) {
            return Err(ConfigError::InvalidConfig(
                "pheromone deposits must lie in [0, 1]",
            ));
        }
        if !(self.agent.capacity > 0.0) || !self.agent.capacity.is_finite() {
            return Err(ConfigError::InvalidConfig(
                "agent capacity must be positive",
            ));
        }
        if !(self.agent.fov_variance > 0.0) {
            return Err(ConfigError::InvalidConfig(
                "fov_variance must be positive",
            ));
        }
        if self.agent.perception_range == 0 {
            return Err(ConfigError::InvalidConfig(
                "perception_range must be at least one step",
            ));
        }
        if self.agent.perception_falloff < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "perception_falloff must be non-negative",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Injected deterministic 2D noise source used once for terrain
/// thresholding. Implementations must be continuous and reproducible per
/// configuration; the sampling domain is the unit square.
pub trait TerrainNoise {
    fn sample(&self, u: f64, v: f64) -> f64;
}

impl<F> TerrainNoise for F
where
    F: Fn(f64, f64) -> f64,
{
    fn sample(&self, u: f64, v: f64) -> f64 {
        self(u, v)
    }
}

/// The hexagonal cell grid: cell storage plus the geometry primitives that
/// operate on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    width: i32,
    height: i32,
    cells: Vec<Cell>,
}

impl Grid {
    fn new(width: u32, height: u32) -> Self {
        let cells = vec![Cell::default(); (width as usize) * (height as usize)];
        Self {
            width: width as i32,
            height: height as i32,
            cells,
        }
    }

    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    #[inline]
    fn offset(&self, position: Hex) -> usize {
        (position.x as usize) * (self.height as usize) + (position.y as usize)
    }

    #[must_use]
    pub fn in_bounds(&self, position: Hex) -> bool {
        position.x >= 0 && position.x < self.width && position.y >= 0 && position.y < self.height
    }

    /// In bounds and not a wall.
    #[must_use]
    pub fn is_passable(&self, position: Hex) -> bool {
        self.cell(position)
            .map_or(false, |cell| cell.kind != CellKind::Wall)
    }

    #[must_use]
    pub fn cell(&self, position: Hex) -> Option<&Cell> {
        if self.in_bounds(position) {
            let idx = self.offset(position);
            Some(&self.cells[idx])
        } else {
            None
        }
    }

    #[must_use]
    pub fn cell_mut(&mut self, position: Hex) -> Option<&mut Cell> {
        if self.in_bounds(position) {
            let idx = self.offset(position);
            Some(&mut self.cells[idx])
        } else {
            None
        }
    }

    /// Walk up to `max_steps` cells from `origin` in `direction`, returning
    /// the visited coordinates in order. With `stop_at_wall` the walk ends
    /// before the first out-of-bounds or wall cell; without it, exactly
    /// `max_steps` coordinates are produced regardless of terrain (geometry
    /// construction only, never perception).
    #[must_use]
    pub fn raycast(
        &self,
        origin: Hex,
        direction: Direction,
        max_steps: u32,
        stop_at_wall: bool,
    ) -> Vec<Hex> {
        let mut ray = Vec::with_capacity(max_steps as usize);
        let mut cursor = origin;
        for _ in 0..max_steps {
            let next = cursor.neighbor(direction);
            if stop_at_wall && !self.is_passable(next) {
                break;
            }
            ray.push(next);
            cursor = next;
        }
        ray
    }

    /// All hex cells within `radius` steps of `center`, center included.
    ///
    /// Built by walking six spokes outward one ring at a time and filling
    /// the edges between consecutive spoke tips with terrain-blind raycasts.
    /// Always yields exactly `hex_area(radius)` distinct coordinates; the
    /// result may include out-of-bounds positions, which consumers filter.
    #[must_use]
    pub fn ring_area(&self, center: Hex, radius: u32) -> Vec<Hex> {
        let mut positions = vec![center];
        let mut tips = [center; 6];
        for ring in 0..radius {
            for (slot, dir) in Direction::ALL.iter().enumerate() {
                tips[slot] = tips[slot].neighbor(*dir);
            }
            let edge = ring;
            let up_left = tips[Direction::UpLeft as usize];
            let up_right = tips[Direction::UpRight as usize];
            let down_right = tips[Direction::DownRight as usize];
            let down_left = tips[Direction::DownLeft as usize];
            positions.extend(self.raycast(up_left, Direction::UpRight, edge, false));
            positions.extend(self.raycast(up_left, Direction::Down, edge, false));
            positions.extend(self.raycast(up_right, Direction::UpLeft, edge, false));
            positions.extend(self.raycast(up_right, Direction::Down, edge, false));
            positions.extend(self.raycast(down_right, Direction::DownLeft, edge, false));
            positions.extend(self.raycast(down_left, Direction::DownRight, edge, false));
            positions.extend_from_slice(&tips);
        }
        positions
    }

    /// Whether every cell within `radius` of `center` is passable.
    #[must_use]
    pub fn ring_is_clear(&self, center: Hex, radius: u32) -> bool {
        self.ring_area(center, radius)
            .into_iter()
            .all(|pos| self.is_passable(pos))
    }

    /// Threshold the injected noise field into walls. Cells already part of
    /// a nest footprint keep their kind; cells turned into walls drop any
    /// food they held.
    pub fn generate_terrain<N: TerrainNoise + ?Sized>(&mut self, noise: &N, threshold: f64) {
        let (width, height) = (self.width, self.height);
        for x in 0..width {
            for y in 0..height {
                let sample = noise.sample(f64::from(x) / f64::from(width), f64::from(y) / f64::from(height));
                if sample > threshold {
                    let idx = self.offset(Hex::new(x, y));
                    let cell = &mut self.cells[idx];
                    if cell.kind == CellKind::Empty {
                        cell.kind = CellKind::Wall;
                        cell.food = 0.0;
                    }
                }
            }
        }
    }

    /// Uniformly sample a non-wall cell, giving up after `max_attempts`.
    #[must_use]
    pub fn random_free_cell(&self, rng: &mut SmallRng, max_attempts: u32) -> Option<Hex> {
        for _ in 0..max_attempts {
            let candidate = Hex::new(
                rng.random_range(0..self.width),
                rng.random_range(0..self.height),
            );
            if self.is_passable(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Sample a non-wall cell whose entire surrounding ring of `radius` is
    /// passable. Bounded retry; `None` after `max_attempts`.
    #[must_use]
    pub fn random_clear_ring(
        &self,
        rng: &mut SmallRng,
        radius: u32,
        max_attempts: u32,
    ) -> Option<Hex> {
        for _ in 0..max_attempts {
            let candidate = Hex::new(
                rng.random_range(0..self.width),
                rng.random_range(0..self.height),
            );
            if self.is_passable(candidate) && self.ring_is_clear(candidate, radius) {
                return Some(candidate);
            }
        }
        None
    }

    /// Scatter unit food over the ring around `center`: each in-bounds,
    /// non-wall cell independently gains one unit with probability
    /// `density`.
    pub fn add_food_cluster(
        &mut self,
        rng: &mut SmallRng,
        center: Hex,
        radius: u32,
        density: f64,
    ) {
        let density = density.clamp(0.0, 1.0);
        for pos in self.ring_area(center, radius) {
            if !self.is_passable(pos) {
                continue;
            }
            if rng.random::<f64>() < density {
                if let Some(cell) = self.cell_mut(pos) {
                    cell.add_food(1.0);
                }
            }
        }
    }

    /// Apply one tick of pheromone decay to every cell. Cells are
    /// independent, so this runs in parallel.
    pub fn decay_all(&mut self, rates: PheromoneDecay) {
        self.cells.par_iter_mut().for_each(|cell| cell.decay(rates));
    }

    /// Sum of food held by all cells.
    #[must_use]
    pub fn total_food(&self) -> f32 {
        self.cells.iter().map(|cell| cell.food).sum()
    }
}

/// A nest: a footprint of grid cells and an accumulator for delivered food.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nest {
    center: Hex,
    footprint: Vec<Hex>,
    food: f32,
}

impl Nest {
    fn new(center: Hex, footprint: Vec<Hex>) -> Self {
        Self {
            center,
            footprint,
            food: 0.0,
        }
    }

    #[must_use]
    pub const fn center(&self) -> Hex {
        self.center
    }

    #[must_use]
    pub fn footprint(&self) -> &[Hex] {
        &self.footprint
    }

    /// Accumulated food. Monotonically non-decreasing.
    #[must_use]
    pub const fn food(&self) -> f32 {
        self.food
    }

    pub fn add_food(&mut self, amount: f32) {
        self.food += amount.max(0.0);
    }
}

/// Behavioral state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgentState {
    /// Searching for food, attracted by food and success trails.
    #[default]
    Foraging,
    /// Carrying food home, attracted by outbound trails and nest cells.
    Returning,
}

/// Mobile foraging entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub position: Hex,
    pub heading: Direction,
    pub state: AgentState,
    pub carried: f32,
    pub params: AgentParams,
}

/// Dense agent storage addressed by generational handles.
///
/// Iteration follows insertion order, which doubles as the fixed processing
/// order within a tick; that ordering is load-bearing for reproducibility.
#[derive(Debug, Default)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    agents: Vec<Agent>,
}

impl AgentArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: AgentId) -> Option<&Agent> {
        let index = *self.slots.get(id)?;
        self.agents.get(index)
    }

    fn get_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        let index = *self.slots.get(id)?;
        self.agents.get_mut(index)
    }

    fn insert(&mut self, agent: Agent) -> AgentId {
        let index = self.agents.len();
        self.agents.push(agent);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Handles in spawn order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Agents with their handles, in spawn order.
    pub fn iter(&self) -> impl Iterator<Item = (AgentId, &Agent)> {
        self.handles.iter().copied().zip(self.agents.iter())
    }
}

/// Gaussian kernel over signed direction offsets, parametrized by variance.
fn gaussian_weight(x: f32, variance: f32) -> f32 {
    (-x * x / (2.0 * variance)).exp() / (std::f32::consts::TAU * variance).sqrt()
}

/// Exponential falloff over steps-from-self.
fn exp_falloff(step: f32, rate: f32) -> f32 {
    (-step * rate).exp()
}

/// In-place softmax. Shifts by the maximum so large attraction scores
/// cannot overflow.
fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let mut sum = 0.0;
    for value in values.iter_mut() {
        *value = (*value - max).exp();
        sum += *value;
    }
    if sum > 0.0 {
        for value in values.iter_mut() {
            *value /= sum;
        }
    }
}

/// Scale `values` to sum to one. Returns false when the sum is not a
/// positive finite number, leaving the slice untouched.
fn normalize_in_place(values: &mut [f32]) -> bool {
    let sum: f32 = values.iter().sum();
    if !(sum > 0.0) || !sum.is_finite() {
        return false;
    }
    for value in values.iter_mut() {
        *value /= sum;
    }
    true
}

/// Monotonic tick counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Tick(pub u64);

impl Tick {
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Aggregate state sampled after each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub agent_count: usize,
    /// Food currently carried by agents.
    pub carried_total: f32,
    /// Food accumulated across all nests.
    pub nest_food_total: f32,
    /// Food remaining on the grid.
    pub cell_food_total: f32,
}

/// Outcome of a bulk spawn command. Spawning fewer agents than requested is
/// a reported partial result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnReport {
    pub requested: usize,
    pub spawned: usize,
}

/// Public read model for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub position: Hex,
    pub heading: Direction,
    pub state: AgentState,
    pub carried: f32,
}

/// Public read model for one nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestSnapshot {
    pub id: NestId,
    pub center: Hex,
    pub food: f32,
    pub footprint: Vec<Hex>,
}

/// The orchestrator: owns the grid, the agent arena, the nests, the
/// occupancy map, and the RNG, and drives the per-tick pipeline.
pub struct Colony {
    config: ColonyConfig,
    grid: Grid,
    agents: AgentArena,
    nests: SlotMap<NestId, Nest>,
    occupancy: HashMap<Hex, u32>,
    rng: SmallRng,
    tick: Tick,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for Colony {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Colony")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.agents.len())
            .field("nest_count", &self.nests.len())
            .finish()
    }
}

impl Colony {
    /// Instantiate a colony on an open (wall-free) grid from the supplied
    /// configuration.
    pub fn new(config: ColonyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let grid = Grid::new(config.width, config.height);
        let history_capacity = config.history_capacity;
        Ok(Self {
            grid,
            config,
            agents: AgentArena::new(),
            nests: SlotMap::with_key(),
            occupancy: HashMap::new(),
            rng,
            tick: Tick::zero(),
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &ColonyConfig {
        &self.config
    }

    /// Read-only access to the grid.
    #[must_use]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Mutable access to the grid (for scenario setup and drivers).
    #[must_use]
    pub fn grid_mut(&mut self) -> &mut Grid {
        &mut self.grid
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only access to the agent arena.
    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.agents
    }

    #[must_use]
    pub fn nest(&self, id: NestId) -> Option<&Nest> {
        self.nests.get(id)
    }

    /// Whether any agent currently occupies `position`.
    #[must_use]
    pub fn is_occupied(&self, position: Hex) -> bool {
        self.occupancy.contains_key(&position)
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Snapshot of every agent, in spawn order.
    #[must_use]
    pub fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        self.agents
            .iter()
            .map(|(id, agent)| AgentSnapshot {
                id,
                position: agent.position,
                heading: agent.heading,
                state: agent.state,
                carried: agent.carried,
            })
            .collect()
    }

    /// Snapshot of every nest.
    #[must_use]
    pub fn nest_snapshots(&self) -> Vec<NestSnapshot> {
        self.nests
            .iter()
            .map(|(id, nest)| NestSnapshot {
                id,
                center: nest.center(),
                food: nest.food(),
                footprint: nest.footprint().to_vec(),
            })
            .collect()
    }

    /// Threshold the injected noise source into wall terrain, using the
    /// configured threshold. Intended to run before placement commands.
    pub fn generate_terrain<N: TerrainNoise + ?Sized>(&mut self, noise: &N) {
        let threshold = self.config.wall_threshold;
        self.grid.generate_terrain(noise, threshold);
    }

    /// Uniformly sample a non-wall cell, giving up after `max_attempts`.
    #[must_use]
    pub fn random_free_cell(&mut self, max_attempts: u32) -> Option<Hex> {
        self.grid.random_free_cell(&mut self.rng, max_attempts)
    }

    /// Sample a cell whose surrounding ring of `radius` is fully passable.
    #[must_use]
    pub fn random_clear_ring(&mut self, radius: u32, max_attempts: u32) -> Option<Hex> {
        self.grid.random_clear_ring(&mut self.rng, radius, max_attempts)
    }

    /// Scatter unit food over the ring around `center` with per-cell
    /// probability `density`.
    pub fn add_food_cluster(&mut self, center: Hex, radius: u32, density: f64) {
        self.grid
            .add_food_cluster(&mut self.rng, center, radius, density);
    }

    /// Mark the ring around `center` as a nest footprint and register the
    /// nest. Out-of-bounds ring positions are dropped from the footprint.
    pub fn place_nest(&mut self, center: Hex, radius: u32) -> Result<NestId, PlacementError> {
        if !self.grid.in_bounds(center) {
            return Err(PlacementError::OutOfBounds(center));
        }
        let footprint: Vec<Hex> = self
            .grid
            .ring_area(center, radius)
            .into_iter()
            .filter(|pos| self.grid.in_bounds(*pos))
            .collect();
        let id = self.nests.insert(Nest::new(center, footprint.clone()));
        for pos in &footprint {
            if let Some(cell) = self.grid.cell_mut(*pos) {
                cell.kind = CellKind::Nest;
                cell.nest = Some(id);
                cell.nest_value = 1.0;
            }
        }
        Ok(id)
    }

    /// Spawn a single agent at a validated free position.
    pub fn spawn_agent_at(&mut self, position: Hex) -> Result<AgentId, PlacementError> {
        if !self.grid.in_bounds(position) {
            return Err(PlacementError::OutOfBounds(position));
        }
        if !self.grid.is_passable(position) {
            return Err(PlacementError::Blocked(position));
        }
        if self.occupancy.contains_key(&position) {
            return Err(PlacementError::Occupied(position));
        }
        let heading = Direction::ALL[self.rng.random_range(0..Direction::ALL.len())];
        let id = self.agents.insert(Agent {
            position,
            heading,
            state: AgentState::Foraging,
            carried: 0.0,
            params: self.config.agent,
        });
        self.occupy(position);
        Ok(id)
    }

    /// Spawn up to `count` agents on free cells around `center`.
    ///
    /// When `radius` is unset, the minimal radius whose hex area holds
    /// `count / density` cells is derived. The ring expands until enough
    /// free cells exist, unless `strict` is set, in which case only the
    /// agents that fit are spawned and the shortfall shows in the report.
    /// Expansion is bounded by the grid extent, so the search always
    /// terminates.
    pub fn spawn_agents_around(
        &mut self,
        count: usize,
        center: Hex,
        radius: Option<u32>,
        density: f64,
        strict: bool,
    ) -> SpawnReport {
        let density = if density > 0.0 { density.min(1.0) } else { 1.0 };
        let mut radius = radius.unwrap_or_else(|| {
            let desired = (count as f64 / density).floor() as u64;
            let mut derived = 0;
            while hex_area(derived) <= desired {
                derived += 1;
            }
            derived
        });
        let max_radius = self.grid.width().max(self.grid.height()) as u32;

        let free_positions = loop {
            let free: Vec<Hex> = self
                .grid
                .ring_area(center, radius)
                .into_iter()
                .filter(|pos| self.position_free(*pos))
                .collect();
            if free.len() >= count || strict || radius >= max_radius {
                break free;
            }
            radius += 1;
        };

        let target = count.min(free_positions.len());
        let picks = rand::seq::index::sample(&mut self.rng, free_positions.len(), target);
        let mut spawned = 0;
        for index in picks.iter() {
            if self.spawn_agent_at(free_positions[index]).is_ok() {
                spawned += 1;
            }
        }
        SpawnReport {
            requested: count,
            spawned,
        }
    }

    /// Advance the simulation one tick: run every agent's decision pass in
    /// spawn order, then decay the grid, then record a summary.
    pub fn step(&mut self) -> TickSummary {
        let order: Vec<AgentId> = self.agents.iter_handles().collect();
        for id in order {
            self.step_agent(id);
        }
        self.grid.decay_all(self.config.decay);
        self.tick = self.tick.next();
        let summary = self.summarize();
        if self.config.history_capacity > 0 {
            if self.history.len() >= self.config.history_capacity {
                let _ = self.history.pop_front();
            }
            self.history.push_back(summary.clone());
        }
        summary
    }

    fn summarize(&self) -> TickSummary {
        let carried_total = self.agents.iter().map(|(_, agent)| agent.carried).sum();
        let nest_food_total = self.nests.values().map(Nest::food).sum();
        TickSummary {
            tick: self.tick,
            agent_count: self.agents.len(),
            carried_total,
            nest_food_total,
            cell_food_total: self.grid.total_food(),
        }
    }

    /// One agent's full decision pass for the current tick.
    fn step_agent(&mut self, id: AgentId) {
        let (mut position, mut heading, mut state, carried_before, params) = match self
            .agents
            .get(id)
        {
            Some(agent) => (
                agent.position,
                agent.heading,
                agent.state,
                agent.carried,
                agent.params,
            ),
            None => return,
        };
        let mut carried = carried_before;
        let origin = position;

        // Pickup / delivery happens before movement.
        match state {
            AgentState::Foraging => {
                if let Some(cell) = self.grid.cell_mut(origin) {
                    if cell.food > 0.0 {
                        carried += cell.take_food(params.capacity - carried);
                        if carried >= params.capacity {
                            heading = heading.reversed();
                            state = AgentState::Returning;
                        }
                    }
                }
            }
            AgentState::Returning => {
                let nest_id = self.grid.cell(origin).and_then(|cell| cell.nest);
                if let Some(nest_id) = nest_id {
                    if let Some(nest) = self.nests.get_mut(nest_id) {
                        nest.add_food(carried);
                    }
                    carried = 0.0;
                    state = AgentState::Foraging;
                }
            }
        }

        // Candidate directions: the six distinct residues of the span
        // heading-3..heading+3, restricted to passable neighbors.
        let mut dirs: Vec<Direction> = Vec::with_capacity(6);
        let mut targets: Vec<Hex> = Vec::with_capacity(6);
        let mut fov: Vec<f32> = Vec::with_capacity(6);
        for offset in -3i32..3 {
            let dir = heading.rotated(offset);
            let target = position.neighbor(dir);
            if self.grid.is_passable(target) {
                dirs.push(dir);
                targets.push(target);
                fov.push(gaussian_weight(offset as f32, params.fov_variance));
            }
        }

        let free: Vec<bool> = targets
            .iter()
            .map(|target| !self.occupancy.contains_key(target))
            .collect();
        let free_count = free.iter().filter(|is_free| **is_free).count();

        if free_count == 0 {
            // Boxed in: re-aim from the field-of-view weights alone, stay
            // put. With no candidates at all the heading is kept.
            if !dirs.is_empty() {
                let mut weights = fov.clone();
                if normalize_in_place(&mut weights) {
                    if let Ok(dist) = WeightedIndex::new(weights.iter().copied()) {
                        heading = dirs[dist.sample(&mut self.rng)];
                    }
                }
            }
        } else {
            // Attraction scores, occupancy-masked before the softmax.
            let attractor = attractor_vector(state, params.attractors);
            let mut weights: Vec<f32> = dirs
                .iter()
                .zip(free.iter())
                .map(|(dir, is_free)| {
                    if !is_free {
                        return 0.0;
                    }
                    let sample = self.perceive(position, *dir, &params);
                    sample
                        .iter()
                        .zip(attractor.iter())
                        .map(|(value, weight)| value * weight)
                        .sum()
                })
                .collect();
            softmax_in_place(&mut weights);
            for (weight, fov_weight) in weights.iter_mut().zip(fov.iter()) {
                *weight *= fov_weight;
            }
            if normalize_in_place(&mut weights) {
                if let Ok(dist) = WeightedIndex::new(weights.iter().copied()) {
                    let choice = dist.sample(&mut self.rng);
                    heading = dirs[choice];
                    let destination = targets[choice];
                    self.vacate(position);
                    self.occupy(destination);
                    position = destination;
                }
            }
        }

        // Trail deposit lands on the tick-start cell.
        let deposits = self.config.deposits;
        let congested = free_count <= self.config.congestion_threshold;
        if let Some(cell) = self.grid.cell_mut(origin) {
            if congested {
                cell.negative = (cell.negative + deposits.negative).min(1.0);
            } else {
                match state {
                    AgentState::Foraging => cell.forage = (cell.forage + deposits.forage).min(1.0),
                    AgentState::Returning => {
                        cell.positive = (cell.positive + deposits.positive).min(1.0)
                    }
                }
            }
        }

        if let Some(agent) = self.agents.get_mut(id) {
            agent.position = position;
            agent.heading = heading;
            agent.state = state;
            agent.carried = carried;
        }
    }

    /// Reduce one perception ray to a single weighted sample vector.
    fn perceive(&self, origin: Hex, direction: Direction, params: &AgentParams) -> [f32; SAMPLE_SIZE] {
        let ray = self
            .grid
            .raycast(origin, direction, params.perception_range, true);
        if ray.is_empty() {
            return [0.0; SAMPLE_SIZE];
        }
        let mut falloff: Vec<f32> = (0..ray.len())
            .map(|step| exp_falloff(step as f32, params.perception_falloff))
            .collect();
        let _ = normalize_in_place(&mut falloff);
        let mut sample = [0.0; SAMPLE_SIZE];
        for (pos, weight) in ray.iter().zip(falloff.iter()) {
            if let Some(cell) = self.grid.cell(*pos) {
                sample[0] += cell.food * weight;
                sample[1] += cell.positive * weight;
                sample[2] += cell.negative * weight;
                sample[3] += cell.forage * weight;
                sample[4] += cell.nest_value * weight;
            }
        }
        sample
    }

    fn position_free(&self, position: Hex) -> bool {
        self.grid.is_passable(position) && !self.occupancy.contains_key(&position)
    }

    fn occupy(&mut self, position: Hex) {
        *self.occupancy.entry(position).or_insert(0) += 1;
    }

    fn vacate(&mut self, position: Hex) {
        if let Some(count) = self.occupancy.get_mut(&position) {
            *count -= 1;
            if *count == 0 {
                let _ = self.occupancy.remove(&position);
            }
        }
    }
}

/// State-dependent attractor coefficients over the perception sample order
/// (food, positive, negative, forage, nest membership).
fn attractor_vector(state: AgentState, weights: AttractorWeights) -> [f32; SAMPLE_SIZE] {
    match state {
        AgentState::Foraging => [weights.food, weights.positive, weights.negative, 0.0, 0.0],
        AgentState::Returning => [0.0, 0.0, weights.negative, weights.forage, weights.nest],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn open_colony(width: u32, height: u32, seed: u64) -> Colony {
        Colony::new(ColonyConfig {
            width,
            height,
            rng_seed: Some(seed),
            ..ColonyConfig::default()
        })
        .expect("colony")
    }

    #[test]
    fn direction_rotation_wraps_the_wheel() {
        assert_eq!(Direction::Up.rotated(0), Direction::Up);
        assert_eq!(Direction::Up.rotated(6), Direction::Up);
        assert_eq!(Direction::Up.rotated(-6), Direction::Up);
        assert_eq!(Direction::UpLeft.rotated(-1), Direction::DownLeft);
        assert_eq!(Direction::DownLeft.rotated(1), Direction::UpLeft);
        assert_eq!(Direction::Up.reversed(), Direction::Down);
        assert_eq!(Direction::UpRight.reversed(), Direction::DownLeft);
        for dir in Direction::ALL {
            assert_eq!(dir.reversed().reversed(), dir);
        }
    }

    #[test]
    fn neighbor_uses_parity_selected_deltas() {
        let even = Hex::new(2, 2);
        assert_eq!(even.neighbor(Direction::UpLeft), Hex::new(1, 1));
        assert_eq!(even.neighbor(Direction::Up), Hex::new(0, 2));
        assert_eq!(even.neighbor(Direction::UpRight), Hex::new(1, 2));
        assert_eq!(even.neighbor(Direction::DownRight), Hex::new(3, 2));
        assert_eq!(even.neighbor(Direction::Down), Hex::new(4, 2));
        assert_eq!(even.neighbor(Direction::DownLeft), Hex::new(3, 1));

        let odd = Hex::new(1, 0);
        assert_eq!(odd.neighbor(Direction::UpLeft), Hex::new(0, 0));
        assert_eq!(odd.neighbor(Direction::Up), Hex::new(-1, 0));
        assert_eq!(odd.neighbor(Direction::UpRight), Hex::new(0, 1));
        assert_eq!(odd.neighbor(Direction::DownRight), Hex::new(2, 1));
        assert_eq!(odd.neighbor(Direction::Down), Hex::new(3, 0));
        assert_eq!(odd.neighbor(Direction::DownLeft), Hex::new(2, 0));
    }

    #[test]
    fn neighbor_handles_negative_row_parity() {
        // -1 is an odd row; rem_euclid keeps the table selection stable
        // across zero.
        let hex = Hex::new(-1, 4);
        assert_eq!(hex.neighbor(Direction::UpLeft), Hex::new(-2, 4));
        assert_eq!(hex.neighbor(Direction::DownRight), Hex::new(0, 5));
    }

    #[test]
    fn ring_area_matches_hex_area_formula() {
        let colony = open_colony(40, 40, 1);
        for radius in 0..5 {
            let area = colony.grid().ring_area(Hex::new(20, 20), radius);
            let distinct: HashSet<Hex> = area.iter().copied().collect();
            assert_eq!(area.len() as u64, hex_area(radius));
            assert_eq!(distinct.len() as u64, hex_area(radius), "radius {radius}");
        }
    }

    #[test]
    fn ring_area_radius_one_is_center_plus_neighbors() {
        let colony = open_colony(10, 10, 1);
        let center = Hex::new(4, 4);
        let area: HashSet<Hex> = colony.grid().ring_area(center, 1).into_iter().collect();
        assert_eq!(area.len(), 7);
        assert!(area.contains(&center));
        for dir in Direction::ALL {
            assert!(area.contains(&center.neighbor(dir)));
        }
    }

    #[test]
    fn raycast_stops_before_walls_and_bounds() {
        let mut colony = open_colony(9, 9, 1);
        let wall = Hex::new(0, 4);
        colony.grid_mut().cell_mut(wall).expect("cell").kind = CellKind::Wall;

        // Walking Up from (4, 4) visits (2, 4) then halts at the wall.
        let ray = colony.grid().raycast(Hex::new(4, 4), Direction::Up, 10, true);
        assert_eq!(ray, vec![Hex::new(2, 4)]);

        for dir in Direction::ALL {
            for pos in colony.grid().raycast(Hex::new(4, 4), dir, 30, true) {
                assert!(colony.grid().in_bounds(pos));
                assert_ne!(colony.grid().cell(pos).expect("cell").kind, CellKind::Wall);
            }
        }
    }

    #[test]
    fn unchecked_raycast_walks_exactly_max_steps() {
        let colony = open_colony(5, 5, 1);
        let ray = colony.grid().raycast(Hex::new(0, 0), Direction::Up, 4, false);
        assert_eq!(ray.len(), 4);
        assert!(ray.iter().any(|pos| !colony.grid().in_bounds(*pos)));
    }

    #[test]
    fn terrain_generation_thresholds_the_noise_field() {
        let mut colony = open_colony(10, 10, 1);
        // Wall out the half of the grid where u >= 0.5.
        let noise = |u: f64, _v: f64| if u >= 0.5 { 1.0 } else { 0.0 };
        colony.generate_terrain(&noise);
        let grid = colony.grid();
        for x in 0..10 {
            for y in 0..10 {
                let kind = grid.cell(Hex::new(x, y)).expect("cell").kind;
                if x >= 5 {
                    assert_eq!(kind, CellKind::Wall);
                } else {
                    assert_eq!(kind, CellKind::Empty);
                }
            }
        }
    }

    #[test]
    fn terrain_generation_preserves_nest_cells() {
        let mut colony = open_colony(10, 10, 1);
        let nest_id = colony.place_nest(Hex::new(4, 4), 0).expect("nest");
        colony.generate_terrain(&|_u: f64, _v: f64| 1.0);
        let cell = colony.grid().cell(Hex::new(4, 4)).expect("cell");
        assert_eq!(cell.kind, CellKind::Nest);
        assert_eq!(cell.nest, Some(nest_id));
    }

    #[test]
    fn random_free_cell_fails_on_fully_walled_grid() {
        let mut colony = open_colony(6, 6, 3);
        colony.generate_terrain(&|_u: f64, _v: f64| 1.0);
        assert_eq!(colony.random_free_cell(64), None);

        let mut open = open_colony(6, 6, 3);
        let found = open.random_free_cell(8).expect("free cell");
        assert!(open.grid().is_passable(found));
    }

    #[test]
    fn random_clear_ring_rejects_rings_touching_walls() {
        let mut colony = open_colony(16, 16, 5);
        let noise = |u: f64, _v: f64| if u < 0.5 { 1.0 } else { 0.0 };
        colony.generate_terrain(&noise);
        for _ in 0..16 {
            if let Some(center) = colony.random_clear_ring(1, 128) {
                assert!(colony.grid().ring_is_clear(center, 1));
            }
        }
    }

    #[test]
    fn food_cluster_with_unit_density_fills_the_ring() {
        let mut colony = open_colony(20, 20, 7);
        let center = Hex::new(10, 10);
        colony.add_food_cluster(center, 2, 1.0);
        let covered = colony.grid().ring_area(center, 2);
        assert_eq!(covered.len() as u64, hex_area(2));
        for pos in covered {
            assert!((colony.grid().cell(pos).expect("cell").food - 1.0).abs() < f32::EPSILON);
        }
        let summary_food = colony.grid().total_food();
        assert!((summary_food - hex_area(2) as f32).abs() < 1e-3);
    }

    #[test]
    fn food_cluster_skips_walls() {
        let mut colony = open_colony(20, 20, 7);
        let center = Hex::new(10, 10);
        let walled = center.neighbor(Direction::Up);
        colony.grid_mut().cell_mut(walled).expect("cell").kind = CellKind::Wall;
        colony.add_food_cluster(center, 1, 1.0);
        assert_eq!(colony.grid().cell(walled).expect("cell").food, 0.0);
    }

    #[test]
    fn pheromone_decay_shrinks_each_channel_independently() {
        let mut cell = Cell {
            positive: 1.0,
            negative: 1.0,
            forage: 1.0,
            ..Cell::default()
        };
        let rates = PheromoneDecay::default();
        cell.decay(rates);
        assert!((cell.positive - 0.95).abs() < 1e-6);
        assert!((cell.negative - 0.7).abs() < 1e-6);
        assert!((cell.forage - 0.8).abs() < 1e-6);
    }

    #[test]
    fn take_food_clamps_at_zero() {
        let mut cell = Cell {
            food: 0.3,
            ..Cell::default()
        };
        assert!((cell.take_food(0.2) - 0.2).abs() < 1e-6);
        assert!((cell.take_food(0.5) - 0.1).abs() < 1e-6);
        assert_eq!(cell.food, 0.0);
        assert_eq!(cell.take_food(1.0), 0.0);
    }

    #[test]
    fn gaussian_weight_is_symmetric_and_forward_biased() {
        let variance = 0.6;
        assert!(gaussian_weight(0.0, variance) > gaussian_weight(1.0, variance));
        assert!(gaussian_weight(1.0, variance) > gaussian_weight(2.0, variance));
        let left = gaussian_weight(-2.0, variance);
        let right = gaussian_weight(2.0, variance);
        assert!((left - right).abs() < 1e-9);
    }

    #[test]
    fn softmax_produces_a_distribution_and_prefers_larger_scores() {
        let mut values = [1.0, 3.0, 2.0];
        softmax_in_place(&mut values);
        let sum: f32 = values.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(values[1] > values[2] && values[2] > values[0]);

        // Large scores must not overflow to NaN.
        let mut large = [100.0, 200.0];
        softmax_in_place(&mut large);
        assert!(large.iter().all(|v| v.is_finite()));
        assert!(large[1] > large[0]);
    }

    #[test]
    fn normalize_rejects_empty_mass() {
        let mut zeros = [0.0, 0.0];
        assert!(!normalize_in_place(&mut zeros));
        let mut values = [1.0, 3.0];
        assert!(normalize_in_place(&mut values));
        assert!((values[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let bad_dims = ColonyConfig {
            width: 0,
            ..ColonyConfig::default()
        };
        assert!(Colony::new(bad_dims).is_err());

        let bad_decay = ColonyConfig {
            decay: PheromoneDecay {
                positive: 1.5,
                ..PheromoneDecay::default()
            },
            ..ColonyConfig::default()
        };
        assert!(Colony::new(bad_decay).is_err());

        let bad_capacity = ColonyConfig {
            agent: AgentParams {
                capacity: 0.0,
                ..AgentParams::default()
            },
            ..ColonyConfig::default()
        };
        assert!(Colony::new(bad_capacity).is_err());

        let bad_range = ColonyConfig {
            agent: AgentParams {
                perception_range: 0,
                ..AgentParams::default()
            },
            ..ColonyConfig::default()
        };
        assert!(Colony::new(bad_range).is_err());
    }

    #[test]
    fn arena_preserves_spawn_order() {
        let mut colony = open_colony(12, 12, 9);
        let a = colony.spawn_agent_at(Hex::new(2, 2)).expect("a");
        let b = colony.spawn_agent_at(Hex::new(4, 4)).expect("b");
        let c = colony.spawn_agent_at(Hex::new(6, 6)).expect("c");
        let order: Vec<AgentId> = colony.agents().iter_handles().collect();
        assert_eq!(order, vec![a, b, c]);
        assert!(colony.agents().contains(b));
        assert_eq!(colony.agents().get(b).expect("agent").position, Hex::new(4, 4));
    }

    #[test]
    fn spawn_rejects_walls_bounds_and_occupied_cells() {
        let mut colony = open_colony(8, 8, 11);
        let wall = Hex::new(3, 3);
        colony.grid_mut().cell_mut(wall).expect("cell").kind = CellKind::Wall;

        assert_eq!(
            colony.spawn_agent_at(Hex::new(-1, 0)),
            Err(PlacementError::OutOfBounds(Hex::new(-1, 0)))
        );
        assert_eq!(
            colony.spawn_agent_at(wall),
            Err(PlacementError::Blocked(wall))
        );
        let pos = Hex::new(2, 2);
        assert!(colony.spawn_agent_at(pos).is_ok());
        assert_eq!(
            colony.spawn_agent_at(pos),
            Err(PlacementError::Occupied(pos))
        );
        assert!(colony.is_occupied(pos));
    }

    #[test]
    fn bulk_spawn_derives_radius_and_places_everyone() {
        let mut colony = open_colony(30, 30, 13);
        let report = colony.spawn_agents_around(10, Hex::new(15, 15), None, 0.4, false);
        assert_eq!(report.requested, 10);
        assert_eq!(report.spawned, 10);
        assert_eq!(colony.agents().len(), 10);
        let positions: HashSet<Hex> = colony
            .agent_snapshots()
            .iter()
            .map(|snapshot| snapshot.position)
            .collect();
        assert_eq!(positions.len(), 10, "spawn cells are distinct");
    }

    #[test]
    fn strict_bulk_spawn_reports_the_shortfall() {
        let mut colony = open_colony(30, 30, 13);
        // Radius 1 holds at most 7 cells.
        let report = colony.spawn_agents_around(20, Hex::new(15, 15), Some(1), 0.4, true);
        assert_eq!(report.requested, 20);
        assert_eq!(report.spawned, 7);
        assert_eq!(colony.agents().len(), 7);
    }

    #[test]
    fn bulk_spawn_on_a_crowded_grid_terminates() {
        let mut colony = open_colony(4, 4, 17);
        let report = colony.spawn_agents_around(100, Hex::new(2, 2), None, 1.0, false);
        assert!(report.spawned < report.requested);
        assert!(report.spawned <= 16);
    }

    #[test]
    fn place_nest_marks_footprint_cells() {
        let mut colony = open_colony(20, 20, 19);
        let center = Hex::new(10, 10);
        let id = colony.place_nest(center, 1).expect("nest");
        let nest = colony.nest(id).expect("nest ref");
        assert_eq!(nest.center(), center);
        assert_eq!(nest.footprint().len() as u64, hex_area(1));
        assert_eq!(nest.food(), 0.0);
        for pos in nest.footprint() {
            let cell = colony.grid().cell(*pos).expect("cell");
            assert_eq!(cell.kind, CellKind::Nest);
            assert_eq!(cell.nest, Some(id));
            assert_eq!(cell.nest_value, 1.0);
        }
        let snapshots = colony.nest_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].center, center);
    }

    #[test]
    fn place_nest_clips_footprint_to_bounds() {
        let mut colony = open_colony(6, 6, 19);
        let id = colony.place_nest(Hex::new(0, 0), 1).expect("nest");
        let nest = colony.nest(id).expect("nest ref");
        assert!(nest.footprint().len() < hex_area(1) as usize);
        assert!(nest
            .footprint()
            .iter()
            .all(|pos| colony.grid().in_bounds(*pos)));
    }

    #[test]
    fn place_nest_rejects_out_of_bounds_center() {
        let mut colony = open_colony(6, 6, 19);
        assert_eq!(
            colony.place_nest(Hex::new(9, 9), 1),
            Err(PlacementError::OutOfBounds(Hex::new(9, 9)))
        );
    }

    fn walled_in_carrier(colony: &mut Colony, pos: Hex, food: f32, carried: f32) -> AgentId {
        for dir in Direction::ALL {
            colony
                .grid_mut()
                .cell_mut(pos.neighbor(dir))
                .expect("cell")
                .kind = CellKind::Wall;
        }
        colony.grid_mut().cell_mut(pos).expect("cell").food = food;
        let id = colony.spawn_agent_at(pos).expect("agent");
        colony.agents.get_mut(id).expect("agent").carried = carried;
        id
    }

    #[test]
    fn partial_carrier_tops_up_and_turns_back() {
        let mut colony = open_colony(12, 12, 43);
        let pos = Hex::new(6, 6);
        let id = walled_in_carrier(&mut colony, pos, 1.0, 0.3);
        let before = colony.agents.get(id).expect("agent").heading;

        let _ = colony.step();

        // capacity 0.5: takes exactly the 0.2 shortfall, fills up, and
        // turns for home.
        let agent = colony.agents.get(id).expect("agent");
        assert!((agent.carried - 0.5).abs() < 1e-6);
        assert_eq!(agent.state, AgentState::Returning);
        assert_eq!(agent.heading, before.reversed());
        let cell = colony.grid().cell(pos).expect("cell");
        assert!((cell.food - 0.8).abs() < 1e-6);
    }

    #[test]
    fn scarce_cell_leaves_carrier_foraging() {
        let mut colony = open_colony(12, 12, 43);
        let pos = Hex::new(6, 6);
        let id = walled_in_carrier(&mut colony, pos, 0.1, 0.3);
        let before = colony.agents.get(id).expect("agent").heading;

        let _ = colony.step();

        // The cell runs dry below capacity, so the agent keeps foraging
        // and, boxed in with no candidates, keeps its heading.
        let agent = colony.agents.get(id).expect("agent");
        assert!((agent.carried - 0.4).abs() < 1e-6);
        assert_eq!(agent.state, AgentState::Foraging);
        assert_eq!(agent.heading, before);
        assert_eq!(colony.grid().cell(pos).expect("cell").food, 0.0);
    }

    #[test]
    fn history_is_bounded_by_capacity() {
        let mut colony = Colony::new(ColonyConfig {
            width: 10,
            height: 10,
            rng_seed: Some(21),
            history_capacity: 3,
            ..ColonyConfig::default()
        })
        .expect("colony");
        for _ in 0..5 {
            let _ = colony.step();
        }
        let ticks: Vec<u64> = colony.history().map(|summary| summary.tick.0).collect();
        assert_eq!(ticks, vec![3, 4, 5]);
    }

    #[test]
    fn step_summary_tracks_food_locations() {
        let mut colony = open_colony(12, 12, 23);
        let center = Hex::new(6, 6);
        colony.add_food_cluster(center, 1, 1.0);
        let agent_pos = Hex::new(2, 2);
        let _ = colony.spawn_agent_at(agent_pos).expect("agent");
        let summary = colony.step();
        assert_eq!(summary.tick, Tick(1));
        assert_eq!(summary.agent_count, 1);
        let total = summary.carried_total + summary.nest_food_total + summary.cell_food_total;
        assert!((total - hex_area(1) as f32).abs() < 1e-3);
    }
}
