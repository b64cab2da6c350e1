//! Core evolution engine shared across the CellGA workspace.
//!
//! A population of RGB-genome cells lives on a toroidal grid and is evolved
//! generation by generation with neighborhood-local operators: roulette
//! selection over a fixed-shape neighborhood, channel-rotation-plus-max
//! recombination, and one of three replacement policies. Generations can be
//! computed synchronously from a frozen snapshot or asynchronously row by
//! row, single-threaded or fork-joined across contiguous partitions.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Fitness of a fully saturated `(255, 255, 255)` genome.
pub const MAX_FITNESS: u32 = u8::MAX as u32 * 3;

/// True (non-negative) modulo used for toroidal coordinate arithmetic.
#[inline]
fn wrap(value: i64, modulus: i64) -> i64 {
    value.rem_euclid(modulus)
}

/// The evolvable three-channel chromosome carried by every cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Genome {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Genome {
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Genome achieving [`MAX_FITNESS`].
    #[must_use]
    pub const fn saturated() -> Self {
        Self::new(u8::MAX, u8::MAX, u8::MAX)
    }

    /// Sum of the three channels, in `[0, MAX_FITNESS]`.
    #[must_use]
    pub fn fitness(&self) -> u32 {
        u32::from(self.r) + u32::from(self.g) + u32::from(self.b)
    }

    /// Distance from the maximum fitness.
    #[must_use]
    pub fn objective(&self) -> u32 {
        MAX_FITNESS - self.fitness()
    }

    /// Combine two parent genomes channel-wise, taking the maximum of each
    /// pair after rotating parent channels by the chosen offset.
    #[must_use]
    pub fn recombine(a: Self, b: Self, rotation: ChannelRotation) -> Self {
        match rotation {
            ChannelRotation::Aligned => Self::new(a.r.max(b.r), a.g.max(b.g), a.b.max(b.b)),
            ChannelRotation::RotateOne => Self::new(a.b.max(b.b), a.r.max(b.r), a.g.max(b.g)),
            ChannelRotation::RotateTwo => Self::new(a.g.max(b.g), a.b.max(b.b), a.r.max(b.r)),
        }
    }

    /// Reduce channels that exceed `bias` by `bias`, leaving the rest alone.
    #[must_use]
    fn biased(self, bias: u8) -> Self {
        let dim = |channel: u8| if channel > bias { channel - bias } else { channel };
        Self::new(dim(self.r), dim(self.g), dim(self.b))
    }
}

/// The three recombination variants drawn uniformly during reproduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRotation {
    /// R/G/B channels pair up with themselves.
    Aligned,
    /// Offspring reads `(B, R, G)` from the parents.
    RotateOne,
    /// Offspring reads `(G, B, R)` from the parents.
    RotateTwo,
}

impl ChannelRotation {
    /// Draw one of the three rotations uniformly.
    #[must_use]
    pub fn sample(rng: &mut SmallRng) -> Self {
        match rng.random_range(0..3u8) {
            0 => Self::Aligned,
            1 => Self::RotateOne,
            _ => Self::RotateTwo,
        }
    }
}

/// Grid coordinate; always within `[0, cols) x [0, rows)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub col: u32,
    pub row: u32,
}

impl Location {
    #[must_use]
    pub const fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

/// A grid-resident individual: genome plus its coordinate, and optionally
/// the coordinate a redirecting replacement policy will write it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub genome: Genome,
    pub location: Location,
    pub replace_target: Option<Location>,
}

impl Cell {
    #[must_use]
    pub const fn new(genome: Genome, location: Location) -> Self {
        Self {
            genome,
            location,
            replace_target: None,
        }
    }
}

/// Fixed-shape neighborhood consulted when evolving one grid cell.
///
/// Enumeration order is part of the contract: selection treats the sequence
/// positionally and the worst-in-neighborhood tie-break picks the first
/// minimum. L5/L9 place the self cell at position 0; C9/C13 scan the 3x3
/// block row-major, putting the self cell at position 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Topology {
    /// Self plus the four von Neumann neighbors.
    #[default]
    L5,
    /// Self plus the four axes extended two cells out.
    L9,
    /// The 3x3 Moore block.
    C9,
    /// The 3x3 block plus the four axis cells two out.
    C13,
}

impl Topology {
    /// Number of members (duplicates included) every neighborhood has.
    #[must_use]
    pub const fn member_count(self) -> usize {
        match self {
            Self::L5 => 5,
            Self::L9 | Self::C9 => 9,
            Self::C13 => 13,
        }
    }
}

/// The two parents drawn for one reproduction; `a` is the first draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentPair {
    pub a: Cell,
    pub b: Cell,
}

/// Fitness-proportionate index draw over a neighborhood sequence.
///
/// A zero-fitness neighborhood falls back to a uniform draw, and a
/// cumulative scan that never exceeds the sample (floating rounding)
/// falls back to the last index.
#[must_use]
pub fn roulette_index(members: &[Cell], rng: &mut SmallRng) -> usize {
    debug_assert!(!members.is_empty());
    let total: u32 = members.iter().map(|cell| cell.genome.fitness()).sum();
    if total == 0 {
        return rng.random_range(0..members.len());
    }
    let total = f64::from(total);
    let x = rng.random::<f64>();
    let mut cumulative = 0.0;
    for (index, cell) in members.iter().enumerate() {
        cumulative += f64::from(cell.genome.fitness()) / total;
        if x < cumulative {
            return index;
        }
    }
    members.len() - 1
}

/// Draw two parents independently; self-selection and coinciding parents
/// are legal.
#[must_use]
pub fn select_parents(neighborhood: &[Cell], rng: &mut SmallRng) -> ParentPair {
    ParentPair {
        a: neighborhood[roulette_index(neighborhood, rng)],
        b: neighborhood[roulette_index(neighborhood, rng)],
    }
}

/// Produce the offspring for the grid coordinate `(col, row)` from the
/// selected parents, drawing one of the three channel rotations.
#[must_use]
pub fn reproduce(col: u32, row: u32, parents: &ParentPair, rng: &mut SmallRng) -> Cell {
    let rotation = ChannelRotation::sample(rng);
    Cell::new(
        Genome::recombine(parents.a.genome, parents.b.genome, rotation),
        Location::new(col, row),
    )
}

/// The neighborhood member with minimum fitness; the first member achieving
/// the minimum wins ties, so the scan order of the topology decides.
#[must_use]
pub fn worst_member(neighborhood: &[Cell]) -> &Cell {
    let mut worst = &neighborhood[0];
    for member in &neighborhood[1..] {
        if member.genome.fitness() < worst.genome.fitness() {
            worst = member;
        }
    }
    worst
}

/// Rule deciding which grid slot an offspring overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplacePolicy {
    /// The candidate array becomes the next population verbatim.
    #[default]
    All,
    /// Each offspring overwrites the worst member of its neighborhood.
    WorstInNeighborhood,
    /// Each offspring overwrites one of its parents, chosen by coin flip.
    OneParent,
}

/// A single ordered write produced by the merge phase. Intents are applied
/// row-major over partitions in partition index order; the last write to a
/// slot wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIntent {
    pub target: Location,
    pub genome: Genome,
}

impl WriteIntent {
    /// An absent replace target means the offspring writes in place.
    #[must_use]
    pub fn for_offspring(cell: &Cell) -> Self {
        Self {
            target: cell.replace_target.unwrap_or(cell.location),
            genome: cell.genome,
        }
    }
}

/// Whether a generation reads one frozen snapshot or observes rows already
/// updated earlier in the same generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Discipline {
    #[default]
    Synchronous,
    Asynchronous,
}

/// How a generation's work is partitioned across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parallelism {
    #[default]
    SingleThreaded,
    /// Contiguous partitions handed to a fork-join pool; `None` auto-detects
    /// the available parallel execution units.
    MultiWorker { workers: Option<usize> },
}

/// Strategy used to seed the initial population.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum FillStrategy {
    /// Uniform random bytes per channel.
    #[default]
    UniformRandom,
    /// Uniform random bytes, with channels exceeding `bias` reduced by it
    /// for cells inside the border band.
    BiasedBorderRandom { border_fraction: f64, bias: u8 },
}

/// Errors raised while constructing an evolution run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Indicates a configuration value that cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for one evolution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Number of grid rows.
    pub rows: u32,
    /// Number of grid columns.
    pub cols: u32,
    /// Neighborhood consulted when evolving each cell.
    pub topology: Topology,
    /// Replacement policy applied during the merge phase.
    pub replacement: ReplacePolicy,
    /// Synchronous or asynchronous update discipline.
    pub discipline: Discipline,
    /// Single-threaded or partitioned fork-join execution.
    pub parallelism: Parallelism,
    /// Maximum number of generations to run.
    pub generation_budget: u32,
    /// Strategy used to seed the initial population.
    pub fill: FillStrategy,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Tolerance subtracted from the perfect score when testing for
    /// convergence; `0.0` demands exact saturation.
    pub convergence_epsilon: f64,
    /// Generations between snapshot frames; 0 disables snapshots.
    pub snapshot_interval: u32,
    /// Maximum number of generation summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            rows: 256,
            cols: 256,
            topology: Topology::default(),
            replacement: ReplacePolicy::default(),
            discipline: Discipline::default(),
            parallelism: Parallelism::default(),
            generation_budget: 1_000,
            fill: FillStrategy::default(),
            rng_seed: None,
            convergence_epsilon: 0.0,
            snapshot_interval: 0,
            history_capacity: 256,
        }
    }
}

impl EvolutionConfig {
    /// Validates the configuration before any generation runs.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(EngineError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        if matches!(
            self.parallelism,
            Parallelism::MultiWorker { workers: Some(0) }
        ) {
            return Err(EngineError::InvalidConfig(
                "worker count must be non-zero",
            ));
        }
        if !(0.0..1.0).contains(&self.convergence_epsilon) {
            return Err(EngineError::InvalidConfig(
                "convergence_epsilon must be in [0, 1)",
            ));
        }
        if let FillStrategy::BiasedBorderRandom {
            border_fraction, ..
        } = self.fill
            && !(0.0..=1.0).contains(&border_fraction)
        {
            return Err(EngineError::InvalidConfig(
                "border_fraction must be in [0, 1]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
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

/// Row-major array of cells with toroidal indexed access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    rows: u32,
    cols: u32,
    cells: Vec<Cell>,
}

impl Population {
    /// Seed a fresh population using the chosen fill strategy.
    #[must_use]
    pub fn generate(rows: u32, cols: u32, fill: &FillStrategy, rng: &mut SmallRng) -> Self {
        let mut cells = Vec::with_capacity(rows as usize * cols as usize);
        for row in 0..rows {
            for col in 0..cols {
                let mut genome = Genome::new(rng.random(), rng.random(), rng.random());
                if let FillStrategy::BiasedBorderRandom {
                    border_fraction,
                    bias,
                } = fill
                    && in_border_band(row, col, rows, cols, *border_fraction)
                {
                    genome = genome.biased(*bias);
                }
                cells.push(Cell::new(genome, Location::new(col, row)));
            }
        }
        Self { rows, cols, cells }
    }

    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.rows
    }

    #[must_use]
    pub const fn cols(&self) -> u32 {
        self.cols
    }

    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    #[inline]
    fn offset(&self, row: u32, col: u32) -> usize {
        row as usize * self.cols as usize + col as usize
    }

    /// Immutable access to the cell at an in-bounds coordinate.
    #[must_use]
    pub fn get(&self, row: u32, col: u32) -> Option<&Cell> {
        if row < self.rows && col < self.cols {
            Some(&self.cells[self.offset(row, col)])
        } else {
            None
        }
    }

    /// Overwrite the genome at an in-bounds coordinate.
    pub fn set_genome(&mut self, row: u32, col: u32, genome: Genome) {
        if row < self.rows && col < self.cols {
            let index = self.offset(row, col);
            self.cells[index].genome = genome;
        }
    }

    /// Fill every cell with the provided genome.
    pub fn fill(&mut self, genome: Genome) {
        for cell in &mut self.cells {
            cell.genome = genome;
        }
    }

    /// Enumerate the neighborhood of `(row, col)` under `topology`, in the
    /// topology's fixed order, wrapping toroidally. Grids smaller than the
    /// topology's reach yield the same physical cell at several positions;
    /// that duplication is preserved.
    #[must_use]
    pub fn neighborhood(&self, row: u32, col: u32, topology: Topology) -> Vec<Cell> {
        let rows = i64::from(self.rows);
        let cols = i64::from(self.cols);
        let row = i64::from(row);
        let col = i64::from(col);
        let at = |r: i64, c: i64| {
            self.cells[(wrap(r, rows) * cols + wrap(c, cols)) as usize]
        };

        let mut members = Vec::with_capacity(topology.member_count());
        match topology {
            Topology::L5 => {
                members.push(at(row, col));
                members.push(at(row, col - 1)); // Left
                members.push(at(row - 1, col)); // Top
                members.push(at(row, col + 1)); // Right
                members.push(at(row + 1, col)); // Bottom
            }
            Topology::L9 => {
                members.push(at(row, col));
                members.push(at(row, col - 1)); // Left
                members.push(at(row, col - 2)); // Left 2
                members.push(at(row - 1, col)); // Top
                members.push(at(row - 2, col)); // Top 2
                members.push(at(row, col + 1)); // Right
                members.push(at(row, col + 2)); // Right 2
                members.push(at(row + 1, col)); // Bottom
                members.push(at(row + 2, col)); // Bottom 2
            }
            Topology::C9 => {
                for r in (row - 1)..=(row + 1) {
                    for c in (col - 1)..=(col + 1) {
                        members.push(at(r, c));
                    }
                }
            }
            Topology::C13 => {
                for r in (row - 1)..=(row + 1) {
                    for c in (col - 1)..=(col + 1) {
                        members.push(at(r, c));
                    }
                }
                members.push(at(row, col - 2)); // Left 2
                members.push(at(row - 2, col)); // Top 2
                members.push(at(row, col + 2)); // Right 2
                members.push(at(row + 2, col)); // Bottom 2
            }
        }
        debug_assert_eq!(members.len(), topology.member_count());
        members
    }

    /// Apply write intents in order; the last write to a slot wins.
    pub fn apply(&mut self, intents: &[WriteIntent]) {
        for intent in intents {
            let index = self.offset(intent.target.row, intent.target.col);
            self.cells[index] = Cell::new(intent.genome, intent.target);
        }
    }

    /// Combined fitness of every cell.
    #[must_use]
    pub fn total_fitness(&self) -> u64 {
        self.cells
            .iter()
            .map(|cell| u64::from(cell.genome.fitness()))
            .sum()
    }

    /// Mean fitness normalized into `[0, 1]`; exactly `1.0` iff every cell
    /// is saturated.
    #[must_use]
    pub fn score(&self) -> f64 {
        let ceiling = self.cells.len() as u64 * u64::from(MAX_FITNESS);
        self.total_fitness() as f64 / ceiling as f64
    }

    /// Row-major RGB triples for the snapshot collaborator.
    #[must_use]
    pub fn rgb_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.cells.len() * 3);
        for cell in &self.cells {
            bytes.push(cell.genome.r);
            bytes.push(cell.genome.g);
            bytes.push(cell.genome.b);
        }
        bytes
    }
}

fn in_border_band(row: u32, col: u32, rows: u32, cols: u32, fraction: f64) -> bool {
    let band_rows = (f64::from(rows) * fraction).round() as u32;
    let band_cols = (f64::from(cols) * fraction).round() as u32;
    row < band_rows
        || row >= rows.saturating_sub(band_rows)
        || col < band_cols
        || col >= cols.saturating_sub(band_cols)
}

/// Monotone generation counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Generation(pub u32);

impl Generation {
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Structured record reported after every generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub generation: Generation,
    pub score: f64,
    pub elapsed: Duration,
}

/// Result of driving a full evolution run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Whether the score crossed the convergence threshold.
    pub converged: bool,
    /// Generations actually executed.
    pub generations: u32,
    /// Score of the final population.
    pub final_score: f64,
}

/// One population frame handed to the snapshot collaborator.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotFrame<'a> {
    pub generation: Generation,
    pub width: u32,
    pub height: u32,
    /// Row-major RGB triples, `width * height * 3` bytes.
    pub pixels: &'a [u8],
}

/// Outward-facing collaborator persisting population frames; the engine
/// never interprets pixel formats beyond RGB triples.
pub trait SnapshotSink: Send {
    fn on_snapshot(
        &mut self,
        frame: &SnapshotFrame<'_>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Sink that drops every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSnapshotSink;

impl SnapshotSink for NullSnapshotSink {
    fn on_snapshot(
        &mut self,
        _frame: &SnapshotFrame<'_>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Split `total` indices into `workers` contiguous spans; the remainder
/// goes to the last span.
fn partition_spans(total: u32, workers: usize) -> Vec<Range<u32>> {
    let workers = workers.max(1) as u32;
    let span = total / workers;
    (0..workers)
        .map(|worker| {
            let from = worker * span;
            let to = if worker + 1 == workers {
                total
            } else {
                from + span
            };
            from..to
        })
        .collect()
}

/// Compute the candidate offspring for one grid coordinate from the given
/// population view.
fn evolve_cell(
    population: &Population,
    row: u32,
    col: u32,
    topology: Topology,
    policy: ReplacePolicy,
    rng: &mut SmallRng,
) -> Cell {
    let neighborhood = population.neighborhood(row, col, topology);
    let parents = select_parents(&neighborhood, rng);
    let mut offspring = reproduce(col, row, &parents, rng);
    offspring.replace_target = match policy {
        ReplacePolicy::All => None,
        ReplacePolicy::WorstInNeighborhood => Some(worst_member(&neighborhood).location),
        ReplacePolicy::OneParent => Some(if rng.random_bool(0.5) {
            parents.a.location
        } else {
            parents.b.location
        }),
    };
    offspring
}

/// Aggregate state of one evolution run: the single engine parameterized by
/// every enumerated configuration option.
pub struct EvolutionState {
    config: EvolutionConfig,
    population: Population,
    generation: Generation,
    rng: SmallRng,
    snapshot: Box<dyn SnapshotSink>,
    history: VecDeque<GenerationSummary>,
}

impl fmt::Debug for EvolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvolutionState")
            .field("config", &self.config)
            .field("generation", &self.generation)
            .field("score", &self.population.score())
            .finish()
    }
}

impl EvolutionState {
    /// Instantiate a run from the supplied configuration.
    pub fn new(config: EvolutionConfig) -> Result<Self, EngineError> {
        Self::with_snapshot_sink(config, Box::new(NullSnapshotSink))
    }

    /// Instantiate a run with a snapshot sink attached.
    pub fn with_snapshot_sink(
        config: EvolutionConfig,
        snapshot: Box<dyn SnapshotSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let population = Population::generate(config.rows, config.cols, &config.fill, &mut rng);
        let history = VecDeque::with_capacity(config.history_capacity);
        Ok(Self {
            config,
            population,
            generation: Generation::zero(),
            rng,
            snapshot,
            history,
        })
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Read-only view of the current population.
    #[must_use]
    pub fn population(&self) -> &Population {
        &self.population
    }

    /// Mutable access to the current population (useful for seeding
    /// experiments).
    #[must_use]
    pub fn population_mut(&mut self) -> &mut Population {
        &mut self.population
    }

    /// Number of completed generations.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Current normalized population score.
    #[must_use]
    pub fn score(&self) -> f64 {
        self.population.score()
    }

    /// Iterate over retained generation summaries.
    pub fn history(&self) -> impl Iterator<Item = &GenerationSummary> {
        self.history.iter()
    }

    fn worker_count(&self) -> usize {
        match self.config.parallelism {
            Parallelism::SingleThreaded => 1,
            Parallelism::MultiWorker { workers } => workers.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(std::num::NonZeroUsize::get)
                    .unwrap_or(1)
            }),
        }
    }

    /// Per-worker seeds drawn off the master RNG before the fork; workers
    /// never share a mutable generator.
    fn draw_worker_seeds(&mut self, count: usize) -> Vec<u64> {
        (0..count).map(|_| self.rng.random()).collect()
    }

    /// Execute one generation, returning its summary record.
    pub fn step(&mut self) -> GenerationSummary {
        let started = Instant::now();
        match self.config.discipline {
            Discipline::Synchronous => self.step_synchronous(),
            Discipline::Asynchronous => self.step_asynchronous(),
        }
        self.generation = self.generation.next();
        let summary = GenerationSummary {
            generation: self.generation,
            score: self.population.score(),
            elapsed: started.elapsed(),
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        summary
    }

    fn step_synchronous(&mut self) {
        let spans = partition_spans(self.population.rows(), self.worker_count());
        let seeds = self.draw_worker_seeds(spans.len());
        self.step_synchronous_partitioned(&spans, &seeds);
    }

    /// Synchronous generation over explicit row partitions. Every worker
    /// reads the frozen prior population and fills a private buffer; the
    /// post-join merge walks the buffers in partition index order.
    fn step_synchronous_partitioned(&mut self, spans: &[Range<u32>], seeds: &[u64]) {
        let topology = self.config.topology;
        let policy = self.config.replacement;
        let population = &self.population;
        let cols = population.cols();

        let chunks: Vec<Vec<Cell>> = spans
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(span, seed)| {
                let mut rng = SmallRng::seed_from_u64(*seed);
                let mut chunk =
                    Vec::with_capacity((span.end - span.start) as usize * cols as usize);
                for row in span.clone() {
                    for col in 0..cols {
                        chunk.push(evolve_cell(population, row, col, topology, policy, &mut rng));
                    }
                }
                chunk
            })
            .collect();

        let intents: Vec<WriteIntent> = chunks
            .iter()
            .flatten()
            .map(WriteIntent::for_offspring)
            .collect();
        self.population.apply(&intents);
    }

    /// Asynchronous generation: each row's offspring are merged before the
    /// next row is computed, so later rows observe this generation's
    /// updates. The parallel variant partitions columns within one row.
    fn step_asynchronous(&mut self) {
        let rows = self.population.rows();
        let cols = self.population.cols();
        let topology = self.config.topology;
        let policy = self.config.replacement;
        let spans = partition_spans(cols, self.worker_count());

        for row in 0..rows {
            let seeds = self.draw_worker_seeds(spans.len());
            let population = &self.population;

            let chunks: Vec<Vec<Cell>> = spans
                .par_iter()
                .zip(seeds.par_iter())
                .map(|(span, seed)| {
                    let mut rng = SmallRng::seed_from_u64(*seed);
                    span.clone()
                        .map(|col| evolve_cell(population, row, col, topology, policy, &mut rng))
                        .collect()
                })
                .collect();

            let intents: Vec<WriteIntent> = chunks
                .iter()
                .flatten()
                .map(WriteIntent::for_offspring)
                .collect();
            self.population.apply(&intents);
        }
    }

    fn emit_snapshot(&mut self, generation: Generation) {
        let interval = self.config.snapshot_interval;
        if interval == 0 || !generation.0.is_multiple_of(interval) {
            return;
        }
        let pixels = self.population.rgb_bytes();
        let frame = SnapshotFrame {
            generation,
            width: self.config.cols,
            height: self.config.rows,
            pixels: &pixels,
        };
        if let Err(error) = self.snapshot.on_snapshot(&frame) {
            warn!(generation = generation.0, %error, "snapshot sink failed");
        }
    }

    /// Drive generations until the convergence threshold is crossed or the
    /// budget is exhausted.
    pub fn run(&mut self) -> RunOutcome {
        let threshold = 1.0 - self.config.convergence_epsilon;
        info!(
            topology = ?self.config.topology,
            replacement = ?self.config.replacement,
            discipline = ?self.config.discipline,
            score = self.population.score(),
            "starting evolution run",
        );

        let mut converged = false;
        for _ in 0..self.config.generation_budget {
            let summary = self.step();
            info!(
                generation = summary.generation.0,
                score = summary.score,
                elapsed_ms = summary.elapsed.as_secs_f64() * 1_000.0,
                "completed generation",
            );
            self.emit_snapshot(summary.generation);
            if summary.score >= threshold {
                info!(generation = summary.generation.0, "objective reached");
                converged = true;
                break;
            }
        }

        RunOutcome {
            converged,
            generations: self.generation.0,
            final_score: self.population.score(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_rng(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }

    fn uniform_population(rows: u32, cols: u32, seed: u64) -> Population {
        Population::generate(rows, cols, &FillStrategy::UniformRandom, &mut test_rng(seed))
    }

    fn zero_cells(fitnesses: &[u32]) -> Vec<Cell> {
        fitnesses
            .iter()
            .enumerate()
            .map(|(index, &fitness)| {
                assert!(fitness <= u32::from(u8::MAX));
                Cell::new(
                    Genome::new(fitness as u8, 0, 0),
                    Location::new(index as u32, 0),
                )
            })
            .collect()
    }

    #[test]
    fn wrap_is_true_modulo() {
        assert_eq!(wrap(-1, 5), 4);
        assert_eq!(wrap(-7, 5), 3);
        assert_eq!(wrap(0, 5), 0);
        assert_eq!(wrap(5, 5), 0);
        assert_eq!(wrap(7, 5), 2);
    }

    #[test]
    fn neighborhood_member_counts_match_topology() {
        let population = uniform_population(8, 8, 1);
        for topology in [Topology::L5, Topology::L9, Topology::C9, Topology::C13] {
            assert_eq!(
                population.neighborhood(3, 3, topology).len(),
                topology.member_count()
            );
        }
    }

    #[test]
    fn l5_wraps_toroidally_at_the_origin() {
        let population = uniform_population(4, 6, 2);
        let members = population.neighborhood(0, 0, Topology::L5);
        assert_eq!(members[0].location, Location::new(0, 0));
        assert_eq!(members[1].location, Location::new(5, 0)); // left wraps
        assert_eq!(members[2].location, Location::new(0, 3)); // top wraps
        assert_eq!(members[3].location, Location::new(1, 0));
        assert_eq!(members[4].location, Location::new(0, 1));
    }

    #[test]
    fn undersized_grid_preserves_duplicate_members() {
        let population = uniform_population(2, 2, 3);
        let members = population.neighborhood(0, 0, Topology::C9);
        assert_eq!(members.len(), 9);
        let distinct: HashSet<(u32, u32)> = members
            .iter()
            .map(|cell| (cell.location.col, cell.location.row))
            .collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn c9_scans_the_block_row_major() {
        let population = uniform_population(5, 5, 4);
        let members = population.neighborhood(2, 2, Topology::C9);
        let locations: Vec<Location> = members.iter().map(|cell| cell.location).collect();
        let expected = vec![
            Location::new(1, 1),
            Location::new(2, 1),
            Location::new(3, 1),
            Location::new(1, 2),
            Location::new(2, 2),
            Location::new(3, 2),
            Location::new(1, 3),
            Location::new(2, 3),
            Location::new(3, 3),
        ];
        assert_eq!(locations, expected);
    }

    #[test]
    fn roulette_falls_back_to_uniform_on_zero_fitness() {
        let members = zero_cells(&[0, 0, 0, 0, 0]);
        let mut rng = test_rng(5);
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let index = roulette_index(&members, &mut rng);
            assert!(index < members.len());
            seen.insert(index);
        }
        assert_eq!(seen.len(), members.len());
    }

    #[test]
    fn roulette_always_picks_the_sole_fit_member() {
        let members = zero_cells(&[0, 0, 200, 0, 0]);
        let mut rng = test_rng(6);
        for _ in 0..50 {
            assert_eq!(roulette_index(&members, &mut rng), 2);
        }
    }

    #[test]
    fn roulette_stays_in_range_for_mixed_fitness() {
        let population = uniform_population(6, 6, 7);
        let members = population.neighborhood(2, 4, Topology::C13);
        let mut rng = test_rng(8);
        for _ in 0..200 {
            assert!(roulette_index(&members, &mut rng) < members.len());
        }
    }

    #[test]
    fn selected_parents_come_from_the_neighborhood() {
        let population = uniform_population(6, 6, 9);
        let members = population.neighborhood(1, 1, Topology::L9);
        let mut rng = test_rng(10);
        for _ in 0..20 {
            let pair = select_parents(&members, &mut rng);
            assert!(members.contains(&pair.a));
            assert!(members.contains(&pair.b));
        }
    }

    #[test]
    fn recombination_applies_the_rotation_table() {
        let a = Genome::new(10, 20, 30);
        let b = Genome::new(5, 25, 40);
        assert_eq!(
            Genome::recombine(a, b, ChannelRotation::Aligned),
            Genome::new(10, 25, 40)
        );
        assert_eq!(
            Genome::recombine(a, b, ChannelRotation::RotateOne),
            Genome::new(40, 10, 25)
        );
        assert_eq!(
            Genome::recombine(a, b, ChannelRotation::RotateTwo),
            Genome::new(25, 40, 10)
        );
    }

    #[test]
    fn offspring_lives_at_the_recomputed_coordinate() {
        let parents = ParentPair {
            a: Cell::new(Genome::new(1, 2, 3), Location::new(7, 7)),
            b: Cell::new(Genome::new(4, 5, 6), Location::new(0, 3)),
        };
        let mut rng = test_rng(11);
        let offspring = reproduce(2, 5, &parents, &mut rng);
        assert_eq!(offspring.location, Location::new(2, 5));
        assert!(offspring.replace_target.is_none());
    }

    #[test]
    fn worst_member_takes_the_first_minimum() {
        let members = zero_cells(&[3, 1, 1, 2]);
        assert_eq!(worst_member(&members).location, Location::new(1, 0));
    }

    #[test]
    fn write_intent_defaults_to_the_own_coordinate() {
        let mut cell = Cell::new(Genome::new(9, 9, 9), Location::new(4, 2));
        assert_eq!(WriteIntent::for_offspring(&cell).target, Location::new(4, 2));
        cell.replace_target = Some(Location::new(0, 1));
        assert_eq!(WriteIntent::for_offspring(&cell).target, Location::new(0, 1));
    }

    #[test]
    fn partitions_are_contiguous_and_remainder_goes_last() {
        assert_eq!(partition_spans(8, 2), vec![0..4, 4..8]);
        assert_eq!(partition_spans(10, 4), vec![0..2, 2..4, 4..6, 6..10]);
        let spans = partition_spans(3, 5);
        assert_eq!(spans.len(), 5);
        assert_eq!(spans.last(), Some(&(0..3)));
        assert_eq!(spans.iter().map(|s| s.end - s.start).sum::<u32>(), 3);
    }

    #[test]
    fn config_validation_fails_fast() {
        let bad_dims = EvolutionConfig {
            rows: 0,
            ..EvolutionConfig::default()
        };
        assert!(bad_dims.validate().is_err());

        let bad_workers = EvolutionConfig {
            parallelism: Parallelism::MultiWorker { workers: Some(0) },
            ..EvolutionConfig::default()
        };
        assert!(bad_workers.validate().is_err());

        let bad_epsilon = EvolutionConfig {
            convergence_epsilon: 1.0,
            ..EvolutionConfig::default()
        };
        assert!(bad_epsilon.validate().is_err());

        let bad_border = EvolutionConfig {
            fill: FillStrategy::BiasedBorderRandom {
                border_fraction: 1.5,
                bias: 10,
            },
            ..EvolutionConfig::default()
        };
        assert!(bad_border.validate().is_err());

        let bad_history = EvolutionConfig {
            history_capacity: 0,
            ..EvolutionConfig::default()
        };
        assert!(bad_history.validate().is_err());

        assert!(EvolutionConfig::default().validate().is_ok());
    }

    #[test]
    fn score_is_normalized_and_saturation_exact() {
        let mut population = uniform_population(6, 6, 12);
        let score = population.score();
        assert!((0.0..=1.0).contains(&score));

        population.fill(Genome::saturated());
        assert_eq!(population.score(), 1.0);

        population.set_genome(0, 0, Genome::new(255, 255, 254));
        assert!(population.score() < 1.0);
    }

    #[test]
    fn biased_border_fill_caps_channels() {
        let fill = FillStrategy::BiasedBorderRandom {
            border_fraction: 1.0,
            bias: 200,
        };
        let population = Population::generate(8, 8, &fill, &mut test_rng(13));
        for cell in population.cells() {
            assert!(cell.genome.r <= 200);
            assert!(cell.genome.g <= 200);
            assert!(cell.genome.b <= 200);
        }
    }

    #[test]
    fn generation_fill_is_deterministic_per_seed() {
        let a = uniform_population(8, 8, 14);
        let b = uniform_population(8, 8, 14);
        assert_eq!(a, b);
    }

    #[test]
    fn merge_outcome_depends_on_partition_boundaries() {
        // Current contract, not a desired behavior: with redirecting
        // replacement, shifting the partition boundaries while holding the
        // worker seeds fixed may change the final population.
        let config = EvolutionConfig {
            rows: 8,
            cols: 8,
            replacement: ReplacePolicy::WorstInNeighborhood,
            rng_seed: Some(99),
            ..EvolutionConfig::default()
        };
        let mut even = EvolutionState::new(config.clone()).expect("engine");
        let mut skewed = EvolutionState::new(config).expect("engine");
        assert_eq!(even.population(), skewed.population());

        let seeds = [0xAAAA_u64, 0xBBBB_u64];
        even.step_synchronous_partitioned(&[0..4, 4..8], &seeds);
        skewed.step_synchronous_partitioned(&[0..2, 2..8], &seeds);
        assert_ne!(even.population(), skewed.population());
    }

    #[test]
    fn merge_leaves_every_cell_at_its_canonical_coordinate() {
        let config = EvolutionConfig {
            rows: 6,
            cols: 5,
            replacement: ReplacePolicy::OneParent,
            parallelism: Parallelism::MultiWorker { workers: Some(2) },
            rng_seed: Some(15),
            ..EvolutionConfig::default()
        };
        let mut engine = EvolutionState::new(config).expect("engine");
        engine.step();
        for (index, cell) in engine.population().cells().iter().enumerate() {
            let expected = Location::new(index as u32 % 5, index as u32 / 5);
            assert_eq!(cell.location, expected);
            assert!(cell.replace_target.is_none());
        }
    }
}
