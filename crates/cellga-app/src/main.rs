//! Command-line entry point wiring configuration into the evolution engine.

use anyhow::{Context, Result};
use cellga_core::{
    Discipline, EvolutionConfig, EvolutionState, FillStrategy, Parallelism, ReplacePolicy,
    Topology,
};
use cellga_raster::PngSnapshotSink;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "cellga",
    version,
    about = "Evolve a toroidal grid of RGB genomes with a cellular genetic algorithm"
)]
struct Cli {
    /// Number of grid rows.
    #[arg(long, default_value_t = 256)]
    rows: u32,

    /// Number of grid columns.
    #[arg(long, default_value_t = 256)]
    cols: u32,

    /// Neighborhood consulted when evolving each cell.
    #[arg(long, value_enum, default_value_t = TopologyArg::L5)]
    neighborhood: TopologyArg,

    /// Replacement policy applied when merging offspring.
    #[arg(long, value_enum, default_value_t = ReplacementArg::All)]
    replacement: ReplacementArg,

    /// Update discipline for each generation.
    #[arg(long, value_enum, default_value_t = DisciplineArg::Synchronous)]
    discipline: DisciplineArg,

    /// Worker count; omit for single-threaded, 0 to auto-detect.
    #[arg(long)]
    workers: Option<usize>,

    /// Maximum number of generations to run.
    #[arg(long, default_value_t = 1_000)]
    generations: u32,

    /// RNG seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Convergence tolerance subtracted from the perfect score.
    #[arg(long, default_value_t = 0.0)]
    epsilon: f64,

    /// Initial fill strategy.
    #[arg(long, value_enum, default_value_t = FillArg::Uniform)]
    fill: FillArg,

    /// Border band width as a fraction of the grid (biased-border fill).
    #[arg(long, default_value_t = 0.25)]
    border_fraction: f64,

    /// Bias subtracted from channels inside the border band.
    #[arg(long, default_value_t = 128)]
    bias: u8,

    /// Directory to write per-generation PNG snapshots into.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Generations between snapshots when --snapshot-dir is set.
    #[arg(long, default_value_t = 1)]
    snapshot_interval: u32,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum TopologyArg {
    L5,
    L9,
    C9,
    C13,
}

impl From<TopologyArg> for Topology {
    fn from(value: TopologyArg) -> Self {
        match value {
            TopologyArg::L5 => Self::L5,
            TopologyArg::L9 => Self::L9,
            TopologyArg::C9 => Self::C9,
            TopologyArg::C13 => Self::C13,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ReplacementArg {
    All,
    WorstInNeighborhood,
    OneParent,
}

impl From<ReplacementArg> for ReplacePolicy {
    fn from(value: ReplacementArg) -> Self {
        match value {
            ReplacementArg::All => Self::All,
            ReplacementArg::WorstInNeighborhood => Self::WorstInNeighborhood,
            ReplacementArg::OneParent => Self::OneParent,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum DisciplineArg {
    Synchronous,
    Asynchronous,
}

impl From<DisciplineArg> for Discipline {
    fn from(value: DisciplineArg) -> Self {
        match value {
            DisciplineArg::Synchronous => Self::Synchronous,
            DisciplineArg::Asynchronous => Self::Asynchronous,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum FillArg {
    Uniform,
    BiasedBorder,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = build_config(&cli);

    let mut engine = match &cli.snapshot_dir {
        Some(dir) => {
            let sink = PngSnapshotSink::new(dir.clone())
                .with_context(|| format!("preparing snapshot directory {}", dir.display()))?;
            EvolutionState::with_snapshot_sink(config, Box::new(sink))?
        }
        None => EvolutionState::new(config)?,
    };

    let outcome = engine.run();
    info!(
        converged = outcome.converged,
        generations = outcome.generations,
        score = outcome.final_score,
        "run finished",
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn build_config(cli: &Cli) -> EvolutionConfig {
    EvolutionConfig {
        rows: cli.rows,
        cols: cli.cols,
        topology: cli.neighborhood.into(),
        replacement: cli.replacement.into(),
        discipline: cli.discipline.into(),
        parallelism: match cli.workers {
            None => Parallelism::SingleThreaded,
            Some(0) => Parallelism::MultiWorker { workers: None },
            Some(workers) => Parallelism::MultiWorker {
                workers: Some(workers),
            },
        },
        generation_budget: cli.generations,
        fill: match cli.fill {
            FillArg::Uniform => FillStrategy::UniformRandom,
            FillArg::BiasedBorder => FillStrategy::BiasedBorderRandom {
                border_fraction: cli.border_fraction,
                bias: cli.bias,
            },
        },
        rng_seed: cli.seed,
        convergence_epsilon: cli.epsilon,
        snapshot_interval: if cli.snapshot_dir.is_some() {
            cli.snapshot_interval
        } else {
            0
        },
        ..EvolutionConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_declaration_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn workers_flag_maps_onto_parallelism() {
        let cli = Cli::parse_from(["cellga"]);
        assert_eq!(build_config(&cli).parallelism, Parallelism::SingleThreaded);

        let cli = Cli::parse_from(["cellga", "--workers", "0"]);
        assert_eq!(
            build_config(&cli).parallelism,
            Parallelism::MultiWorker { workers: None }
        );

        let cli = Cli::parse_from(["cellga", "--workers", "6"]);
        assert_eq!(
            build_config(&cli).parallelism,
            Parallelism::MultiWorker { workers: Some(6) }
        );
    }

    #[test]
    fn snapshot_interval_is_disabled_without_a_directory() {
        let cli = Cli::parse_from(["cellga", "--snapshot-interval", "5"]);
        assert_eq!(build_config(&cli).snapshot_interval, 0);

        let cli = Cli::parse_from([
            "cellga",
            "--snapshot-dir",
            "/tmp/frames",
            "--snapshot-interval",
            "5",
        ]);
        assert_eq!(build_config(&cli).snapshot_interval, 5);
    }

    #[test]
    fn enum_flags_map_onto_core_options() {
        let cli = Cli::parse_from([
            "cellga",
            "--neighborhood",
            "c13",
            "--replacement",
            "worst-in-neighborhood",
            "--discipline",
            "asynchronous",
            "--fill",
            "biased-border",
        ]);
        let config = build_config(&cli);
        assert_eq!(config.topology, Topology::C13);
        assert_eq!(config.replacement, ReplacePolicy::WorstInNeighborhood);
        assert_eq!(config.discipline, Discipline::Asynchronous);
        assert!(matches!(
            config.fill,
            FillStrategy::BiasedBorderRandom { bias: 128, .. }
        ));
    }
}
