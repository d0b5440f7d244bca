mod interactive;

use std::{collections::BTreeMap, fs::File, io::stdout, path::PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use core_sim::{
    branch_predictor::PredictorKind,
    common::CpuConfig,
    cpu::RunResult,
    decode_instr::decode,
    executable::Executable,
    io::LineOutput,
    sim::Simulator,
};

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// run a program under one or more branch predictors
    Run(RunArgs),
    /// print the micro-op expansion of every instruction
    List(ListArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    /// File path to input executable
    #[arg(short, long)]
    input: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// File path to input executable
    #[arg(short, long)]
    input: PathBuf,
    /// Branch predictor to simulate (repeatable; all of them if omitted)
    #[arg(short, long = "predictor")]
    predictors: Vec<PredictorKind>,
    /// Write the cycle numbers of every resolved branch as json
    #[arg(long)]
    json: Option<PathBuf>,
    /// Enable interactive mode (first predictor only)
    #[arg(long)]
    interactive: bool,
    /// Print what every stage did in each cycle
    #[arg(long)]
    trace: bool,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
    #[command(flatten)]
    sizes: SizeArgs,
}

/// Overrides on top of the defaults or `--config`.
#[derive(Args, Debug)]
struct SizeArgs {
    /// File path to a json `CpuConfig`
    #[arg(long)]
    config: Option<PathBuf>,
    /// Abort after this many cycles
    #[arg(long)]
    max_cycles: Option<usize>,
    #[arg(long)]
    rob: Option<usize>,
    #[arg(long)]
    pipeline: Option<usize>,
    #[arg(long)]
    memory: Option<usize>,
    #[arg(long)]
    btb: Option<usize>,
    #[arg(long)]
    direction: Option<usize>,
    #[arg(long)]
    ghr: Option<usize>,
    #[arg(long)]
    obq: Option<usize>,
}

impl SizeArgs {
    fn to_config(&self) -> Result<CpuConfig> {
        let mut config = match &self.config {
            Some(p) => CpuConfig::from_reader(File::open(p)?)?,
            None => CpuConfig::default(),
        };
        macro_rules! set {
            ($($arg:ident => $field:ident),*) => {
                $(if let Some(v) = self.$arg {
                    config.$field = v;
                })*
            };
        }
        set!(
            rob => rob_capacity,
            pipeline => pipeline_capacity,
            memory => memory_size,
            btb => btb_capacity,
            direction => direction_capacity,
            ghr => ghr_length,
            obq => obq_capacity
        );
        if self.max_cycles.is_some() {
            config.cycle_limit = self.max_cycles;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    match args.command {
        Command::Run(args) => {
            if args.verbose {
                env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                    .init();
            } else {
                env_logger::init();
            }
            run(args)
        }
        Command::List(ListArgs { input }) => {
            env_logger::init();
            let exe = read_input(input)?;
            for (addr, token) in exe.instructions() {
                let group = decode(token, false)?;
                let ops: Vec<_> = group.iter().map(|m| m.to_string()).collect();
                println!("{addr:>5}: {token:<24} {}", ops.join("; "));
            }
            Ok(())
        }
    }
}

fn run(args: RunArgs) -> Result<()> {
    let exe = read_input(args.input)?;
    let config = args.sizes.to_config()?;
    log::info!("loaded {} cells, config: {config:?}", exe.len());
    let kinds = if args.predictors.is_empty() {
        PredictorKind::ALL.to_vec()
    } else {
        args.predictors
    };
    let mut results = BTreeMap::new();
    for (i, kind) in kinds.into_iter().enumerate() {
        let mut sim = Simulator::new(&config, kind, &exe, LineOutput::new(stdout()))?;
        let result = if args.interactive && i == 0 {
            interactive::execute_interactive(&mut sim)?;
            sim.result().clone()
        } else if args.trace {
            sim.run_with(|_, trace| println!("{trace}"))?
        } else {
            sim.run()?
        };
        output_stat(&sim);
        println!("{}", summary(kind, sim.cycle(), &result));
        results.insert(kind.name(), result);
    }
    if let Some(path) = args.json {
        serde_json::to_writer_pretty(File::create(path)?, &results)?;
    }
    Ok(())
}

fn summary(kind: PredictorKind, cycles: usize, result: &RunResult) -> String {
    let accuracy = match result.accuracy() {
        Some(a) => format!("{:.2}%", a * 100.0),
        None => "-".to_string(),
    };
    format!(
        "{:<18} cycles: {cycles:>8}, predicted: {:>6}, mispredicted: {:>6}, accuracy: {accuracy:>7}",
        kind.name(),
        result.predicted.len(),
        result.mispredicted.len(),
    )
}

#[cfg(not(feature = "stat"))]
fn output_stat<O>(_: &Simulator<O>) {}

#[cfg(feature = "stat")]
fn output_stat<O>(sim: &Simulator<O>) {
    let max_width = get_terminal_width().unwrap_or(120) as usize;
    log::info!("statistics:\n{}", sim.collect_stat().view(max_width));
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

fn read_input(input: PathBuf) -> Result<Executable> {
    let file = File::open(input)?;
    Executable::from_reader(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_overrides() {
        let cli = Cli::parse_from([
            "bpsim", "run", "-i", "a.json", "-p", "gshare", "-p", "one-bit", "--rob", "8",
            "--max-cycles", "100",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(
            args.predictors,
            vec![PredictorKind::Gshare, PredictorKind::OneBit]
        );
        let config = args.sizes.to_config().unwrap();
        assert_eq!(config.rob_capacity, 8);
        assert_eq!(config.pipeline_capacity, 16);
        assert_eq!(config.cycle_limit, Some(100));
    }

    #[test]
    fn test_rejects_small_rob() {
        let cli = Cli::parse_from(["bpsim", "run", "-i", "a.json", "--rob", "2"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.sizes.to_config().is_err());
    }

    #[test]
    fn test_summary() {
        let result = RunResult {
            predicted: vec![7, 9, 11],
            mispredicted: vec![3],
        };
        let line = summary(PredictorKind::TwoBit, 40, &result);
        assert!(line.starts_with("two-bit"));
        assert!(line.contains("accuracy:  75.00%"));
        let line = summary(PredictorKind::Gshare, 5, &RunResult::default());
        assert!(line.ends_with("accuracy:       -"));
    }
}
