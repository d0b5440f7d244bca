use anyhow::{anyhow, Result};

use crate::{
    branch_predictor::PredictorKind,
    common::{CpuConfig, ExecuteMode, SimulationOption, Watchings},
    cpu::{self, Cpu, CycleTrace, RunResult, RuntimeError},
    executable::Executable,
    io::Output,
    memory::{Addr, Cell},
    register::{RegRef, RegisterError},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

/// Called after every cycle with the processor state it left behind.
pub type Observer<'a, O> = dyn FnMut(&Cpu<O>, &CycleTrace) + 'a;

pub struct Simulator<O> {
    cpu: Cpu<O>,
    kind: PredictorKind,
    fatal_error: Option<RuntimeError>,
    last_trace: Option<CycleTrace>,
    #[cfg(feature = "stat")]
    stat_builder: stat::SimStatBuilder,
}

pub struct SimOutput<O> {
    pub cpu_output: O,
    pub result: RunResult,
}

impl<O: Output> Simulator<O> {
    pub fn new(
        config: &CpuConfig,
        kind: PredictorKind,
        exe: &Executable,
        output: O,
    ) -> Result<Self> {
        log::info!("predictor: {kind}");
        Ok(Self {
            cpu: Cpu::new(config, kind, exe, output)?,
            kind,
            fatal_error: None,
            last_trace: None,
            #[cfg(feature = "stat")]
            stat_builder: stat::SimStatBuilder::new(),
        })
    }
    pub fn into_output(self) -> SimOutput<O> {
        let cpu_output = self.cpu.into_output();
        SimOutput {
            cpu_output: cpu_output.value,
            result: cpu_output.result,
        }
    }
}

impl<O> Simulator<O> {
    #[cfg(feature = "stat")]
    pub fn collect_stat(&self) -> Stats {
        let mut ss = Stats::default();
        self.add_stats(&mut ss);
        ss
    }
}

#[cfg(feature = "stat")]
impl<O> AddStats for Simulator<O> {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat_builder.finish()));
        self.cpu.add_stats(buf);
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::{fmt, time};

    use crate::stat::*;

    pub struct SimStatBuilder {
        begin: time::Instant,
        cycle: Option<usize>,
        elapsed: Option<time::Duration>,
    }

    impl SimStatBuilder {
        pub fn new() -> Self {
            Self {
                begin: time::Instant::now(),
                cycle: None,
                elapsed: None,
            }
        }
        pub fn cycle(&mut self, cycle: usize) {
            self.cycle = Some(cycle)
        }
        pub fn stop_timer(&mut self) {
            self.elapsed = Some(time::Instant::now() - self.begin)
        }
        /// A run that has not exited yet reports the time so far.
        pub fn finish(&self) -> SimStat {
            SimStat {
                cycle: self.cycle.unwrap_or(0),
                elapsed: self
                    .elapsed
                    .unwrap_or_else(|| time::Instant::now() - self.begin),
            }
        }
    }

    impl Default for SimStatBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    pub struct SimStat {
        cycle: usize,
        elapsed: time::Duration,
    }

    impl Stat for SimStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ SimStat {
        fn header(&self) -> &'static str {
            "simulator stat"
        }
        fn width(&self) -> usize {
            33
        }
    }

    impl fmt::Display for &'_ SimStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let ms = format!("{} ms", self.elapsed.as_millis());
            writeln!(f, "  elapsed total: {ms:>9}")?;
            let cycle = format!("#{}", self.cycle);
            writeln!(f, "  cycles total: {cycle:>10}")
        }
    }
}

impl<O: Output> Simulator<O> {
    fn gather_watchings(&self, Watchings { reg, memory }: &Watchings) -> WatchingValues {
        let mut watchings: WatchingValues = Default::default();
        for &r in reg {
            watchings.reg_map.push((r, self.cpu.get_reg(r)));
        }
        for &addr in memory {
            watchings
                .memory_map
                .push((addr, self.cpu.memory().get(addr).ok().cloned()));
        }
        watchings
    }
    fn break_sim(&self, opt: &SimulationOption, reason: BreakReason) -> Result<ControlFlow> {
        Ok(ControlFlow::Break(OnBreak {
            watchings: self.gather_watchings(&opt.watchings),
            reason,
        }))
    }
    fn exit_sim(&mut self) {
        #[cfg(feature = "stat")]
        {
            self.stat_builder.cycle(self.cpu.cycle());
            self.stat_builder.stop_timer();
        }
        let result = self.cpu.result();
        log::info!(
            "{}: exited after {} cycles, {} predicted, {} mispredicted",
            self.kind,
            self.cpu.cycle(),
            result.predicted.len(),
            result.mispredicted.len()
        );
    }
    /// Runs one cycle, keeping any error that makes the run unrecoverable.
    fn try_cycle(&mut self) -> Result<cpu::CycleResult, String> {
        if let Some(e) = &self.fatal_error {
            return Err(format!("cannot restart after: {e}"));
        }
        self.cpu.cycle_one().map_err(|e| {
            let msg = e.to_string();
            log::error!("#{}: {msg}", self.cpu.cycle());
            if e.level().is_fatal() {
                self.fatal_error = Some(e);
            }
            msg
        })
    }

    /// Advances the simulation as `opt.mode` asks. The observer sees every
    /// cycle when `opt.do_trace` is set.
    pub fn single_cycle(
        &mut self,
        opt: &SimulationOption,
        observer: &mut Observer<'_, O>,
    ) -> Result<ControlFlow> {
        macro_rules! break_sim {
            ($reason:expr) => {
                return self.break_sim(opt, $reason)
            };
        }
        if self.fatal_error.is_some() {
            break_sim!(BreakReason::CannotRestart)
        }
        let mut is_enter = true;
        macro_rules! execute {
            () => {
                is_enter = false;
                let r = match self.try_cycle() {
                    Ok(r) => r,
                    Err(_) => break_sim!(BreakReason::Failed),
                };
                if opt.do_trace {
                    observer(&self.cpu, &r.trace);
                }
                let hit = opt
                    .breakpoints
                    .values()
                    .find(|bp| bp.hits(r.trace.cycle, r.trace.executed.as_ref()))
                    .map(|bp| bp.id);
                let flow = r.flow;
                self.last_trace = Some(r.trace);
                if flow == cpu::ControlFlow::Exit {
                    self.exit_sim();
                    return Ok(ControlFlow::Exit);
                }
                if let Some(id) = hit {
                    break_sim!(BreakReason::BreakPoint(id));
                }
            };
        }

        match &opt.mode {
            ExecuteMode::SkipUntil { cycle } => loop {
                if !is_enter && self.cpu.cycle() >= *cycle {
                    break_sim!(BreakReason::Reached(*cycle));
                }
                execute!();
            },
            ExecuteMode::Run => loop {
                execute!();
            },
            ExecuteMode::RunStep(r) => {
                for _ in 0..r.get_step() {
                    execute!();
                }
                break_sim!(BreakReason::StepEnded)
            }
        }
    }

    /// Runs to exit, handing every cycle to `observer`.
    pub fn run_with(
        &mut self,
        mut observer: impl FnMut(&Cpu<O>, &CycleTrace),
    ) -> Result<RunResult> {
        loop {
            let r = self.try_cycle().map_err(|e| anyhow!(e))?;
            observer(&self.cpu, &r.trace);
            let flow = r.flow;
            self.last_trace = Some(r.trace);
            if flow == cpu::ControlFlow::Exit {
                self.exit_sim();
                return Ok(self.cpu.result().clone());
            }
        }
    }

    pub fn run(&mut self) -> Result<RunResult> {
        self.run_with(|_, _| {})
    }

    pub fn cpu(&self) -> &Cpu<O> {
        &self.cpu
    }

    pub fn kind(&self) -> PredictorKind {
        self.kind
    }

    pub fn cycle(&self) -> usize {
        self.cpu.cycle()
    }

    pub fn result(&self) -> &RunResult {
        self.cpu.result()
    }

    pub fn last_trace(&self) -> Option<&CycleTrace> {
        self.last_trace.as_ref()
    }

    pub fn get_error_msg(&self) -> Option<String> {
        self.fatal_error.as_ref().map(|e| format!("{e}"))
    }
}

pub enum ControlFlow {
    Break(OnBreak),
    Exit,
}

pub enum ExitCode {
    Success,
    Failure,
}

impl ExitCode {
    /// Returns `true` if the exit code is [`Success`].
    ///
    /// [`Success`]: ExitCode::Success
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl ControlFlow {
    pub fn exit_code(&self) -> Option<ExitCode> {
        if let Self::Exit = self {
            Some(ExitCode::Success)
        } else if let Self::Break(OnBreak {
            reason: BreakReason::CannotRestart | BreakReason::Failed,
            ..
        }) = self
        {
            Some(ExitCode::Failure)
        } else {
            None
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BreakReason {
    CannotRestart,
    Failed,
    Reached(usize),
    StepEnded,
    /// id of the breakpoint
    BreakPoint(usize),
}

pub struct OnBreak {
    pub watchings: WatchingValues,
    pub reason: BreakReason,
}

#[derive(Default)]
pub struct WatchingValues {
    pub reg_map: Vec<(RegRef, Result<u64, RegisterError>)>,
    pub memory_map: Vec<(Addr, Option<Cell>)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        breakpoint::{BreakPoint, BreakPointCond},
        common::RunStep,
        instr::MicroOpcode,
        io::BufferedOutput,
        register::RegId,
    };

    fn countdown() -> Executable {
        Executable::from_parts(
            [
                "mov rcx 3",
                "dec rcx",
                "cmp rcx 0",
                "jg 3",
                "mov rsi 12",
                "mov rdx 1",
                "mov rax 1",
                "syscall",
                "mov rax 60",
                "syscall",
            ],
            [42],
        )
    }

    fn sim(kind: PredictorKind, exe: &Executable) -> Simulator<BufferedOutput> {
        let config = CpuConfig {
            cycle_limit: Some(1000),
            ..Default::default()
        };
        Simulator::new(&config, kind, exe, BufferedOutput::new()).unwrap()
    }

    fn reason(flow: ControlFlow) -> BreakReason {
        match flow {
            ControlFlow::Break(b) => b.reason,
            ControlFlow::Exit => panic!("unexpected exit"),
        }
    }

    #[test]
    fn test_run() {
        let mut sim = sim(PredictorKind::TwoBit, &countdown());
        let mut seen = 0;
        let result = sim.run_with(|_, _| seen += 1).unwrap();
        assert_eq!(seen, sim.cycle());
        assert_eq!(result.branches(), 3);
        assert_eq!(&result, sim.result());
        let out = sim.into_output();
        assert_eq!(out.cpu_output.into_inner(), vec![Cell::Word(42)]);
        assert_eq!(out.result, result);
    }

    #[test]
    fn test_step_and_until() {
        let mut sim = sim(PredictorKind::Gshare, &countdown());
        let opt = SimulationOption {
            mode: ExecuteMode::RunStep(RunStep::new(Some(3))),
            ..Default::default()
        };
        let flow = sim.single_cycle(&opt, &mut |_, _| {}).unwrap();
        assert_eq!(reason(flow), BreakReason::StepEnded);
        assert_eq!(sim.cycle(), 3);
        let opt = SimulationOption {
            mode: ExecuteMode::SkipUntil { cycle: 8 },
            ..Default::default()
        };
        let flow = sim.single_cycle(&opt, &mut |_, _| {}).unwrap();
        assert_eq!(reason(flow), BreakReason::Reached(8));
        assert_eq!(sim.cycle(), 8);
        assert_eq!(sim.last_trace().map(|t| t.cycle), Some(7));
    }

    #[test]
    fn test_breakpoints_and_watchings() {
        let mut sim = sim(PredictorKind::AlwaysTaken, &countdown());
        let mut opt = SimulationOption {
            do_trace: true,
            ..Default::default()
        };
        opt.breakpoints.insert(
            0,
            BreakPoint::new(0, BreakPointCond::Opcode(MicroOpcode::Jmp)),
        );
        opt.watchings.reg.push(RegId::RCX.full());
        opt.watchings.memory.push(Addr::new(12));
        let mut traced = 0;
        let flow = sim.single_cycle(&opt, &mut |_, _| traced += 1).unwrap();
        let ControlFlow::Break(on_break) = flow else {
            panic!("expected a break");
        };
        assert_eq!(on_break.reason, BreakReason::BreakPoint(0));
        assert_eq!(traced, sim.cycle());
        let executed = sim.last_trace().and_then(|t| t.executed.as_ref()).unwrap();
        assert_eq!(executed.opcode, MicroOpcode::Jmp);
        let (r, v) = &on_break.watchings.reg_map[0];
        assert_eq!(*r, RegId::RCX.full());
        assert_eq!(v, &Ok(2));
        assert_eq!(
            on_break.watchings.memory_map,
            vec![(Addr::new(12), Some(Cell::Word(42)))]
        );

        // then run to the end, ignoring a breakpoint that already fired
        opt.breakpoints.clear();
        opt.breakpoints
            .insert(1, BreakPoint::new(1, BreakPointCond::Cycle(0)));
        let flow = sim.single_cycle(&opt, &mut |_, _| {}).unwrap();
        assert!(flow.exit_code().unwrap().is_success());
        assert_eq!(sim.result().branches(), 3);
    }

    #[test]
    fn test_failure_cannot_restart() {
        let exe = Executable::from_parts(["frob rax"], []);
        let mut sim = sim(PredictorKind::OneBit, &exe);
        let opt = SimulationOption::default();
        let flow = sim.single_cycle(&opt, &mut |_, _| {}).unwrap();
        assert!(!flow.exit_code().unwrap().is_success());
        assert_eq!(reason(flow), BreakReason::Failed);
        assert!(sim.get_error_msg().unwrap().contains("frob"));
        let flow = sim.single_cycle(&opt, &mut |_, _| {}).unwrap();
        assert_eq!(reason(flow), BreakReason::CannotRestart);
        assert!(sim.run().is_err());
    }
}
