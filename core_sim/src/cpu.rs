use std::fmt;

use num_enum::TryFromPrimitive;
use serde::Serialize;
use thiserror::Error;

use crate::{
    agu::{self, AguError},
    branch_predictor::{BranchPredictor, PredictorKind},
    circular::BufferError,
    common::{ConfigError, CpuConfig, Stage},
    decode_instr::{decode, DecodeError},
    executable::{Executable, LoadError},
    instr::{MicroOp, MicroOpcode, Operand},
    io::Output,
    memory::{Addr, Cell, Memory, MemoryAccessError, MemoryView},
    pipeline::{InFlight, ReorderEntry, Successor},
    reg_file::{acc, Flags, RegFile, RegFileView},
    register::{RegId, RegRef, RegisterError, Width},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

/// appended to `cir` when the instruction was fetched on a predicted-taken path
const SPECULATIVE_MARK: char = '*';
/// fetched in place of anything outside the text section
const NOOP_TOKEN: &str = "noop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum SyscallNumber {
    Write = 1,
    Exit = 60,
}

/// Cycle numbers on which branches resolved, split by prediction outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunResult {
    pub predicted: Vec<usize>,
    pub mispredicted: Vec<usize>,
}

impl RunResult {
    pub fn branches(&self) -> usize {
        self.predicted.len() + self.mispredicted.len()
    }
    /// share of correctly predicted branches; `None` when no branch resolved.
    pub fn accuracy(&self) -> Option<f64> {
        let total = self.branches();
        (total != 0).then(|| self.predicted.len() as f64 / total as f64)
    }
}

pub struct Cpu<O> {
    reg_file: RegFile,
    memory: Memory,
    in_flight: InFlight,
    predictor: BranchPredictor,
    output: O,
    running: bool,
    stalled: Stage,
    cycle: usize,
    cycle_limit: Option<usize>,
    result: RunResult,
    #[cfg(feature = "stat")]
    pub m_stat: stat::MicroOpStat,
    #[cfg(feature = "stat")]
    pub b_stat: stat::BranchStat,
    #[cfg(feature = "stat")]
    pub p_stat: stat::PipelineStat,
}

pub struct CpuOutput<O> {
    pub value: O,
    pub result: RunResult,
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    MemoryAccessError(#[from] MemoryAccessError),
    #[error(transparent)]
    RegisterError(#[from] RegisterError),
    #[error(transparent)]
    DecodeError(#[from] DecodeError),
    #[error(transparent)]
    AguError(#[from] AguError),
    #[error(transparent)]
    BufferError(#[from] BufferError),
    #[error(transparent)]
    LoadError(#[from] LoadError),
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
    #[error("`{0}` has no operand it can act on")]
    UnexpectedOperand(String),
    #[error("cycle limit of {0} reached before exit")]
    CycleLimit(usize),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl RuntimeError {
    pub fn level(&self) -> RuntimeErrorLevel {
        RuntimeErrorLevel::Fatal
    }
}

pub enum RuntimeErrorLevel {
    /// cannot restart, but program need not halt
    Fatal,
}

impl RuntimeErrorLevel {
    /// Returns `true` if the runtime error level is [`Fatal`].
    ///
    /// [`Fatal`]: RuntimeErrorLevel::Fatal
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal)
    }
}

type Result<T, E = RuntimeError> = std::result::Result<T, E>;

impl<O: Output> Cpu<O> {
    /// Loads `exe` at address 0 and points `rip` at its first instruction.
    pub fn new(
        config: &CpuConfig,
        kind: PredictorKind,
        exe: &Executable,
        output: O,
    ) -> Result<Self> {
        config.validate()?;
        if exe.len() > config.memory_size {
            return Err(LoadError::TooLarge {
                len: exe.len(),
                capacity: config.memory_size,
            }
            .into());
        }
        let text = exe.text_range();
        log::info!(".text: cells {}..{}", text.start, text.end);
        log::info!(".data: cells {}..{}", text.end, exe.len());
        let mut memory = Memory::new(config.memory_size);
        memory.init_from_slice(exe.cells(), text.clone())?;
        let mut reg_file = RegFile::new();
        reg_file.set(RegId::CS.full(), text.start as u64);
        reg_file.set(RegId::DS.full(), text.end as u64);
        reg_file.set(RegId::RIP.full(), text.start as u64);
        Ok(Self {
            reg_file,
            memory,
            in_flight: InFlight::new(config.rob_capacity, config.pipeline_capacity),
            predictor: BranchPredictor::new(kind, config),
            output,
            running: true,
            stalled: Stage::Decode | Stage::Execute,
            cycle: 0,
            cycle_limit: config.cycle_limit,
            result: RunResult::default(),
            #[cfg(feature = "stat")]
            m_stat: Default::default(),
            #[cfg(feature = "stat")]
            b_stat: Default::default(),
            #[cfg(feature = "stat")]
            p_stat: Default::default(),
        })
    }
    pub fn into_output(self) -> CpuOutput<O> {
        CpuOutput {
            value: self.output,
            result: self.result,
        }
    }
}

#[cfg(feature = "stat")]
impl<O> AddStats for Cpu<O> {
    fn add_stats(&self, buf: &mut Stats) {
        self.memory.add_stats(buf);
        self.reg_file.add_stats(buf);
        buf.push(Box::new(self.m_stat));
        buf.push(Box::new(self.b_stat));
        buf.push(Box::new(self.p_stat));
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use super::*;
    use crate::stat::*;

    const CELL_WIDTH: usize = 21;

    #[derive(Clone, Copy, Default)]
    pub struct MicroOpStat {
        /// index by MicroOpcode::index()
        executed: [usize; MicroOpcode::COUNT],
    }

    impl MicroOpStat {
        pub fn encounter(&mut self, op: MicroOpcode) {
            self.executed[op.index()] += 1;
        }
    }

    impl Stat for MicroOpStat {
        fn view(&self, max_width: usize) -> Box<dyn StatView + '_> {
            Box::new(MicroOpStatView {
                stat: self,
                per_row: columns(CELL_WIDTH, max_width),
            })
        }
    }

    pub struct MicroOpStatView<'a> {
        stat: &'a MicroOpStat,
        per_row: usize,
    }

    impl StatView for MicroOpStatView<'_> {
        fn header(&self) -> &'static str {
            "executed micro-ops"
        }
        fn width(&self) -> usize {
            self.per_row * CELL_WIDTH + (self.per_row - 1) * 2 + 2
        }
    }

    impl fmt::Display for MicroOpStatView<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let cells: Vec<_> = (0..MicroOpcode::COUNT as u8)
                .filter_map(|i| {
                    let op = MicroOpcode::try_from(i).ok()?;
                    let name = op.to_string();
                    let count = self.stat.executed[op.index()];
                    Some(format!("{name:>8}: {count:>11}"))
                })
                .collect();
            write_rows(f, &cells, self.per_row)
        }
    }

    #[derive(Clone, Copy, Default)]
    pub struct BranchStat {
        taken_correct: usize,
        taken_wrong: usize,
        untaken_correct: usize,
        untaken_wrong: usize,
    }

    impl BranchStat {
        pub fn update_stat(&mut self, taken: bool, correct: bool) {
            match (taken, correct) {
                (true, true) => self.taken_correct += 1,
                (true, false) => self.taken_wrong += 1,
                (false, true) => self.untaken_correct += 1,
                (false, false) => self.untaken_wrong += 1,
            }
        }
    }

    impl Stat for BranchStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ BranchStat {
        fn header(&self) -> &'static str {
            "branch count"
        }
        fn width(&self) -> usize {
            33
        }
    }

    impl fmt::Display for &'_ BranchStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let taken = self.taken_correct + self.taken_wrong;
            let untaken = self.untaken_correct + self.untaken_wrong;
            let correct = self.taken_correct + self.untaken_correct;
            let total = taken + untaken;
            let t_pct = format!("{:.6}", percent(taken, total));
            let u_pct = format!("{:.6}", percent(untaken, total));
            let p_pct = format!("{:.6}", percent(correct, total));
            writeln!(f, "         taken: {taken:>10} ({t_pct:>10}%)")?;
            writeln!(f, "       untaken: {untaken:>10} ({u_pct:>10}%)")?;
            writeln!(f, "  pred correct: {correct:>10} ({p_pct:>10}%)")
        }
    }

    #[derive(Clone, Copy, Default)]
    pub struct PipelineStat {
        pub flushes: usize,
        pub fetch_stalls: usize,
    }

    impl Stat for PipelineStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ PipelineStat {
        fn header(&self) -> &'static str {
            "pipeline events"
        }
        fn width(&self) -> usize {
            33
        }
    }

    impl fmt::Display for &'_ PipelineStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "       flushes: {:>10}", self.flushes)?;
            writeln!(f, "  fetch stalls: {:>10}", self.fetch_stalls)
        }
    }
}

impl<O: Output> Cpu<O> {
    fn fetch(&mut self) -> Result<Fetched> {
        let pc = self.reg_file.get(RegId::RIP.full())?;
        let pass_through = self.predictor.is_stalled();
        let location = self.predictor.predict(pc)?;
        // the first fetch after a redirect is the resolved target itself
        let speculative = !pass_through && location != pc + 1;
        self.reg_file.set(RegId::RIP.full(), location);
        self.reg_file.set(RegId::MAR.full(), location);

        let cs = self.reg_file.get(RegId::CS.full())?;
        let ds = self.reg_file.get(RegId::DS.full())?;
        let token = if (cs..ds).contains(&location) {
            self.memory
                .get_token(Addr::try_from(location)?)?
                .to_string()
        } else {
            NOOP_TOKEN.to_string()
        };
        self.reg_file.set_text(RegId::MBR, token.clone());
        let cir = if speculative {
            format!("{token}{SPECULATIVE_MARK}")
        } else {
            token.clone()
        };
        self.reg_file.set_text(RegId::CIR, cir);
        self.stalled &= !Stage::Decode;
        log::trace!("#{}: fetched `{token}` from {location}", self.cycle);
        Ok(Fetched {
            location,
            token,
            speculative,
        })
    }

    /// `None` when the buffers cannot take the whole group this cycle.
    fn decode(&mut self) -> Result<Option<Decoded>> {
        let cir = self
            .reg_file
            .get_text(RegId::CIR)
            .unwrap_or_default()
            .to_string();
        let (instr, speculative) = match cir.strip_suffix(SPECULATIVE_MARK) {
            Some(instr) => (instr, true),
            None => (cir.as_str(), false),
        };
        let group = decode(instr, speculative)?;
        if self.in_flight.free() < group.len() {
            log::debug!("#{}: no room for `{instr}`, fetch stalled", self.cycle);
            #[cfg(feature = "stat")]
            {
                self.p_stat.fetch_stalls += 1;
            }
            self.stalled |= Stage::Fetch;
            return Ok(None);
        }
        let location = self.reg_file.get(RegId::MAR.full())?;
        self.in_flight.issue(&group, location)?;
        self.stalled &= !(Stage::Fetch | Stage::Execute);
        // consumed; the next fetch hands over a new instruction
        self.stalled |= Stage::Decode;
        Ok(Some(Decoded {
            location,
            instr: instr.to_string(),
            group,
        }))
    }

    fn execute(&mut self, trace: &mut CycleTrace) -> Result<ControlFlow> {
        let Some((op, entry)) = self.in_flight.head() else {
            self.stalled |= Stage::Execute;
            return Ok(ControlFlow::Continue);
        };
        let (op, entry) = (op.clone(), entry.clone());
        log::trace!("#{}: executing {op} from {}", self.cycle, entry.location);

        let mut flow = ControlFlow::Continue;
        match op.opcode {
            MicroOpcode::Load => {
                let value = self.read_operand(&op)?;
                self.reg_file.set(acc(Width::Quad), value as u64);
            }
            MicroOpcode::Sto => {
                let value = self.reg_file.get(acc(op.width))?;
                self.write_operand(&op, value)?;
            }
            MicroOpcode::Add | MicroOpcode::Sub => {
                let value = self.read_operand(&op)?;
                let a = self.reg_file.get_i(acc(Width::Quad))?;
                let result = if op.opcode == MicroOpcode::Add {
                    a.wrapping_add(value)
                } else {
                    a.wrapping_sub(value)
                };
                self.reg_file.set(acc(Width::Quad), result as u64);
            }
            MicroOpcode::Cmp => {
                let value = self.read_operand(&op)?;
                let a = self.reg_file.get_i(acc(Width::Quad))?;
                self.reg_file.set_flags(Flags::of(a.wrapping_sub(value)));
            }
            MicroOpcode::Jmp => {
                // the group after a JMP is issued no later than the cycle
                // the JMP's own LOAD retires
                let Some(successor) = entry.successor else {
                    log::warn!(
                        "#{}: branch at {} has no successor yet",
                        self.cycle,
                        entry.location
                    );
                    return Ok(ControlFlow::Continue);
                };
                trace.branch = Some(self.resolve_branch(&op, &entry, successor)?);
            }
            MicroOpcode::Syscall => flow = self.syscall()?,
            MicroOpcode::Noop => {}
        }
        #[cfg(feature = "stat")]
        self.m_stat.encounter(op.opcode);
        // no-op when the micro-op flushed the buffers
        self.in_flight.retire();
        trace.executed = Some(op);
        Ok(flow)
    }

    fn effective_address(&self, expr: &str) -> Result<Addr> {
        let addr = agu::generate(expr, &self.reg_file)?;
        Ok(Addr::try_from(addr)?)
    }

    /// Register sources are read no wider than the micro-op width.
    fn read_operand(&self, op: &MicroOp) -> Result<i64> {
        Ok(match &op.operand {
            Operand::Register(r) => {
                self.reg_file.get(RegRef::new(r.id, r.width.min(op.width)))? as i64
            }
            Operand::Memory(expr) => self.memory.get_word(self.effective_address(expr)?)?,
            Operand::Immediate(imm) => *imm,
            Operand::Condition(_) | Operand::None => {
                return Err(RuntimeError::UnexpectedOperand(op.to_string()))
            }
        })
    }

    fn write_operand(&mut self, op: &MicroOp, value: u64) -> Result<()> {
        match &op.operand {
            Operand::Register(r) => self.reg_file.set(*r, value),
            Operand::Memory(expr) => {
                let addr = self.effective_address(expr)?;
                self.memory.set(addr, Cell::Word(value as i64))?;
            }
            Operand::Immediate(_) | Operand::Condition(_) | Operand::None => {
                return Err(RuntimeError::UnexpectedOperand(op.to_string()))
            }
        }
        Ok(())
    }

    /// The branch was predicted correctly iff its successor was fetched from
    /// the address the branch actually continues at.
    fn resolve_branch(
        &mut self,
        op: &MicroOp,
        entry: &ReorderEntry,
        successor: Successor,
    ) -> Result<BranchOutcome> {
        let Operand::Condition(cond) = &op.operand else {
            return Err(RuntimeError::UnexpectedOperand(op.to_string()));
        };
        let taken = cond.is_met(self.reg_file.flags());
        let target = Addr::try_from(self.reg_file.get_i(acc(Width::Quad))?)?.inner() as u64;
        let actual = if taken { target } else { entry.location + 1 };
        let mispredicted = successor.location != actual;

        self.predictor.update(entry.location, target, taken)?;
        if mispredicted {
            log::debug!(
                "#{}: branch at {} mispredicted, redirecting to {actual}",
                self.cycle,
                entry.location
            );
            self.flush();
            self.reg_file.set(RegId::RIP.full(), actual);
            self.predictor.stall()?;
            self.result.mispredicted.push(self.cycle);
        } else {
            log::debug!("#{}: branch at {} predicted", self.cycle, entry.location);
            self.result.predicted.push(self.cycle);
        }
        #[cfg(feature = "stat")]
        self.b_stat.update_stat(taken, !mispredicted);
        Ok(BranchOutcome {
            location: entry.location,
            target: actual,
            taken,
            mispredicted,
        })
    }

    fn syscall(&mut self) -> Result<ControlFlow> {
        let number = self.reg_file.get(acc(Width::Byte))? as u8;
        match SyscallNumber::try_from(number) {
            Ok(SyscallNumber::Write) => {
                let start = Addr::try_from(self.reg_file.get_i(RegId::RSI.full())?)?;
                let len = self.reg_file.get(RegId::RDX.full())? as usize;
                let cells = self.memory.slice(start, len)?;
                self.output.write_cells(cells)?;
                Ok(ControlFlow::Continue)
            }
            Ok(SyscallNumber::Exit) => {
                log::info!("exit at cycle #{}", self.cycle);
                self.running = false;
                self.flush();
                Ok(ControlFlow::Exit)
            }
            Err(_) => {
                log::warn!("#{}: unknown syscall {number} ignored", self.cycle);
                Ok(ControlFlow::Continue)
            }
        }
    }

    /// Empties both buffers and the fetch registers and stalls every stage.
    fn flush(&mut self) {
        self.in_flight.flush();
        self.reg_file.set(RegId::MAR.full(), 0);
        self.reg_file.set_text(RegId::MBR, "");
        self.reg_file.set_text(RegId::CIR, "");
        self.stalled = Stage::Fetch | Stage::Decode | Stage::Execute;
        #[cfg(feature = "stat")]
        {
            self.p_stat.flushes += 1;
        }
    }

    /// Runs execute, decode and fetch once, in that order.
    pub fn cycle_one(&mut self) -> Result<CycleResult> {
        let mut res = CycleResult {
            trace: CycleTrace {
                cycle: self.cycle,
                ..Default::default()
            },
            ..Default::default()
        };
        if !self.running {
            res.flow = ControlFlow::Exit;
            return Ok(res);
        }
        if let Some(limit) = self.cycle_limit {
            if self.cycle >= limit {
                return Err(RuntimeError::CycleLimit(limit));
            }
        }
        if !self.stalled.contains(Stage::Execute) {
            res.flow = self.execute(&mut res.trace)?;
        }
        if !self.stalled.contains(Stage::Decode) {
            res.trace.decoded = self.decode()?;
        }
        if self.stalled.contains(Stage::Fetch) {
            res.trace.fetch_stalled = true;
        } else {
            res.trace.fetched = Some(self.fetch()?);
        }
        debug_assert_eq!(
            self.in_flight.rob().size(),
            self.in_flight.pipeline().size()
        );
        // fetch stalls last a single cycle
        self.stalled &= !Stage::Fetch;
        self.cycle += 1;
        Ok(res)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// cycles completed so far
    pub fn cycle(&self) -> usize {
        self.cycle
    }

    pub fn result(&self) -> &RunResult {
        &self.result
    }

    pub fn stalled(&self) -> Stage {
        self.stalled
    }

    pub fn get_reg(&self, r: RegRef) -> Result<u64, RegisterError> {
        self.reg_file.get(r)
    }

    pub fn reg_file(&self) -> &RegFile {
        &self.reg_file
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn predictor(&self) -> &BranchPredictor {
        &self.predictor
    }

    pub fn get_regfile_view(&self, chunk_size: usize) -> RegFileView<'_> {
        self.reg_file.get_view(chunk_size)
    }

    pub fn get_mem_view(&self, start: Addr, len: usize) -> MemoryView<'_> {
        self.memory.get_view(start, len)
    }
}

pub struct Fetched {
    pub location: u64,
    pub token: String,
    pub speculative: bool,
}

pub struct Decoded {
    pub location: u64,
    pub instr: String,
    pub group: Vec<MicroOp>,
}

pub struct BranchOutcome {
    pub location: u64,
    /// where execution continues
    pub target: u64,
    pub taken: bool,
    pub mispredicted: bool,
}

/// What each stage did during one cycle.
#[derive(Default)]
pub struct CycleTrace {
    pub cycle: usize,
    pub fetched: Option<Fetched>,
    pub fetch_stalled: bool,
    pub decoded: Option<Decoded>,
    pub executed: Option<MicroOp>,
    pub branch: Option<BranchOutcome>,
}

impl fmt::Display for CycleTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:010}, fetch: ", self.cycle)?;
        match &self.fetched {
            Some(Fetched {
                location,
                token,
                speculative,
            }) => write!(
                f,
                "`{token}` @{location}{}",
                if *speculative { " *" } else { "" }
            )?,
            None if self.fetch_stalled => write!(f, "stalled")?,
            None => write!(f, "-")?,
        }
        write!(f, ",\tdecode: ")?;
        match &self.decoded {
            Some(d) => {
                let ops: Vec<_> = d.group.iter().map(|m| m.to_string()).collect();
                write!(f, "`{}` -> [{}]", d.instr, ops.join("; "))?
            }
            None => write!(f, "-")?,
        }
        write!(f, ",\texecute: ")?;
        match &self.executed {
            Some(op) => write!(f, "{op}")?,
            None => write!(f, "-")?,
        }
        if let Some(b) = &self.branch {
            write!(
                f,
                " ({}, {} to {})",
                if b.mispredicted { "mispredicted" } else { "predicted" },
                if b.taken { "taken" } else { "not taken" },
                b.target
            )?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CycleResult {
    pub trace: CycleTrace,
    pub flow: ControlFlow,
}

#[derive(Default, Debug, PartialEq, Eq)]
pub enum ControlFlow {
    #[default]
    Continue,
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BufferedOutput;

    fn cpu(kind: PredictorKind, text: &[&str], data: &[i64]) -> Cpu<BufferedOutput> {
        let config = CpuConfig {
            cycle_limit: Some(500),
            ..Default::default()
        };
        cpu_with(&config, kind, text, data)
    }

    fn cpu_with(
        config: &CpuConfig,
        kind: PredictorKind,
        text: &[&str],
        data: &[i64],
    ) -> Cpu<BufferedOutput> {
        let exe = Executable::from_parts(text.iter().copied(), data.iter().copied());
        Cpu::new(config, kind, &exe, BufferedOutput::new()).unwrap()
    }

    fn run_to_exit(cpu: &mut Cpu<BufferedOutput>) {
        while cpu.cycle_one().unwrap().flow != ControlFlow::Exit {}
    }

    fn reg(cpu: &Cpu<BufferedOutput>, id: RegId) -> u64 {
        cpu.get_reg(id.full()).unwrap()
    }

    const COUNTDOWN: [&str; 10] = [
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
    ];

    #[test]
    fn test_exit() {
        let mut cpu = cpu(
            PredictorKind::AlwaysNotTaken,
            &["mov rax 5", "mov rax 60", "syscall"],
            &[],
        );
        run_to_exit(&mut cpu);
        assert!(!cpu.is_running());
        assert_eq!(reg(&cpu, RegId::RAX), 60);
        assert_eq!(cpu.result(), &RunResult::default());
        assert!(cpu.in_flight().is_empty());
        assert_eq!(cpu.cycle_one().unwrap().flow, ControlFlow::Exit);
    }

    #[test]
    fn test_first_cycle_only_fetches() {
        let mut cpu = cpu(PredictorKind::TwoBit, &["mov rax 60", "syscall"], &[]);
        let r = cpu.cycle_one().unwrap();
        assert!(r.trace.executed.is_none() && r.trace.decoded.is_none());
        let fetched = r.trace.fetched.unwrap();
        assert_eq!((fetched.location, fetched.token.as_str()), (2, "mov rax 60"));
        assert!(!fetched.speculative);
        assert_eq!(cpu.reg_file().get_text(RegId::CIR), Some("mov rax 60"));
        let r = cpu.cycle_one().unwrap();
        assert_eq!(r.trace.decoded.unwrap().group.len(), 2);
        assert_eq!(cpu.in_flight().rob().size(), cpu.in_flight().pipeline().size());
    }

    #[test]
    fn test_self_jump_always_not_taken() {
        let mut cpu = cpu(PredictorKind::AlwaysNotTaken, &["jmp 2"], &[]);
        let traces: Vec<_> = (0..8).map(|_| cpu.cycle_one().unwrap().trace).collect();
        assert_eq!(cpu.result().mispredicted, vec![3, 7]);
        assert!(cpu.result().predicted.is_empty());
        let b = traces[3].branch.as_ref().unwrap();
        assert!(b.taken && b.mispredicted);
        assert_eq!(b.target, 2);
        // the flush leaves nothing in flight and redirects fetch
        assert!(traces[3].fetch_stalled && traces[3].decoded.is_none());
        assert_eq!(traces[4].fetched.as_ref().unwrap().location, 2);
        assert_eq!(reg(&cpu, RegId::RIP), 2);
        assert!(cpu.in_flight().is_empty());
        // cycle 7 flushed again; fetch is released at the end of the cycle
        assert!(traces[7].fetch_stalled && traces[7].fetched.is_none());
        assert_eq!(cpu.stalled(), Stage::Decode | Stage::Execute);
        assert_eq!(reg(&cpu, RegId::MAR), 0);
        assert_eq!(cpu.reg_file().get_text(RegId::MBR), Some(""));
        assert_eq!(cpu.reg_file().get_text(RegId::CIR), Some(""));
        let r = cpu.cycle_one().unwrap();
        let fetched = r.trace.fetched.unwrap();
        assert_eq!((fetched.location, fetched.speculative), (2, false));
        assert_eq!(cpu.reg_file().get_text(RegId::CIR), Some("jmp 2"));
    }

    #[test]
    fn test_self_jump_always_taken() {
        let mut cpu = cpu(PredictorKind::AlwaysTaken, &["jmp 2"], &[]);
        let traces: Vec<_> = (0..6).map(|_| cpu.cycle_one().unwrap().trace).collect();
        // right after the redirect the target is fetched as is
        assert!(!traces[4].fetched.as_ref().unwrap().speculative);
        let fetched = traces[5].fetched.as_ref().unwrap();
        assert_eq!((fetched.location, fetched.speculative), (2, true));
        assert_eq!(cpu.reg_file().get_text(RegId::MBR), Some("jmp 2"));
        assert_eq!(cpu.reg_file().get_text(RegId::CIR), Some("jmp 2*"));
        let r = cpu.cycle_one().unwrap();
        assert!(r.trace.decoded.unwrap().group.iter().all(|m| m.speculative));
        for _ in 7..12 {
            cpu.cycle_one().unwrap();
        }
        assert_eq!(cpu.result().mispredicted, vec![3]);
        assert_eq!(cpu.result().predicted[..2], [7, 9]);
    }

    #[test]
    fn test_countdown_every_predictor() {
        for kind in PredictorKind::ALL {
            let mut cpu = cpu(kind, &COUNTDOWN, &[42]);
            run_to_exit(&mut cpu);
            assert_eq!(reg(&cpu, RegId::RCX), 0, "{kind}");
            assert_eq!(cpu.result().branches(), 3, "{kind}");
            assert_eq!(cpu.into_output().value.into_inner(), vec![Cell::Word(42)], "{kind}");
        }
    }

    #[test]
    fn test_small_buffers_stall_fetch() {
        let config = CpuConfig {
            rob_capacity: 4,
            pipeline_capacity: 4,
            cycle_limit: Some(1000),
            ..Default::default()
        };
        let mut cpu = cpu_with(&config, PredictorKind::Gshare, &COUNTDOWN, &[42]);
        let mut stalled = false;
        loop {
            let jmp_at_head = !cpu.stalled().contains(Stage::Execute)
                && cpu
                    .in_flight()
                    .head()
                    .map_or(false, |(op, _)| op.opcode == MicroOpcode::Jmp);
            let r = cpu.cycle_one().unwrap();
            if r.flow == ControlFlow::Exit {
                break;
            }
            // flushes stall fetch too, but only on branch cycles
            stalled |= r.trace.fetch_stalled && r.trace.branch.is_none();
            // a JMP reaching execute always finds its successor issued
            assert_eq!(jmp_at_head, r.trace.branch.is_some(), "#{}", r.trace.cycle);
        }
        assert!(stalled);
        assert_eq!(cpu.result().branches(), 3);
        assert_eq!(cpu.into_output().value.into_inner(), vec![Cell::Word(42)]);
    }

    #[test]
    fn test_unknown_syscall_ignored() {
        let mut cpu = cpu(
            PredictorKind::OneBit,
            &["mov rax 7", "syscall", "mov rbx 5", "mov rax 60", "syscall"],
            &[],
        );
        let mut syscalls = 0;
        loop {
            let r = cpu.cycle_one().unwrap();
            if let Some(op) = &r.trace.executed {
                syscalls += usize::from(op.opcode == MicroOpcode::Syscall);
            }
            if r.flow == ControlFlow::Exit {
                break;
            }
        }
        assert_eq!(syscalls, 2);
        assert_eq!(reg(&cpu, RegId::RBX), 5);
        assert_eq!(reg(&cpu, RegId::RAX), 60);
        assert!(cpu.into_output().value.into_inner().is_empty());
    }

    #[test]
    fn test_narrow_store() {
        let mut cpu = cpu(
            PredictorKind::OneBit,
            &[
                "mov rbx -1",
                "mov rax 2",
                "mov rbxb rax",
                "mov [ds+1] rbx",
                "mov rax 60",
                "syscall",
            ],
            &[0, 0],
        );
        run_to_exit(&mut cpu);
        assert_eq!(reg(&cpu, RegId::RBX), 0xFFFF_FFFF_FFFF_FF02);
        assert_eq!(cpu.memory().get_word(Addr::new(9)).unwrap(), -254);
    }

    #[test]
    fn test_invalid_opcode_is_fatal() {
        let mut cpu = cpu(PredictorKind::AlwaysNotTaken, &["push rax"], &[]);
        let err = (0..4).find_map(|_| cpu.cycle_one().err()).unwrap();
        assert!(matches!(
            err,
            RuntimeError::DecodeError(DecodeError::InvalidOpcode(_))
        ));
        assert!(err.level().is_fatal());
    }

    #[test]
    fn test_cycle_limit() {
        let config = CpuConfig {
            cycle_limit: Some(20),
            ..Default::default()
        };
        let mut cpu = cpu_with(&config, PredictorKind::TwoBit, &["jmp 2"], &[]);
        let err = (0..30).find_map(|_| cpu.cycle_one().err()).unwrap();
        assert!(matches!(err, RuntimeError::CycleLimit(20)));
        assert_eq!(cpu.cycle(), 20);
    }

    #[test]
    fn test_too_large() {
        let config = CpuConfig {
            memory_size: 4,
            ..Default::default()
        };
        let exe = Executable::from_parts(["noop", "noop"], [1, 2]);
        assert!(matches!(
            Cpu::new(&config, PredictorKind::Gshare, &exe, BufferedOutput::new()),
            Err(RuntimeError::LoadError(LoadError::TooLarge {
                len: 6,
                capacity: 4
            }))
        ));
    }

    #[test]
    fn test_accuracy() {
        let r = RunResult {
            predicted: vec![7, 9, 11],
            mispredicted: vec![3],
        };
        assert_eq!(r.accuracy(), Some(0.75));
        assert_eq!(RunResult::default().accuracy(), None);
        assert_eq!(
            serde_json::to_string(&r).unwrap(),
            r#"{"Predicted":[7,9,11],"Mispredicted":[3]}"#
        );
    }
}
