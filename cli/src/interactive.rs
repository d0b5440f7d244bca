use std::io::{stdin, stdout, Write};

use anyhow::Result;
use core_sim::{
    breakpoint::{BreakPoint, BreakPointCond},
    common::{ExecuteMode, RunStep, SimulationOption, Watchings},
    instr::MicroOpcode,
    io::Output,
    memory::Addr,
    register::{RegId, RegRef},
    sim::{BreakReason, ControlFlow, OnBreak, Simulator, WatchingValues},
};

use terminal_size::terminal_size;

peg::parser!(grammar command() for str {
    rule usize() -> usize
        = n:$(quiet!{['0'..='9']+}) {? n.parse().map_err(|_| "number fitting in usize") }
        / expected!("usize")
    rule radix() -> usize
        = quiet!{"0" ['x' | 'X']} n:$(quiet!{['0'..='9'|'a'..='f'|'A'..='F']+})
        {? usize::from_str_radix(n, 16).map_err(|_| "hexadecimal") }
        / usize()
    rule addr() -> Addr
        = r:radix() { Addr::new(r) }

    rule ident() -> &'input str
        = $(quiet!{
            [ c if c.is_ascii_alphabetic() ]
            [ c if c.is_ascii_alphanumeric() ]*
        })
        / expected!("identifier")
    rule word() -> &'input str
        = $(quiet!{ (!ws() [_])+ })
        / expected!("word")
    rule reg_name() -> RegRef
        = i:ident() {? i.try_into().map_err(|_| "register name") }
    rule opcode() -> MicroOpcode
        = i:ident() {? i.parse().map_err(|_| "micro-opcode") }
    rule bp() = "break" / "bp"
    rule rm() = "rm" / "remove"
    rule mem() = "memory" / "mem"
    rule op() -> Operation
        = "watch" { Operation::Add } / "unwatch" { Operation::Remove }
    rule dyn_command() -> ExecuteMode
        = "until" __ cycle:usize() { ExecuteMode::SkipUntil { cycle } }
        / "run" { ExecuteMode::Run }
        / "step" step:(__ s:radix() { s })? { ExecuteMode::RunStep(RunStep::new(step)) }
    rule bp_cond() -> BreakPointCond
        = ("opcode" / "op") __ op:opcode() { BreakPointCond::Opcode(op) }
        / "operand" __ w:word() { BreakPointCond::Operand(w.to_string()) }
        / "cycle" __ c:usize() { BreakPointCond::Cycle(c) }
    rule static_command() -> StaticCommand
        = "trace" __ "off" { StaticCommand::UpdateWhetherTrace(false) }
        / "trace" (__ "on")? { StaticCommand::UpdateWhetherTrace(true) }
        / bp() __ rm() __ id:usize() { StaticCommand::RemoveBp(id) }
        / bp() __ cond:bp_cond() { StaticCommand::AddBp(cond) }
        / o:op() __ w:watch_kind() { StaticCommand::Watch(o, w) }
        / "show" __ sk:show_kind() { StaticCommand::Show(sk) }
    rule watch_kind() -> WatchingKind
        = mem() __ addr:addr() { WatchingKind::MemAddr(addr) }
        / ("register" / "reg") __ r:reg_name() { WatchingKind::Reg(r) }
        / r:reg_name() { WatchingKind::Reg(r) }
    rule show_kind() -> ShowKind
        = ("registers" / "regs") { ShowKind::RegFile }
        / "rob" { ShowKind::Rob }
        / "pipeline" { ShowKind::Pipeline }
        / mem() __ addr:addr() len:(__ n:usize() { n })? { ShowKind::Memory(addr, len.unwrap_or(1)) }
        / "predictor" { ShowKind::Predictor }
        / "trace" { ShowKind::LastTrace }
        / bp() { ShowKind::AllBp }
        / "stat" { ShowKind::Stat }
        / "cycle" { ShowKind::Cycle }
        / "stall" { ShowKind::Stall }
        / ("watchings" / "watch") { ShowKind::Watchings }
        / r:reg_name() { ShowKind::Register(r) }
    pub(crate) rule parse_command() -> Command
        = _ s:static_command() _ { Command::Static(s) }
        / _ "exit" _ { Command::Exit }
        / _ d:dyn_command()? _ { Command::Dynamic(d) }
        / expected!("command")

    rule ws() = quiet!{[' ' | '\t' | '\r' | '\n']}
        / expected!("whitespace")
    rule _() = ws()*
    rule __() = ws()+
});

pub(crate) enum Command {
    Dynamic(Option<ExecuteMode>),
    Static(StaticCommand),
    Exit,
}

pub(crate) enum StaticCommand {
    UpdateWhetherTrace(bool),
    Show(ShowKind),
    AddBp(BreakPointCond),
    RemoveBp(usize),
    Watch(Operation, WatchingKind),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Operation {
    Add,
    Remove,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WatchingKind {
    Reg(RegRef),
    MemAddr(Addr),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ShowKind {
    Cycle,
    Stall,
    Stat,
    AllBp,
    IsTraceEnabled,
    Watchings,
    LastTrace,
    Rob,
    Pipeline,
    Predictor,
    Memory(Addr, usize),
    RegFile,
    Register(RegRef),
}

fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

fn print_watchings(opt: &SimulationOption) {
    let Watchings { reg, memory } = &opt.watchings;
    if reg.is_empty() && memory.is_empty() {
        println!("nothing to watch.");
        return;
    }
    println!("watching these values:");
    if !reg.is_empty() {
        let regs: Vec<_> = reg.iter().map(|r| r.to_string()).collect();
        println!("\tregisters: {}", regs.join(", "));
    }
    if !memory.is_empty() {
        let addrs: Vec<_> = memory.iter().map(|a| a.to_string()).collect();
        println!("\tmemory: {}", addrs.join(", "));
    }
}

fn print_watching_values(WatchingValues { reg_map, memory_map }: &WatchingValues) {
    if !reg_map.is_empty() {
        let regs: Vec<_> = reg_map
            .iter()
            .map(|(r, v)| match v {
                Ok(v) => format!("{r} == {v}"),
                Err(e) => format!("{r}: {e}"),
            })
            .collect();
        println!("{}", regs.join(", "));
    }
    if !memory_map.is_empty() {
        let cells: Vec<_> = memory_map
            .iter()
            .map(|(a, c)| match c {
                Some(c) => format!("M[{a}] == {c}"),
                None => format!("M[{a}] is out of bounds"),
            })
            .collect();
        println!("{}", cells.join(", "));
    }
}

pub fn execute_interactive<O: Output>(sim: &mut Simulator<O>) -> Result<()> {
    let mut opt = SimulationOption::default();
    let mut next_bp_id = 0;
    #[cfg(feature = "stat")]
    let width = get_terminal_width();
    let regfile_chunk_size = get_terminal_width().map(|w| w / 30).unwrap_or(2).max(2) as usize;
    println!("entering interactive ({}).", sim.kind());
    'interactive: loop {
        let mut show = None;
        let update_mode = 'input: loop {
            if let Some(show) = show.take() {
                let cpu = sim.cpu();
                match show {
                    ShowKind::Cycle => {
                        let rip = cpu.reg_file().value(RegId::RIP);
                        println!("cycle #{}, rip == {rip}", sim.cycle());
                    }
                    ShowKind::Stall => {
                        println!("stalled: {}", cpu.stalled());
                    }
                    ShowKind::IsTraceEnabled => {
                        println!(
                            "trace {}",
                            if opt.do_trace { "enabled" } else { "disabled" }
                        );
                    }
                    #[cfg(feature = "stat")]
                    ShowKind::Stat => {
                        println!("{}", sim.collect_stat().view(width.unwrap_or(60) as usize));
                    }
                    #[cfg(not(feature = "stat"))]
                    ShowKind::Stat => {
                        println!("statistics are disabled; build with `--features stat`.");
                    }
                    ShowKind::Memory(addr, len) => {
                        println!("{}", cpu.get_mem_view(addr, len));
                    }
                    ShowKind::RegFile => {
                        println!("{}", cpu.get_regfile_view(regfile_chunk_size));
                    }
                    ShowKind::Register(r) => match cpu.get_reg(r) {
                        Ok(v) => println!("{r} == {v}"),
                        Err(e) => println!("{e}"),
                    },
                    ShowKind::Rob => {
                        println!("{}", cpu.in_flight().rob());
                    }
                    ShowKind::Pipeline => {
                        println!("{}", cpu.in_flight().pipeline());
                    }
                    ShowKind::Predictor => {
                        println!("{}", cpu.predictor());
                    }
                    ShowKind::LastTrace => match sim.last_trace() {
                        Some(t) => println!("{t}"),
                        None => println!("no cycle has run yet."),
                    },
                    ShowKind::AllBp => {
                        if opt.breakpoints.is_empty() {
                            println!("no breakpoints set.");
                        } else {
                            let bps: Vec<_> =
                                opt.breakpoints.values().map(|b| b.to_string()).collect();
                            println!("breakpoints: [{}]", bps.join(", "));
                        }
                    }
                    ShowKind::Watchings => print_watchings(&opt),
                }
            }
            // prompt string
            match &opt.mode {
                ExecuteMode::Run => print!("run "),
                ExecuteMode::SkipUntil { cycle } => print!("until #{cycle} "),
                ExecuteMode::RunStep(n) => print!("step {} ", n.get_step()),
            }
            if opt.do_trace {
                print!("[trace] ");
            }
            print!("> ");
            stdout().flush()?;
            let mut str = String::new();
            if stdin().read_line(&mut str)? == 0 {
                break 'interactive;
            }
            let parsed = match command::parse_command(&str) {
                Ok(p) => p,
                Err(e) => {
                    println!("parse error: expected {}", e.expected);
                    continue;
                }
            };
            match parsed {
                Command::Dynamic(d) => {
                    break 'input d;
                }
                Command::Static(s) => {
                    use Operation::*;
                    match s {
                        StaticCommand::Show(s) => show = Some(s),
                        StaticCommand::UpdateWhetherTrace(b) => {
                            opt.do_trace = b;
                            show = Some(ShowKind::IsTraceEnabled);
                        }
                        StaticCommand::AddBp(cond) => {
                            opt.breakpoints
                                .insert(next_bp_id, BreakPoint::new(next_bp_id, cond));
                            next_bp_id += 1;
                            show = Some(ShowKind::AllBp);
                        }
                        StaticCommand::RemoveBp(id) => {
                            if opt.breakpoints.remove(&id).is_none() {
                                println!("no breakpoint #{id}");
                            }
                            show = Some(ShowKind::AllBp);
                        }
                        StaticCommand::Watch(Add, w) => {
                            match w {
                                WatchingKind::Reg(r) => {
                                    if !opt.watchings.reg.contains(&r) {
                                        opt.watchings.reg.push(r);
                                    }
                                }
                                WatchingKind::MemAddr(a) => {
                                    if !opt.watchings.memory.contains(&a) {
                                        opt.watchings.memory.push(a);
                                    }
                                }
                            };
                            show = Some(ShowKind::Watchings)
                        }
                        StaticCommand::Watch(Remove, w) => {
                            match w {
                                WatchingKind::Reg(r) => opt.watchings.reg.retain(|rr| *rr != r),
                                WatchingKind::MemAddr(a) => {
                                    opt.watchings.memory.retain(|aa| *aa != a)
                                }
                            }
                            show = Some(ShowKind::Watchings)
                        }
                    };
                    continue 'input;
                }
                Command::Exit => {
                    break 'interactive;
                }
            }
        };
        if let Some(mode) = update_mode {
            println!("mode: {mode}");
            opt.mode = mode;
        }
        match sim.single_cycle(&opt, &mut |_, trace| println!("{trace}"))? {
            ControlFlow::Break(OnBreak { watchings, reason }) => {
                use BreakReason::*;
                match reason {
                    Reached(..) => (),
                    StepEnded => (),
                    BreakPoint(id) => match opt.breakpoints.get(&id) {
                        Some(bp) => println!("reached {bp}"),
                        None => println!("reached breakpoint #{id}"),
                    },
                    CannotRestart => {
                        let e = sim.get_error_msg().unwrap_or_default();
                        println!("cannot restart simulator due to previous error: {e}")
                    }
                    Failed => {
                        let e = sim.get_error_msg().unwrap_or_default();
                        let cy = sim.cycle();
                        println!("failed at #{cy}: {e}")
                    }
                }
                print_watching_values(&watchings);
                continue;
            }
            ControlFlow::Exit => {
                println!("program halts at cycle #{}", sim.cycle());
                break 'interactive;
            }
        }
    }
    println!("exiting interactive.");
    Ok(())
}
