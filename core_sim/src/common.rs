use std::{collections::BTreeMap, fmt, io::Read};

use bitmask_enum::bitmask;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    breakpoint::BreakPoint, decode_instr::MAX_GROUP_LEN, memory::Addr, register::RegRef,
};

#[derive(Default)]
pub struct RunStep {
    step: Option<usize>,
}

impl RunStep {
    pub fn new(step: Option<usize>) -> Self {
        Self { step }
    }

    pub fn get_step(&self) -> usize {
        self.step.unwrap_or(1)
    }
}

#[derive(Default)]
pub enum ExecuteMode {
    #[default]
    Run,
    SkipUntil {
        cycle: usize,
    },
    RunStep(RunStep),
}

impl fmt::Display for ExecuteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteMode::Run => write!(f, "running simply"),
            ExecuteMode::SkipUntil { cycle } => write!(f, "running until cycle #{cycle}"),
            ExecuteMode::RunStep(r) => {
                write!(f, "step execution by {}", r.get_step())
            }
        }
    }
}

/// Values reported whenever the simulation stops.
#[derive(Default)]
pub struct Watchings {
    pub reg: Vec<RegRef>,
    pub memory: Vec<Addr>,
}

#[derive(Default)]
pub struct SimulationOption {
    pub do_trace: bool,
    pub mode: ExecuteMode,
    pub watchings: Watchings,
    /// keyed by breakpoint id
    pub breakpoints: BTreeMap<usize, BreakPoint>,
}

#[bitmask(u8)]
pub enum Stage {
    Fetch,
    Decode,
    Execute,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = [
            (Stage::Fetch, "fetch"),
            (Stage::Decode, "decode"),
            (Stage::Execute, "execute"),
        ]
        .into_iter()
        .filter(|(s, _)| self.contains(*s))
        .map(|(_, n)| n)
        .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(", "))
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("`{field}` must be positive")]
    Zero { field: &'static str },
    #[error("`{field}` must be at least {min}")]
    TooSmall { field: &'static str, min: usize },
    #[error("`ghr_length` must be at most 63, got {0}")]
    HistoryTooLong(usize),
}

/// Sizes of every structure in the simulated core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CpuConfig {
    pub rob_capacity: usize,
    pub pipeline_capacity: usize,
    pub memory_size: usize,
    pub btb_capacity: usize,
    pub direction_capacity: usize,
    pub ghr_length: usize,
    pub obq_capacity: usize,
    /// aborts the run after this many cycles
    pub cycle_limit: Option<usize>,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            rob_capacity: 16,
            pipeline_capacity: 16,
            memory_size: 256,
            btb_capacity: 16,
            direction_capacity: 16,
            ghr_length: 8,
            obq_capacity: 32,
            cycle_limit: None,
        }
    }
}

impl CpuConfig {
    pub fn from_reader(r: impl Read) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_reader(r)?;
        config.validate()?;
        Ok(config)
    }
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("rob_capacity", self.rob_capacity),
            ("pipeline_capacity", self.pipeline_capacity),
            ("memory_size", self.memory_size),
            ("btb_capacity", self.btb_capacity),
            ("direction_capacity", self.direction_capacity),
            ("ghr_length", self.ghr_length),
            ("obq_capacity", self.obq_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        // a branch waiting at the head still needs room for the next group
        for (field, value) in [
            ("rob_capacity", self.rob_capacity),
            ("pipeline_capacity", self.pipeline_capacity),
        ] {
            if value <= MAX_GROUP_LEN {
                return Err(ConfigError::TooSmall {
                    field,
                    min: MAX_GROUP_LEN + 1,
                });
            }
        }
        // one outstanding prediction per in-flight branch, plus the one being fetched
        let in_flight = self.rob_capacity.min(self.pipeline_capacity);
        let min_obq = (in_flight + 1) / 2 + 1;
        if self.obq_capacity < min_obq {
            return Err(ConfigError::TooSmall {
                field: "obq_capacity",
                min: min_obq,
            });
        }
        if self.ghr_length > 63 {
            return Err(ConfigError::HistoryTooLong(self.ghr_length));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let c = CpuConfig::from_reader(r#"{"rob_capacity": 4, "cycle_limit": 100}"#.as_bytes())
            .unwrap();
        assert_eq!(c.rob_capacity, 4);
        assert_eq!(c.pipeline_capacity, 16);
        assert_eq!(c.cycle_limit, Some(100));
    }

    #[test]
    fn test_invalid_config() {
        assert!(CpuConfig::from_reader(r#"{"ghr_length": 0}"#.as_bytes()).is_err());
        assert!(CpuConfig::from_reader(r#"{"rob": 4}"#.as_bytes()).is_err());
        assert_eq!(
            CpuConfig {
                pipeline_capacity: 3,
                ..Default::default()
            }
            .validate(),
            Err(ConfigError::TooSmall {
                field: "pipeline_capacity",
                min: 4
            })
        );
        assert_eq!(
            CpuConfig {
                ghr_length: 64,
                ..Default::default()
            }
            .validate(),
            Err(ConfigError::HistoryTooLong(64))
        );
    }

    #[test]
    fn test_stage_mask() {
        let mut stalled = Stage::Decode | Stage::Execute;
        assert!(!stalled.contains(Stage::Fetch));
        stalled &= !Stage::Decode;
        assert_eq!(stalled, Stage::Execute);
        assert_eq!(
            (Stage::Fetch | Stage::Decode | Stage::Execute).to_string(),
            "fetch, decode, execute"
        );
    }
}
