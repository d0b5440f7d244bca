use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    branch_tables::{
        learn, new_btb, new_direction_buffer, BranchTargetBuffer, DirectionBuffer, LastOutcome,
        SaturatingCounter,
    },
    circular::BufferError,
    common::CpuConfig,
    gshare::Gshare,
};

/// A prediction scheme. The surrounding [`BranchPredictor`] handles the
/// pass-through cycle after a redirect.
pub trait Strategy: fmt::Display {
    /// next address to fetch after `pc`.
    fn predict(&mut self, pc: u64) -> Result<u64, BufferError>;
    /// records a resolved branch at `source` whose taken-target is `destination`.
    fn update(&mut self, source: u64, destination: u64, taken: bool) -> Result<(), BufferError>;
    /// drops state derived from predictions that were flushed.
    fn squash(&mut self) -> Result<(), BufferError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredictorKind {
    AlwaysNotTaken,
    AlwaysTaken,
    OneBit,
    TwoBit,
    Gshare,
}

impl PredictorKind {
    pub const ALL: [PredictorKind; 5] = [
        PredictorKind::AlwaysNotTaken,
        PredictorKind::AlwaysTaken,
        PredictorKind::OneBit,
        PredictorKind::TwoBit,
        PredictorKind::Gshare,
    ];
    pub fn name(self) -> &'static str {
        match self {
            PredictorKind::AlwaysNotTaken => "always-not-taken",
            PredictorKind::AlwaysTaken => "always-taken",
            PredictorKind::OneBit => "one-bit",
            PredictorKind::TwoBit => "two-bit",
            PredictorKind::Gshare => "gshare",
        }
    }
}

impl fmt::Display for PredictorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PredictorKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Self::ALL.iter().map(|k| k.name()).collect();
                format!("unknown predictor `{s}` (expected one of {})", names.join(", "))
            })
    }
}

pub struct BranchPredictor {
    kind: PredictorKind,
    stalled: bool,
    strategy: Box<dyn Strategy>,
}

impl BranchPredictor {
    pub fn new(kind: PredictorKind, config: &CpuConfig) -> Self {
        let strategy: Box<dyn Strategy> = match kind {
            PredictorKind::AlwaysNotTaken => Box::new(AlwaysNotTaken),
            PredictorKind::AlwaysTaken => Box::new(AlwaysTaken {
                btb: new_btb(config.btb_capacity),
            }),
            PredictorKind::OneBit => Box::new(OneBit {
                btb: new_btb(config.btb_capacity),
                direction: new_direction_buffer(config.direction_capacity),
            }),
            PredictorKind::TwoBit => Box::new(TwoBit {
                btb: new_btb(config.btb_capacity),
                direction: new_direction_buffer(config.direction_capacity),
            }),
            PredictorKind::Gshare => Box::new(Gshare::new(config)),
        };
        Self {
            kind,
            stalled: true,
            strategy,
        }
    }
    pub fn kind(&self) -> PredictorKind {
        self.kind
    }
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
    /// After a stall the current `pc` itself is returned once, so the
    /// redirected instruction is not skipped.
    pub fn predict(&mut self, pc: u64) -> Result<u64, BufferError> {
        if self.stalled {
            self.stalled = false;
            return Ok(pc);
        }
        self.strategy.predict(pc)
    }
    pub fn update(&mut self, source: u64, destination: u64, taken: bool) -> Result<(), BufferError> {
        log::trace!(
            "{}: update {source} -> {destination} ({})",
            self.kind,
            if taken { "taken" } else { "not taken" }
        );
        self.strategy.update(source, destination, taken)
    }
    pub fn stall(&mut self) -> Result<(), BufferError> {
        self.stalled = true;
        self.strategy.squash()
    }
}

impl fmt::Display for BranchPredictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}{}",
            self.kind,
            if self.stalled { " (stalled)" } else { "" }
        )?;
        write!(f, "{}", self.strategy)
    }
}

pub struct AlwaysNotTaken;

impl Strategy for AlwaysNotTaken {
    fn predict(&mut self, pc: u64) -> Result<u64, BufferError> {
        Ok(pc + 1)
    }
    fn update(&mut self, _: u64, _: u64, _: bool) -> Result<(), BufferError> {
        Ok(())
    }
}

impl fmt::Display for AlwaysNotTaken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(no state)")
    }
}

pub struct AlwaysTaken {
    btb: BranchTargetBuffer,
}

impl Strategy for AlwaysTaken {
    fn predict(&mut self, pc: u64) -> Result<u64, BufferError> {
        Ok(self.btb.get(pc).map_or(pc + 1, |e| e.destination))
    }
    fn update(&mut self, source: u64, destination: u64, _: bool) -> Result<(), BufferError> {
        if !self.btb.contains(source) {
            learn(&mut self.btb, (source, destination));
        }
        Ok(())
    }
}

impl fmt::Display for AlwaysTaken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.btb)
    }
}

pub struct OneBit {
    btb: BranchTargetBuffer,
    direction: DirectionBuffer<LastOutcome>,
}

impl Strategy for OneBit {
    fn predict(&mut self, pc: u64) -> Result<u64, BufferError> {
        let Some(target) = self.btb.get(pc) else {
            return Ok(pc + 1);
        };
        let taken = self.direction.get(pc).map_or(true, |e| e.certainty.0);
        Ok(if taken { target.destination } else { pc + 1 })
    }
    fn update(&mut self, source: u64, destination: u64, taken: bool) -> Result<(), BufferError> {
        learn(&mut self.btb, (source, destination));
        learn(&mut self.direction, (source, LastOutcome(taken)));
        Ok(())
    }
}

impl fmt::Display for OneBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.btb)?;
        write!(f, "{}", self.direction)
    }
}

pub struct TwoBit {
    btb: BranchTargetBuffer,
    direction: DirectionBuffer<SaturatingCounter>,
}

impl Strategy for TwoBit {
    fn predict(&mut self, pc: u64) -> Result<u64, BufferError> {
        let Some(target) = self.btb.get(pc) else {
            return Ok(pc + 1);
        };
        let taken = self
            .direction
            .get(pc)
            .map_or(true, |e| e.certainty.predicts_taken());
        Ok(if taken { target.destination } else { pc + 1 })
    }
    fn update(&mut self, source: u64, destination: u64, taken: bool) -> Result<(), BufferError> {
        learn(&mut self.btb, (source, destination));
        let counter = match self.direction.get(source) {
            Some(e) => e.certainty.record(taken),
            None => SaturatingCounter::seeded(taken),
        };
        learn(&mut self.direction, (source, counter));
        Ok(())
    }
}

impl fmt::Display for TwoBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.btb)?;
        write!(f, "{}", self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictor(kind: PredictorKind) -> BranchPredictor {
        BranchPredictor::new(kind, &CpuConfig::default())
    }

    #[test]
    fn test_pass_through_after_stall() {
        for kind in PredictorKind::ALL {
            let mut p = predictor(kind);
            assert!(p.is_stalled());
            assert_eq!(p.predict(4).unwrap(), 4, "{kind}");
            assert_eq!(p.predict(4).unwrap(), 5, "{kind}");
            p.stall().unwrap();
            assert_eq!(p.predict(9).unwrap(), 9, "{kind}");
        }
    }

    #[test]
    fn test_always_not_taken() {
        let mut p = predictor(PredictorKind::AlwaysNotTaken);
        p.predict(0).unwrap();
        p.update(3, 10, true).unwrap();
        assert_eq!(p.predict(3).unwrap(), 4);
    }

    #[test]
    fn test_always_taken_keeps_first_target() {
        let mut p = predictor(PredictorKind::AlwaysTaken);
        p.predict(0).unwrap();
        assert_eq!(p.predict(3).unwrap(), 4);
        p.update(3, 10, false).unwrap();
        p.update(3, 12, true).unwrap();
        assert_eq!(p.predict(3).unwrap(), 10);
    }

    #[test]
    fn test_one_bit_follows_last_outcome() {
        let mut p = predictor(PredictorKind::OneBit);
        p.predict(0).unwrap();
        p.update(3, 10, true).unwrap();
        assert_eq!(p.predict(3).unwrap(), 10);
        p.update(3, 10, false).unwrap();
        assert_eq!(p.predict(3).unwrap(), 4);
        p.update(3, 10, true).unwrap();
        assert_eq!(p.predict(3).unwrap(), 10);
    }

    #[test]
    fn test_two_bit_saturates() {
        let mut p = predictor(PredictorKind::TwoBit);
        p.predict(0).unwrap();
        for _ in 0..5 {
            p.update(3, 10, true).unwrap();
        }
        assert_eq!(p.predict(3).unwrap(), 10);
        // one not-taken only weakens the counter
        p.update(3, 10, false).unwrap();
        assert_eq!(p.predict(3).unwrap(), 10);
        for _ in 0..4 {
            p.update(3, 10, false).unwrap();
        }
        assert_eq!(p.predict(3).unwrap(), 4);
    }

    #[test]
    fn test_kind_names() {
        for kind in PredictorKind::ALL {
            assert_eq!(kind.to_string().parse::<PredictorKind>(), Ok(kind));
        }
        assert!("perceptron".parse::<PredictorKind>().is_err());
    }
}
