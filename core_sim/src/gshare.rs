//! Global-history predictor.
//!
//! The global history register (GHR) records every predicted direction,
//! speculative ones included. Each prediction evicts the oldest GHR bit into
//! the outstanding branch queue (OBQ) until the branch resolves, so the
//! confirmed history can always be rebuilt as `OBQ evictions ++ GHR`, cut to
//! the GHR length. A branch that missed the BTB was never shifted in, so its
//! outcome is spliced in beneath the outstanding predictions when it resolves.

use std::fmt;

use crate::{
    branch_predictor::Strategy,
    branch_tables::{
        learn, new_btb, new_direction_buffer, BranchTargetBuffer, DirectionBuffer, LastOutcome,
    },
    circular::{BufferError, CircularBuffer},
    common::CpuConfig,
};

/// Fixed-length shift register of branch directions, oldest first.
pub struct GlobalHistory {
    bits: CircularBuffer<bool>,
}

impl GlobalHistory {
    /// starts out full of `taken`.
    pub fn new(len: usize) -> Self {
        let mut bits = CircularBuffer::<bool>::new("global history", len);
        while !bits.is_full() {
            // capacity was just checked
            let _ = bits.add(true);
        }
        Self { bits }
    }
    pub fn len(&self) -> usize {
        self.bits.capacity()
    }
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
    /// shifts `taken` in and returns the bit that fell out.
    pub fn push(&mut self, taken: bool) -> Result<bool, BufferError> {
        let evicted = self.bits.remove().unwrap_or(true);
        self.bits.add(taken)?;
        Ok(evicted)
    }
    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().copied()
    }
    /// replaces the whole history; `bits` is oldest first.
    pub fn reset(&mut self, bits: impl IntoIterator<Item = bool>) -> Result<(), BufferError> {
        self.bits.flush();
        for b in bits.into_iter().take(self.len()) {
            self.bits.add(b)?;
        }
        Ok(())
    }
}

/// history bits as an integer, oldest bit most significant.
pub fn to_index(bits: impl IntoIterator<Item = bool>) -> u64 {
    bits.into_iter().fold(0u64, |acc, b| (acc << 1) | u64::from(b))
}

impl fmt::Display for GlobalHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: String = self.bits().map(|b| if b { '1' } else { '0' }).collect();
        write!(f, "GHR {s} (index {})", to_index(self.bits()))
    }
}

/// A prediction that has not been confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outstanding {
    /// GHR bit pushed out when this prediction was shifted in
    pub evicted: bool,
    pub source: u64,
    pub predicted: bool,
}

impl fmt::Display for Outstanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{} predicted {} (evicted {})",
            self.source,
            if self.predicted { "taken" } else { "not taken" },
            u8::from(self.evicted)
        )
    }
}

pub type OutstandingQueue = CircularBuffer<Outstanding>;

pub struct Gshare {
    ghr: GlobalHistory,
    obq: OutstandingQueue,
    btb: BranchTargetBuffer,
    direction: DirectionBuffer<LastOutcome>,
}

impl Gshare {
    pub fn new(config: &CpuConfig) -> Self {
        Self {
            ghr: GlobalHistory::new(config.ghr_length),
            obq: OutstandingQueue::new("outstanding branch queue", config.obq_capacity),
            btb: new_btb(config.btb_capacity),
            direction: new_direction_buffer(config.direction_capacity),
        }
    }
    /// history as it stands with every outstanding prediction undone.
    pub fn confirmed_history(&self) -> Vec<bool> {
        self.obq
            .iter()
            .map(|o| o.evicted)
            .chain(self.ghr.bits())
            .take(self.ghr.len())
            .collect()
    }
    /// Records the outcome of a branch that was never predicted, ahead of
    /// every outstanding prediction.
    fn insert_confirmed(&mut self, mut history: Vec<bool>, taken: bool) -> Result<(), BufferError> {
        let pending: Vec<Outstanding> = self.obq.iter().copied().collect();
        history.push(taken);
        history.extend(pending.iter().map(|o| o.predicted));
        let skip = history.len() - self.ghr.len();
        self.ghr.reset(history[skip..].iter().copied())?;
        self.obq.flush();
        for (i, o) in pending.into_iter().enumerate() {
            // pushing prediction i evicts the bit one history length behind it
            self.obq.add(Outstanding {
                evicted: history[i + 1],
                ..o
            })?;
        }
        Ok(())
    }
    pub fn history(&self) -> &GlobalHistory {
        &self.ghr
    }
    pub fn outstanding(&self) -> &OutstandingQueue {
        &self.obq
    }
}

impl Strategy for Gshare {
    fn predict(&mut self, pc: u64) -> Result<u64, BufferError> {
        let Some(destination) = self.btb.get(pc).map(|e| e.destination) else {
            return Ok(pc + 1);
        };
        let index = to_index(self.ghr.bits()) ^ pc;
        let taken = self.direction.get(index).map_or(true, |e| e.certainty.0);
        let evicted = self.ghr.push(taken)?;
        self.obq.add(Outstanding {
            evicted,
            source: pc,
            predicted: taken,
        })?;
        Ok(if taken { destination } else { pc + 1 })
    }

    fn update(&mut self, source: u64, destination: u64, taken: bool) -> Result<(), BufferError> {
        let history = self.confirmed_history();
        let index = to_index(history.iter().copied()) ^ source;
        learn(&mut self.direction, (index, LastOutcome(taken)));
        learn(&mut self.btb, (source, destination));

        // branches that missed the BTB never entered the OBQ
        let head = self.obq.front().filter(|o| o.source == source).copied();
        match head {
            Some(o) if o.predicted == taken => {
                self.obq.remove();
                return Ok(());
            }
            // fell through as fetched; everything outstanding is younger
            None if !taken => return self.insert_confirmed(history, taken),
            _ => {}
        }
        log::debug!("gshare: global mispredict at {source}, rebuilding history");
        let mut repaired = history;
        repaired.push(taken);
        let skip = repaired.len() - self.ghr.len();
        self.ghr.reset(repaired.into_iter().skip(skip))?;
        self.obq.flush();
        Ok(())
    }

    fn squash(&mut self) -> Result<(), BufferError> {
        if self.obq.is_empty() {
            return Ok(());
        }
        let history = self.confirmed_history();
        self.ghr.reset(history)?;
        self.obq.flush();
        Ok(())
    }
}

impl fmt::Display for Gshare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.ghr)?;
        writeln!(f, "{}", self.obq)?;
        writeln!(f, "{}", self.btb)?;
        write!(f, "{}", self.direction)
    }
}
