//! Scheduling policies.
//!
//! Planning is a pure function of each request's `(bytes_remaining, feedback_level, id)`. The
//! table is never touched here: `plan` reads a snapshot and returns an explicit ordering, and the
//! caller applies it.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::server::RcbId;

pub const ROUND_ROBIN_QUANTUM_DEFAULT: u64 = 8192;
pub const FEEDBACK_LEVELS_DEFAULT: [u64; 2] = [8192, 65536];

/// Scheduling policy for ordering and slicing transfers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Policy {
    /// Arrival order, fixed slice per round.
    #[default]
    RoundRobin,
    /// Fewest bytes remaining first, each job runs to completion in one round.
    ShortestJobFirst,
    /// Lowest feedback level first; the slice grows with the level.
    MultilevelFeedback,
}

/// Per-policy quantum sizes, in bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quanta {
    /// Slice given to every request under round robin.
    ///
    /// Minimum value: 1 \
    /// Default value: 8,192
    pub round_robin: u64,

    /// Slice for each multilevel feedback level, starting at level 0. Levels past the end of this
    /// list are unbounded (the whole remainder is served in one round).
    ///
    /// Each entry must be at least 1 and no smaller than the one before it. \
    /// Default value: [8,192, 65,536]
    pub feedback_levels: Vec<u64>,
}

/// The planner's view of a single request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub id: RcbId,
    pub bytes_remaining: u64,
    pub feedback_level: u32,
}

/// One entry of a plan: which request runs, and how many bytes it may move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub id: RcbId,
    pub quantum: u64,
}

impl Default for Quanta {
    fn default() -> Self {
        Self {
            round_robin: ROUND_ROBIN_QUANTUM_DEFAULT,
            feedback_levels: FEEDBACK_LEVELS_DEFAULT.to_vec(),
        }
    }
}

impl Quanta {
    pub fn validate(&self) -> Result<()> {
        if self.round_robin == 0 {
            return Err(Error::InvalidConfig("round robin quantum == 0".into()));
        }

        let mut prev = 0;

        for (level, &quantum) in self.feedback_levels.iter().enumerate() {
            if quantum == 0 {
                return Err(Error::InvalidConfig(format!(
                    "feedback level {level} quantum == 0"
                )));
            }
            if quantum < prev {
                return Err(Error::InvalidConfig(format!(
                    "feedback level {level} quantum {quantum} < level {} quantum {prev}",
                    level - 1
                )));
            }
            prev = quantum;
        }

        Ok(())
    }

    /// Slice for the given feedback level, or `None` if the level is unbounded.
    pub fn feedback_level(&self, level: u32) -> Option<u64> {
        self.feedback_levels.get(level as usize).copied()
    }
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "RR",
            Self::ShortestJobFirst => "SJF",
            Self::MultilevelFeedback => "MLFB",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round robin",
            Self::ShortestJobFirst => "shortest job first",
            Self::MultilevelFeedback => "multilevel feedback",
        }
    }

    /// Compare two requests according to this policy. Ties are always broken by id, so the
    /// resulting order is total.
    pub fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        let primary = match self {
            Self::RoundRobin => Ordering::Equal,
            Self::ShortestJobFirst => a.bytes_remaining.cmp(&b.bytes_remaining),
            Self::MultilevelFeedback => a.feedback_level.cmp(&b.feedback_level),
        };

        primary.then(a.id.cmp(&b.id))
    }

    /// Number of bytes the given request may move in its next round. Never zero.
    pub fn quantum(&self, candidate: &Candidate, quanta: &Quanta) -> u64 {
        let quantum = match self {
            Self::RoundRobin => quanta.round_robin,
            Self::ShortestJobFirst => candidate.bytes_remaining,
            Self::MultilevelFeedback => quanta
                .feedback_level(candidate.feedback_level)
                .unwrap_or(candidate.bytes_remaining),
        };

        quantum.max(1)
    }

    /// Returns true if a request which moved `written` bytes of a `quantum` byte slice, and still
    /// has `bytes_remaining` to go, should drop to the next feedback level.
    pub fn demotes(&self, quantum: u64, written: u64, bytes_remaining: u64) -> bool {
        match self {
            Self::MultilevelFeedback => written >= quantum && bytes_remaining > 0,
            _ => false,
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RR" => Ok(Self::RoundRobin),
            "SJF" => Ok(Self::ShortestJobFirst),
            "MLFB" => Ok(Self::MultilevelFeedback),
            _ => Err(Error::UnknownPolicy(s.to_string())),
        }
    }
}

/// Orders `candidates` and assigns each a quantum. The input order is irrelevant.
pub fn plan(policy: Policy, quanta: &Quanta, candidates: &[Candidate]) -> Vec<Slot> {
    let mut ordered = candidates.to_vec();

    ordered.sort_by(|a, b| policy.compare(a, b));

    ordered
        .iter()
        .map(|candidate| Slot {
            id: candidate.id,
            quantum: policy.quantum(candidate, quanta),
        })
        .collect()
}
