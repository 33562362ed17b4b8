//! Pluggable eviction policy selection (spec §4.5).
//!
//! A policy only picks *which* evictable candidate to remove next; the
//! storage engine (`super::mod::StorageEngine::evict_until`) drives the
//! loop, skips locked entries, excludes the triggering operation's own
//! target, and performs the actual removal.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Snapshot of one file's eviction-relevant state, taken under its shard
/// lock and released before the policy compares it to other candidates.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: String,
    pub sequence: u64,
    pub last_use: Instant,
    pub use_count: u64,
    pub size: usize,
}

/// Recognized `eviction_policy` config values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Fifo,
    Lru,
    Lfu,
    /// Least-Weighted.
    Lw,
}

impl FromStr for PolicyKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FIFO" => Ok(Self::Fifo),
            "LRU" => Ok(Self::Lru),
            "LFU" => Ok(Self::Lfu),
            "LW" => Ok(Self::Lw),
            _ => Err(()),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fifo => "FIFO",
            Self::Lru => "LRU",
            Self::Lfu => "LFU",
            Self::Lw => "LW",
        };
        f.write_str(s)
    }
}

impl PolicyKind {
    pub fn selector(self) -> Box<dyn EvictionPolicy> {
        match self {
            Self::Fifo => Box::new(Fifo),
            Self::Lru => Box::new(Lru),
            Self::Lfu => Box::new(Lfu),
            Self::Lw => Box::new(LeastWeighted),
        }
    }
}

/// Chooses the preferred eviction candidate among a non-empty set of
/// already-filtered (unlocked, non-target) candidates.
pub trait EvictionPolicy: Send + Sync {
    fn pick<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate>;
}

pub struct Fifo;

impl EvictionPolicy for Fifo {
    fn pick<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        candidates.iter().min_by_key(|c| c.sequence)
    }
}

pub struct Lru;

impl EvictionPolicy for Lru {
    fn pick<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        candidates.iter().min_by_key(|c| c.last_use)
    }
}

pub struct Lfu;

impl EvictionPolicy for Lfu {
    fn pick<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        candidates
            .iter()
            .min_by_key(|c| (c.use_count, c.sequence))
    }
}

/// Weights for the least-weighted score. There is no single canonical
/// weighting in the spec beyond "combine recency, frequency, and size";
/// these favor evicting large, cold, rarely-used files first (see
/// DESIGN.md Open Question).
const WEIGHT_RECENCY: f64 = 1.0;
const WEIGHT_FREQUENCY: f64 = 1.0;
const WEIGHT_SIZE: f64 = 1e-3;

pub struct LeastWeighted;

impl LeastWeighted {
    fn score(candidate: &Candidate, now: Instant) -> f64 {
        let idle = now.saturating_duration_since(candidate.last_use).as_secs_f64();
        let frequency_term = WEIGHT_FREQUENCY / (candidate.use_count.max(1) as f64);
        WEIGHT_RECENCY * idle + frequency_term + WEIGHT_SIZE * candidate.size as f64
    }
}

impl EvictionPolicy for LeastWeighted {
    fn pick<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        let now = Instant::now();
        candidates
            .iter()
            .max_by(|a, b| Self::score(a, now).total_cmp(&Self::score(b, now)))
    }
}

/// Threshold above which [`super::entry::FileEntry::shrink_use_count`]
/// scaling kicks in across every entry, preserving relative LFU order
/// without risking `u64` overflow (spec §4.5).
pub const USE_COUNT_OVERFLOW_GUARD: u64 = u64::MAX / 2;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn candidate(path: &str, sequence: u64, use_count: u64, size: usize, age: Duration) -> Candidate {
        Candidate {
            path: path.to_string(),
            sequence,
            last_use: Instant::now().checked_sub(age).unwrap_or_else(Instant::now),
            use_count,
            size,
        }
    }

    #[test]
    fn fifo_picks_oldest_sequence() {
        let candidates = vec![
            candidate("/b", 2, 1, 1, Duration::ZERO),
            candidate("/a", 1, 1, 1, Duration::ZERO),
        ];
        assert_eq!(Fifo.pick(&candidates).unwrap().path, "/a");
    }

    #[test]
    fn lru_picks_least_recently_used() {
        let candidates = vec![
            candidate("/fresh", 1, 1, 1, Duration::from_secs(1)),
            candidate("/stale", 2, 1, 1, Duration::from_secs(100)),
        ];
        assert_eq!(Lru.pick(&candidates).unwrap().path, "/stale");
    }

    #[test]
    fn lfu_ties_break_on_oldest_insertion() {
        let candidates = vec![
            candidate("/later", 5, 3, 1, Duration::ZERO),
            candidate("/earlier", 1, 3, 1, Duration::ZERO),
        ];
        assert_eq!(Lfu.pick(&candidates).unwrap().path, "/earlier");
    }

    #[test]
    fn policy_kind_parses_case_insensitively() {
        assert_eq!("fifo".parse::<PolicyKind>().unwrap(), PolicyKind::Fifo);
        assert_eq!("Lru".parse::<PolicyKind>().unwrap(), PolicyKind::Lru);
        assert!("bogus".parse::<PolicyKind>().is_err());
    }
}
