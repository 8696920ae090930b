//! Exclusion-aware ring pairing.
//!
//! A shuffled ordering linked end to end (`i -> i+1 mod n`) can never pair
//! anyone with themself. Shuffles are retried until one respects the
//! blacklists; once the shuffle budget is spent a randomized depth-first
//! search builds the ring edge by edge, skipping blacklisted receivers.

use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashSet;

use crate::santa::error::SantaError;
use crate::santa::session::{ExclusionSet, Identity, PairingAssignment, is_excluded};

pub const MIN_PARTICIPANTS: usize = 3;

/// Bounds on the pairing search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingLimits {
    pub max_shuffle_attempts: usize,
    /// Nodes the backtracking search may visit before giving up.
    pub max_backtrack_steps: usize,
}

impl Default for PairingLimits {
    fn default() -> Self {
        Self {
            max_shuffle_attempts: 5000,
            max_backtrack_steps: 1_000_000,
        }
    }
}

/// True if every `ring[i] -> ring[i+1 mod n]` edge is allowed.
pub fn ring_respects_exclusions(ring: &[Identity], exclusions: &ExclusionSet) -> bool {
    let n = ring.len();
    (0..n).all(|i| !is_excluded(exclusions, ring[i], ring[(i + 1) % n]))
}

pub fn ring_to_assignment(ring: &[Identity]) -> PairingAssignment {
    let n = ring.len();
    (0..n).map(|i| (ring[i], ring[(i + 1) % n])).collect()
}

/// Compute a giver ordering whose ring respects `exclusions`.
///
/// Returns the ordering; `ring_to_assignment` turns it into edges.
pub fn compute_assignment<R: Rng + ?Sized>(
    participants: &[Identity],
    exclusions: &ExclusionSet,
    limits: &PairingLimits,
    rng: &mut R,
) -> Result<Vec<Identity>, SantaError> {
    if participants.len() < MIN_PARTICIPANTS {
        return Err(SantaError::InsufficientParticipants {
            count: participants.len(),
        });
    }

    let mut ring = participants.to_vec();
    for _ in 0..limits.max_shuffle_attempts {
        ring.shuffle(rng);
        if ring_respects_exclusions(&ring, exclusions) {
            return Ok(ring);
        }
    }

    tracing::debug!(
        attempts = limits.max_shuffle_attempts,
        participants = participants.len(),
        "Shuffle budget spent, falling back to backtracking"
    );

    let mut search = RingSearch {
        exclusions,
        members: participants.to_vec(),
        path: Vec::with_capacity(participants.len()),
        used: HashSet::with_capacity(participants.len()),
        steps: 0,
        max_steps: limits.max_backtrack_steps,
    };
    match search.run(rng) {
        Some(ring) => Ok(ring),
        None => Err(SantaError::NoValidPairing {
            attempts: limits.max_shuffle_attempts,
        }),
    }
}

struct RingSearch<'a> {
    exclusions: &'a ExclusionSet,
    members: Vec<Identity>,
    path: Vec<Identity>,
    used: HashSet<Identity>,
    steps: usize,
    max_steps: usize,
}

/// Step budget ran out.
struct Exhausted;

impl RingSearch<'_> {
    fn run<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Vec<Identity>> {
        // Every member is on the cycle, so the starting point is arbitrary.
        let start = *self.members.choose(rng)?;
        self.path.push(start);
        self.used.insert(start);

        match self.extend(rng) {
            Ok(true) => Some(std::mem::take(&mut self.path)),
            Ok(false) => None,
            Err(Exhausted) => {
                tracing::warn!(steps = self.steps, "Pairing search step budget exhausted");
                None
            }
        }
    }

    fn extend<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<bool, Exhausted> {
        let (Some(&first), Some(&current)) = (self.path.first(), self.path.last()) else {
            return Ok(false);
        };

        if self.path.len() == self.members.len() {
            return Ok(!is_excluded(self.exclusions, current, first));
        }

        let mut next: Vec<Identity> = self
            .members
            .iter()
            .copied()
            .filter(|id| !self.used.contains(id) && !is_excluded(self.exclusions, current, *id))
            .collect();
        next.shuffle(rng);

        for id in next {
            self.steps += 1;
            if self.steps > self.max_steps {
                return Err(Exhausted);
            }

            self.path.push(id);
            self.used.insert(id);
            if self.extend(rng)? {
                return Ok(true);
            }
            self.path.pop();
            self.used.remove(&id);
        }

        Ok(false)
    }
}
