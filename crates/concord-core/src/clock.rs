//! Vector clocks indexed by actor id.
//!
//! A [`Clock`] maps each actor to the highest sequence number observed
//! from it; actors that are absent count as 0. Clocks are compared
//! component-wise, which makes them a partial order: two clocks can
//! each contain entries the other has not seen.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::change::ActorId;

/// Actor → max-seq map. Backed by a `BTreeMap` so iteration order is
/// deterministic across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Clock(BTreeMap<ActorId, u64>);

impl Clock {
    pub fn empty() -> Clock {
        Clock(BTreeMap::new())
    }

    /// The sequence number recorded for `actor`, or 0 if absent.
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// A copy of this clock with `actor` raised to at least `seq`.
    pub fn with(&self, actor: &ActorId, seq: u64) -> Clock {
        let mut next = self.clone();
        next.set_max(actor, seq);
        next
    }

    /// A copy of this clock with `actor` removed entirely.
    pub fn without(&self, actor: &ActorId) -> Clock {
        let mut next = self.clone();
        next.0.remove(actor);
        next
    }

    /// Raise `actor` to at least `seq` in place.
    pub fn set_max(&mut self, actor: &ActorId, seq: u64) {
        let entry = self.0.entry(actor.clone()).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Overwrite the entry for `actor` (used when an entry must drop,
    /// e.g. rebuilding head sets).
    pub fn set(&mut self, actor: &ActorId, seq: u64) {
        self.0.insert(actor.clone(), seq);
    }

    pub fn remove(&mut self, actor: &ActorId) {
        self.0.remove(actor);
    }

    /// Component-wise maximum of the two clocks.
    pub fn upper_bound(&self, other: &Clock) -> Clock {
        let mut next = self.clone();
        for (actor, &seq) in &other.0 {
            next.set_max(actor, seq);
        }
        next
    }

    /// Whether every entry of `self` is ≤ the matching entry of
    /// `other`. This is the causal-readiness test: a change is ready
    /// when its dependency clock is ≤ the applied clock.
    pub fn le(&self, other: &Clock) -> bool {
        self.0.iter().all(|(actor, &seq)| seq <= other.get(actor))
    }

    /// Whether `self` has seen everything `other` has (the reverse of
    /// [`Clock::le`]).
    pub fn subsumes(&self, other: &Clock) -> bool {
        other.le(self)
    }

    /// Whether the clocks have diverged: each contains an entry the
    /// other has not reached.
    pub fn divergent(&self, other: &Clock) -> bool {
        !self.le(other) && !other.le(self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in actor order.
    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, u64)> {
        self.0.iter().map(|(actor, &seq)| (actor, seq))
    }
}

impl FromIterator<(ActorId, u64)> for Clock {
    fn from_iter<I: IntoIterator<Item = (ActorId, u64)>>(iter: I) -> Clock {
        Clock(iter.into_iter().collect())
    }
}
