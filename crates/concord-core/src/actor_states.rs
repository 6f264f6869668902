//! Per-actor operation log and transitive dependency tracking.
//!
//! A change ships only its direct `deps`, but concurrency tests need
//! the full set of changes each change could observe. [`ActorStates`]
//! stores every applied change per actor in seq order, and computes
//! the transitive dependency clock (`all_deps`) once, at apply time.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::change::{ActorId, Change, Op};
use crate::clock::Clock;
use crate::error::BackendError;

/// One op annotated with the change that carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct OpMeta {
    pub actor: ActorId,
    pub seq: u64,
    pub op: Op,
}

/// An applied change plus the transitive closure of its dependencies.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub change: Rc<Change>,
    /// Union of the deps of every change reachable from this one,
    /// including the implicit self-dependency `(actor, seq − 1)`.
    pub all_deps: Clock,
}

/// Append-only change history, keyed by actor. Kept in a `BTreeMap`
/// so selector output is ordered by actor then seq.
#[derive(Debug, Clone, Default)]
pub struct ActorStates {
    history: BTreeMap<ActorId, Vec<Rc<ChangeEntry>>>,
}

impl ActorStates {
    pub fn new() -> ActorStates {
        ActorStates::default()
    }

    pub fn entry(&self, actor: &ActorId, seq: u64) -> Option<&Rc<ChangeEntry>> {
        if seq == 0 {
            return None;
        }
        self.history.get(actor)?.get(seq as usize - 1)
    }

    pub fn history_for(&self, actor: &ActorId) -> &[Rc<ChangeEntry>] {
        self.history.get(actor).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `change` has been applied already. Delivering the same
    /// `(actor, seq)` with different content is an error, never a
    /// silent overwrite.
    pub fn is_applied(&self, change: &Change) -> Result<bool, BackendError> {
        match self.entry(&change.actor, change.seq) {
            None => Ok(false),
            Some(existing) if *existing.change == *change => Ok(true),
            Some(_) => Err(BackendError::InconsistentReuse {
                actor: change.actor.clone(),
                seq: change.seq,
            }),
        }
    }

    /// Record `change` and compute its transitive dependency clock.
    ///
    /// The caller guarantees causal readiness, so every dependency's
    /// own entry (and its `all_deps`) is present.
    pub fn add_change(&mut self, change: Change) -> Rc<ChangeEntry> {
        let direct = change.deps.with(&change.actor, change.seq - 1);
        let mut all_deps = direct.clone();
        for (dep_actor, dep_seq) in direct.iter() {
            if let Some(entry) = self.entry(dep_actor, dep_seq) {
                all_deps = all_deps.upper_bound(&entry.all_deps);
            }
        }
        let entry = Rc::new(ChangeEntry {
            change: Rc::new(change),
            all_deps,
        });
        self.history
            .entry(entry.change.actor.clone())
            .or_default()
            .push(entry.clone());
        entry
    }

    /// The `all_deps` clock captured when `(actor, seq)` was applied.
    pub fn all_deps(&self, actor: &ActorId, seq: u64) -> Option<&Clock> {
        self.entry(actor, seq).map(|entry| &entry.all_deps)
    }

    /// Two ops are concurrent iff neither one's change observed the
    /// other's `(actor, seq)`.
    pub fn are_concurrent(&self, op1: &OpMeta, op2: &OpMeta) -> bool {
        if op1.actor == op2.actor && op1.seq == op2.seq {
            return false;
        }
        let dep1 = self
            .all_deps(&op1.actor, op1.seq)
            .map(|deps| deps.get(&op2.actor))
            .unwrap_or(0);
        let dep2 = self
            .all_deps(&op2.actor, op2.seq)
            .map(|deps| deps.get(&op1.actor))
            .unwrap_or(0);
        dep1 < op2.seq && dep2 < op1.seq
    }

    /// Every stored change with seq beyond `have`, ordered by actor
    /// then seq.
    pub fn changes_after(&self, have: &Clock) -> Vec<Change> {
        let mut out = Vec::new();
        for (actor, entries) in &self.history {
            let from = have.get(actor) as usize;
            for entry in entries.iter().skip(from) {
                out.push((*entry.change).clone());
            }
        }
        out
    }

    pub fn changes_for_actor(&self, actor: &ActorId, after_seq: u64) -> Vec<Change> {
        self.history_for(actor)
            .iter()
            .skip(after_seq as usize)
            .map(|entry| (*entry.change).clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(actor: &str, seq: u64, deps: &[(&str, u64)]) -> Change {
        Change {
            actor: ActorId::from(actor),
            seq,
            deps: deps
                .iter()
                .map(|(a, s)| (ActorId::from(*a), *s))
                .collect(),
            message: None,
            ops: vec![],
        }
    }

    #[test]
    fn all_deps_includes_implicit_self_dependency() {
        let mut states = ActorStates::new();
        states.add_change(change("a", 1, &[]));
        states.add_change(change("a", 2, &[]));
        let deps = states.all_deps(&ActorId::from("a"), 2).unwrap();
        assert_eq!(deps.get(&ActorId::from("a")), 1);
    }

    #[test]
    fn all_deps_is_transitive() {
        let mut states = ActorStates::new();
        states.add_change(change("a", 1, &[]));
        states.add_change(change("b", 1, &[("a", 1)]));
        states.add_change(change("c", 1, &[("b", 1)]));
        // c:1 names only b:1 directly but observes a:1 through it.
        let deps = states.all_deps(&ActorId::from("c"), 1).unwrap();
        assert_eq!(deps.get(&ActorId::from("a")), 1);
        assert_eq!(deps.get(&ActorId::from("b")), 1);
    }

    #[test]
    fn concurrency_is_mutual_ignorance() {
        let mut states = ActorStates::new();
        states.add_change(change("a", 1, &[]));
        states.add_change(change("b", 1, &[]));
        states.add_change(change("b", 2, &[("a", 1)]));

        let op = |actor: &str, seq| OpMeta {
            actor: ActorId::from(actor),
            seq,
            op: Op::MakeMap {
                obj: crate::change::ObjectId::Id("o".into()),
            },
        };
        assert!(states.are_concurrent(&op("a", 1), &op("b", 1)));
        // b:2 saw a:1, so they are ordered.
        assert!(!states.are_concurrent(&op("a", 1), &op("b", 2)));
        // An op is never concurrent with itself.
        assert!(!states.are_concurrent(&op("a", 1), &op("a", 1)));
        // Same-actor ops are always ordered.
        assert!(!states.are_concurrent(&op("b", 1), &op("b", 2)));
    }

    #[test]
    fn reapplying_the_same_change_is_detected() {
        let mut states = ActorStates::new();
        let c = change("a", 1, &[]);
        states.add_change(c.clone());
        assert_eq!(states.is_applied(&c), Ok(true));
    }

    #[test]
    fn reusing_a_seq_with_different_content_fails() {
        let mut states = ActorStates::new();
        states.add_change(change("a", 1, &[]));
        let mut imposter = change("a", 1, &[]);
        imposter.message = Some("different".into());
        assert_eq!(
            states.is_applied(&imposter),
            Err(BackendError::InconsistentReuse {
                actor: ActorId::from("a"),
                seq: 1
            })
        );
    }

    #[test]
    fn changes_after_filters_per_actor_and_orders_output() {
        let mut states = ActorStates::new();
        states.add_change(change("b", 1, &[]));
        states.add_change(change("a", 1, &[]));
        states.add_change(change("a", 2, &[]));
        let have = Clock::empty().with(&ActorId::from("a"), 1);
        let missing = states.changes_after(&have);
        let ids: Vec<(String, u64)> = missing
            .iter()
            .map(|c| (c.actor.as_str().to_string(), c.seq))
            .collect();
        assert_eq!(ids, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    }
}
