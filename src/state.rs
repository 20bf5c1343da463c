//! Shared mutable state for one invocation.
//!
//! A [`StateStore`] is a flat `key -> serde_json::Value` map with lifetime
//! scopes derived from the key prefix:
//!
//! - `app:` / `user:` are permanent; they survive the invocation and are
//!   exported to the archive snapshot.
//! - `temp:` is branch-temporary; dropped when the branch that wrote the key
//!   completes.
//! - anything else is invocation-scoped; it lives for the run and is not
//!   archived as permanent.
//!
//! Sequential and looping composites share one store by reference. Parallel
//! composites hand each child a [`StateStore::fork`]: a snapshot plus a
//! private write journal, replayed onto the parent in declaration order at
//! the join barrier so the merged state is deterministic regardless of task
//! scheduling. Within one delta, keys apply in sorted order for the same
//! reason.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::branch::BranchPath;

/// Lifetime scope of a state key, a pure function of its prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyScope {
    /// `app:` keys, permanent and shared across users of the application.
    App,
    /// `user:` keys, permanent and per user.
    User,
    /// No recognized prefix; lives for the invocation.
    Invocation,
    /// `temp:` keys, dropped when the writing branch completes.
    Temp,
}

impl KeyScope {
    pub fn of(key: &str) -> Self {
        if key.starts_with("app:") {
            KeyScope::App
        } else if key.starts_with("user:") {
            KeyScope::User
        } else if key.starts_with("temp:") {
            KeyScope::Temp
        } else {
            KeyScope::Invocation
        }
    }

    pub fn is_permanent(self) -> bool {
        matches!(self, KeyScope::App | KeyScope::User)
    }
}

/// Error for state reads that require a populated key.
#[derive(Debug, Error, Diagnostic)]
#[error("state key not populated: {key}")]
#[diagnostic(
    code(branchwork::state::missing_key),
    help("a predecessor unit must write this key before it is read; check unit ordering and the key's scope prefix")
)]
pub struct StateError {
    pub key: String,
}

/// One replayable write recorded by a forked store.
#[derive(Clone, Debug)]
enum JournalOp {
    Insert {
        key: String,
        value: Value,
        temp_owner: Option<BranchPath>,
    },
    Remove {
        key: String,
    },
}

/// Write journal captured by a fork, applied at the parallel join barrier.
#[derive(Debug, Default)]
pub struct WriteJournal(Vec<JournalOp>);

impl WriteJournal {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Flat, scope-aware key/value store shared across one invocation.
#[derive(Debug, Default)]
pub struct StateStore {
    values: FxHashMap<String, Value>,
    temp_owners: FxHashMap<String, BranchPath>,
    journal: Option<WriteJournal>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from initial invocation state.
    pub fn with_initial(initial: FxHashMap<String, Value>) -> Self {
        Self {
            values: initial,
            temp_owners: FxHashMap::default(),
            journal: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Clone out a required value, failing with [`StateError`] when absent.
    pub fn require(&self, key: &str) -> Result<Value, StateError> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| StateError { key: key.into() })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Insert one value, recording temp ownership and journaling on forks.
    pub fn insert(&mut self, key: impl Into<String>, value: Value, writer: &BranchPath) {
        let key = key.into();
        let temp_owner = if KeyScope::of(&key) == KeyScope::Temp {
            self.temp_owners.insert(key.clone(), writer.clone());
            Some(writer.clone())
        } else {
            None
        };
        if let Some(journal) = &mut self.journal {
            journal.0.push(JournalOp::Insert {
                key: key.clone(),
                value: value.clone(),
                temp_owner,
            });
        }
        self.values.insert(key, value);
    }

    /// Apply an event's state delta. Keys apply in sorted order so one delta
    /// always lands the same way.
    pub fn apply_delta(&mut self, delta: &FxHashMap<String, Value>, writer: &BranchPath) {
        let mut keys: Vec<&String> = delta.keys().collect();
        keys.sort();
        for key in keys {
            self.insert(key.clone(), delta[key].clone(), writer);
        }
    }

    /// Drop every `temp:` key owned by `branch` or any branch beneath it.
    pub fn drop_branch_temp(&mut self, branch: &BranchPath) {
        let doomed: Vec<String> = self
            .temp_owners
            .iter()
            .filter(|(_, owner)| owner.starts_with(branch))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            self.values.remove(&key);
            self.temp_owners.remove(&key);
            if let Some(journal) = &mut self.journal {
                journal.0.push(JournalOp::Remove { key: key.clone() });
            }
        }
    }

    /// Drop all remaining `temp:` keys. Used at invocation finalization.
    pub fn drop_all_temp(&mut self) {
        for key in self.temp_owners.keys() {
            self.values.remove(key);
        }
        self.temp_owners.clear();
    }

    /// Snapshot this store for one parallel child: same visible values, plus
    /// a private journal capturing every subsequent write for barrier replay.
    #[must_use]
    pub fn fork(&self) -> StateStore {
        StateStore {
            values: self.values.clone(),
            temp_owners: self.temp_owners.clone(),
            journal: Some(WriteJournal::default()),
        }
    }

    /// Detach the fork's journal, leaving an empty one behind.
    pub fn take_journal(&mut self) -> WriteJournal {
        self.journal
            .replace(WriteJournal::default())
            .unwrap_or_default()
    }

    /// Replay a child journal onto this store, in the order the child wrote.
    /// Callers replay journals in child declaration order, so later-declared
    /// children win key conflicts.
    pub fn apply_journal(&mut self, journal: WriteJournal, fallback_owner: &BranchPath) {
        for op in journal.0 {
            match op {
                JournalOp::Insert {
                    key,
                    value,
                    temp_owner,
                } => {
                    if KeyScope::of(&key) == KeyScope::Temp {
                        let owner = temp_owner.unwrap_or_else(|| fallback_owner.clone());
                        self.temp_owners.insert(key.clone(), owner);
                    }
                    self.values.insert(key, value);
                }
                JournalOp::Remove { key } => {
                    self.values.remove(&key);
                    self.temp_owners.remove(&key);
                }
            }
        }
    }

    /// Full flat snapshot of current values.
    pub fn snapshot(&self) -> FxHashMap<String, Value> {
        self.values.clone()
    }

    /// Snapshot of permanent (`app:` / `user:`) entries only.
    pub fn permanent_snapshot(&self) -> FxHashMap<String, Value> {
        self.values
            .iter()
            .filter(|(key, _)| KeyScope::of(key).is_permanent())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}
