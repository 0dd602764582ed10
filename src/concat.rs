//! Sorting units and how runs are grouped into them.
//!
//! | concat_runs | concat_sessions | units                                  |
//! |-------------|-----------------|----------------------------------------|
//! | false       | false           | one per run                            |
//! | true        | false           | one per session                        |
//! | any         | true            | one spanning every session             |
//!
//! Grouping never reorders: segments always follow tree order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::layout::UnitScope;
use crate::tree::{RunKey, RunTree};

/// What a sorter is invoked on once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortingUnit {
    pub scope: UnitScope,
    /// Runs in the order they are concatenated.
    pub segments: Vec<RunKey>,
}

impl SortingUnit {
    pub fn label(&self) -> String {
        self.scope.to_string()
    }

    pub fn is_concatenated(&self) -> bool {
        self.scope.is_concatenated()
    }
}

impl fmt::Display for SortingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} segment(s))", self.scope, self.segments.len())
    }
}

/// A run left out of sorting and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub run: RunKey,
    pub reason: String,
}

/// Units to sort plus the runs that were left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConcatenationPlan {
    pub units: Vec<SortingUnit>,
    pub excluded: Vec<Exclusion>,
}

impl ConcatenationPlan {
    /// Exclusions affecting `unit`'s scope.
    pub fn exclusions_for(&self, unit: &SortingUnit) -> Vec<Exclusion> {
        self.excluded
            .iter()
            .filter(|e| match &unit.scope {
                UnitScope::Run { session, run } => e.run.session == *session && e.run.run == *run,
                UnitScope::Session { session } => e.run.session == *session,
                UnitScope::AllSessions => true,
            })
            .cloned()
            .collect()
    }
}

/// Groups runs into sorting units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatenationBuilder {
    pub concat_runs: bool,
    pub concat_sessions: bool,
}

impl ConcatenationBuilder {
    pub fn new(concat_runs: bool, concat_sessions: bool) -> Self {
        Self {
            concat_runs,
            concat_sessions,
        }
    }

    /// Units over every run of the tree.
    pub fn build(&self, tree: &RunTree) -> Vec<SortingUnit> {
        self.build_excluding(tree, |_| None).units
    }

    /// Units over the runs `exclude` does not reject.
    ///
    /// `exclude` returns a reason for runs that must be left out. A session
    /// left without runs produces no unit; the exclusions are reported so
    /// they can be recorded alongside the output.
    pub fn build_excluding<F>(&self, tree: &RunTree, mut exclude: F) -> ConcatenationPlan
    where
        F: FnMut(&RunKey) -> Option<String>,
    {
        let mut plan = ConcatenationPlan::default();
        let mut per_session: Vec<(String, Vec<RunKey>)> = Vec::new();

        for session in tree.sessions() {
            let mut usable = Vec::new();
            for key in session.run_keys() {
                match exclude(&key) {
                    Some(reason) => plan.excluded.push(Exclusion { run: key, reason }),
                    None => usable.push(key),
                }
            }
            per_session.push((session.id().to_string(), usable));
        }

        if self.concat_sessions {
            let segments: Vec<RunKey> = per_session.into_iter().flat_map(|(_, runs)| runs).collect();
            if !segments.is_empty() {
                plan.units.push(SortingUnit {
                    scope: UnitScope::AllSessions,
                    segments,
                });
            }
        } else if self.concat_runs {
            for (session, runs) in per_session {
                if runs.is_empty() {
                    continue;
                }
                plan.units.push(SortingUnit {
                    scope: UnitScope::Session { session },
                    segments: runs,
                });
            }
        } else {
            for key in per_session.into_iter().flat_map(|(_, runs)| runs) {
                plan.units.push(SortingUnit {
                    scope: UnitScope::Run {
                        session: key.session.clone(),
                        run: key.run.clone(),
                    },
                    segments: vec![key],
                });
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> RunTree {
        RunTree::from_ordered("S1", vec![("A", vec!["r1", "r2"]), ("B", vec!["r3"])]).unwrap()
    }

    fn segment_runs(unit: &SortingUnit) -> Vec<&str> {
        unit.segments.iter().map(|k| k.run.as_str()).collect()
    }

    #[test]
    fn test_no_concatenation_gives_one_unit_per_run() {
        let units = ConcatenationBuilder::new(false, false).build(&tree());
        let labels: Vec<_> = units.iter().map(SortingUnit::label).collect();
        assert_eq!(labels, ["A/r1", "A/r2", "B/r3"]);
        assert!(units.iter().all(|u| u.segments.len() == 1));
    }

    #[test]
    fn test_concat_runs_gives_one_unit_per_session() {
        let units = ConcatenationBuilder::new(true, false).build(&tree());
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].label(), "A/concat_run");
        assert_eq!(segment_runs(&units[0]), ["r1", "r2"]);
        assert_eq!(units[1].label(), "B/concat_run");
        assert_eq!(segment_runs(&units[1]), ["r3"]);
    }

    #[test]
    fn test_concat_sessions_preserves_order() {
        for concat_runs in [true, false] {
            let units = ConcatenationBuilder::new(concat_runs, true).build(&tree());
            assert_eq!(units.len(), 1);
            assert_eq!(units[0].scope, UnitScope::AllSessions);
            assert_eq!(segment_runs(&units[0]), ["r1", "r2", "r3"]);
        }
    }

    #[test]
    fn test_excluded_runs_are_dropped_and_reported() {
        let plan = ConcatenationBuilder::new(true, false).build_excluding(&tree(), |key| {
            (key.run == "r3").then(|| "skipped".to_string())
        });

        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].label(), "A/concat_run");
        assert_eq!(plan.excluded, vec![Exclusion {
            run: RunKey::new("B", "r3"),
            reason: "skipped".to_string(),
        }]);
    }

    #[test]
    fn test_exclusions_for_scope() {
        let plan = ConcatenationBuilder::new(false, true).build_excluding(&tree(), |key| {
            (key.run == "r2").then(|| "skipped".to_string())
        });
        assert_eq!(segment_runs(&plan.units[0]), ["r1", "r3"]);
        assert_eq!(plan.exclusions_for(&plan.units[0]).len(), 1);
    }

    #[test]
    fn test_everything_excluded_yields_no_units() {
        let plan = ConcatenationBuilder::new(false, true)
            .build_excluding(&tree(), |_| Some("skipped".to_string()));
        assert!(plan.units.is_empty());
        assert_eq!(plan.excluded.len(), 3);
    }
}
