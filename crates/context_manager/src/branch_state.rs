//! Branch state management
//!
//! Decides per turn whether the variable state is stored as a full snapshot
//! or as a diff against the parent, and reconstructs, validates and repairs
//! the resolved state along a root-to-turn path.
//!
//! Every function here takes the path explicitly, ordered from the root down
//! to the target turn (see `ConversationTree::path_to`).

use chat_core::state::codec::{changes_byte_size, state_byte_size};
use chat_core::state::{apply, diff, verify};
use chat_core::{SnapshotPolicy, StateChange, VariableState};
use serde::{Deserialize, Serialize};

use crate::structs::turn::{StateMetadata, Turn, TurnId};

/// Storage decision for one turn's variable state.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableRecord {
    pub snapshot: Option<VariableState>,
    pub diff: Option<Vec<StateChange>>,
    pub metadata: StateMetadata,
}

impl VariableRecord {
    pub fn write_to(self, turn: &mut Turn) {
        turn.state_snapshot = self.snapshot;
        turn.state_diff = self.diff;
        turn.state_meta = Some(self.metadata);
    }
}

/// What is wrong with a state chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainIssue {
    EmptyPath,
    NotRooted,
    BrokenLink,
    /// Marked as changing state but carries neither snapshot nor diff.
    MissingRecord,
    /// Flagged as a snapshot but the snapshot is absent.
    MissingSnapshot,
    /// A diff sits on a parent whose state cannot be resolved.
    UnresolvableParent,
    /// A diff's recorded old value disagrees with the replayed parent state.
    StaleDiff { key: String },
}

impl ChainIssue {
    /// Issues that rewriting state fields can fix.
    pub fn is_repairable(&self) -> bool {
        !matches!(
            self,
            ChainIssue::EmptyPath | ChainIssue::NotRooted | ChainIssue::BrokenLink
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<TurnId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<ChainIssue>,
}

impl ValidationReport {
    fn valid() -> Self {
        Self {
            is_valid: true,
            broken_at: None,
            issue: None,
        }
    }

    fn broken(turn_id: Option<&str>, issue: ChainIssue) -> Self {
        Self {
            is_valid: false,
            broken_at: turn_id.map(str::to_string),
            issue: Some(issue),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStatistics {
    pub total_nodes: usize,
    pub snapshot_count: usize,
    pub diff_count: usize,
    /// Stored state bytes divided by the bytes full snapshots would take.
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Default)]
pub struct BranchStateManager {
    policy: SnapshotPolicy,
}

impl BranchStateManager {
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    /// Decide how to store `live_state` for `turn_id`.
    ///
    /// `diff_depth` is the number of consecutive diff turns ending at the
    /// parent (see [`diff_depth`]).
    pub fn create_variable_record(
        &self,
        turn_id: &str,
        parent: Option<&Turn>,
        parent_resolved: &VariableState,
        live_state: &VariableState,
        force_snapshot: bool,
        diff_depth: usize,
    ) -> VariableRecord {
        let changes = diff(parent_resolved, live_state);
        let has_changes = !changes.is_empty();
        let snapshot_bytes = state_byte_size(live_state);
        let diff_bytes = changes_byte_size(&changes);

        let parent_has_record = parent
            .map(|p| p.is_root() || p.has_state_record() || p.state_meta.is_some())
            .unwrap_or(false);
        let checkpoint_due =
            self.policy.checkpoint_interval > 0 && diff_depth >= self.policy.checkpoint_interval;
        let diff_too_large = has_changes
            && snapshot_bytes >= self.policy.min_snapshot_bytes
            && diff_bytes as f64 > self.policy.max_diff_ratio * snapshot_bytes as f64;

        let reason = if force_snapshot {
            Some("forced")
        } else if !parent_has_record {
            Some("parent has no state record")
        } else if checkpoint_due {
            Some("checkpoint interval reached")
        } else if diff_too_large {
            Some("diff exceeds size ratio")
        } else {
            None
        };

        let change_count = changes.len();
        match reason {
            Some(reason) => {
                tracing::debug!(
                    turn_id = %turn_id,
                    reason = reason,
                    byte_size = snapshot_bytes,
                    "BranchState: storing snapshot"
                );
                VariableRecord {
                    snapshot: Some(live_state.clone()),
                    diff: None,
                    metadata: StateMetadata {
                        byte_size: snapshot_bytes,
                        has_changes,
                        is_snapshot: true,
                        change_count,
                    },
                }
            }
            None => {
                tracing::debug!(
                    turn_id = %turn_id,
                    change_count = change_count,
                    byte_size = diff_bytes,
                    "BranchState: storing diff"
                );
                VariableRecord {
                    snapshot: None,
                    diff: Some(changes),
                    metadata: StateMetadata {
                        byte_size: diff_bytes,
                        has_changes,
                        is_snapshot: false,
                        change_count,
                    },
                }
            }
        }
    }

    /// Resolved variable state at `turn_id`.
    ///
    /// A malformed path yields an empty state and a warning instead of an error.
    pub fn restore_variable_state(&self, turn_id: &str, path: &[Turn]) -> VariableState {
        if let Some(issue) = structural_issue(path) {
            tracing::warn!(turn_id = %turn_id, issue = ?issue, "BranchState: cannot restore from malformed path");
            return VariableState::new();
        }
        if path.last().map(|turn| turn.id.as_str()) != Some(turn_id) {
            tracing::warn!(turn_id = %turn_id, "BranchState: path does not end at the requested turn");
            return VariableState::new();
        }

        path.iter()
            .skip(1)
            .fold(VariableState::new(), |state, turn| resolve_step(&state, turn))
    }

    /// Walk the path and report the first turn whose state cannot be trusted.
    pub fn validate_variable_state(&self, path: &[Turn]) -> ValidationReport {
        if let Some(issue) = structural_issue(path) {
            let broken_at = match issue {
                ChainIssue::EmptyPath => None,
                ChainIssue::NotRooted => path.first().map(|turn| turn.id.as_str()),
                _ => path
                    .windows(2)
                    .find(|pair| pair[1].parent_id.as_deref() != Some(pair[0].id.as_str()))
                    .map(|pair| pair[1].id.as_str()),
            };
            return ValidationReport::broken(broken_at, issue);
        }

        let mut state = VariableState::new();
        let mut resolvable = true;

        for turn in path.iter().skip(1) {
            if let Some(meta) = &turn.state_meta {
                if meta.is_snapshot && turn.state_snapshot.is_none() {
                    return ValidationReport::broken(Some(turn.id.as_str()), ChainIssue::MissingSnapshot);
                }
                if meta.has_changes && !turn.has_state_record() {
                    return ValidationReport::broken(Some(turn.id.as_str()), ChainIssue::MissingRecord);
                }
            }

            if let Some(snapshot) = &turn.state_snapshot {
                state = snapshot.clone();
                resolvable = true;
            } else if let Some(changes) = &turn.state_diff {
                if !resolvable {
                    return ValidationReport::broken(
                        Some(turn.id.as_str()),
                        ChainIssue::UnresolvableParent,
                    );
                }
                if let Err(key) = verify(&state, changes) {
                    return ValidationReport::broken(Some(turn.id.as_str()), ChainIssue::StaleDiff { key });
                }
                state = apply(&state, changes);
            } else if turn.state_meta.is_none() {
                // Legacy turn without any record: inherits, but cannot anchor a diff.
                resolvable = false;
            }
        }

        ValidationReport::valid()
    }

    /// Rewrite the state records of the broken turn and everything after it
    /// in `path`, using the best-known state for each turn.
    ///
    /// `live_state`, when given, is taken as the state of the last turn in the
    /// path. Only state fields are touched. Returns whether the path validates
    /// afterwards.
    pub fn repair_variable_state_chain(
        &self,
        path: &mut [Turn],
        live_state: Option<&VariableState>,
    ) -> bool {
        let report = self.validate_variable_state(path);
        if report.is_valid {
            return true;
        }

        let (Some(broken_id), Some(issue)) = (report.broken_at, report.issue) else {
            return false;
        };
        if !issue.is_repairable() {
            tracing::warn!(turn_id = %broken_id, issue = ?issue, "BranchState: chain cannot be repaired by rewriting state");
            return false;
        }
        let Some(start) = path.iter().position(|turn| turn.id == broken_id) else {
            return false;
        };
        if start == 0 {
            return false;
        }

        tracing::info!(
            turn_id = %broken_id,
            issue = ?issue,
            rewritten = path.len() - start,
            "BranchState: repairing state chain"
        );

        let mut parent_state = path[1..start]
            .iter()
            .fold(VariableState::new(), |state, turn| resolve_step(&state, turn));
        let last = path.len() - 1;

        for index in start..path.len() {
            let intended = match live_state {
                Some(live) if index == last => live.clone(),
                _ => resolve_step(&parent_state, &path[index]),
            };
            let record = self.create_variable_record(
                &path[index].id,
                Some(&path[index - 1]),
                &parent_state,
                &intended,
                index == start,
                diff_depth(&path[..index]),
            );
            record.write_to(&mut path[index]);
            parent_state = intended;
        }

        let repaired = self.validate_variable_state(path).is_valid;
        if !repaired {
            tracing::warn!(turn_id = %broken_id, "BranchState: chain still invalid after repair");
        }
        repaired
    }

    /// Diagnostic counters for the turns on `path`. No side effects.
    pub fn get_storage_statistics(&self, path: &[Turn]) -> StorageStatistics {
        let mut snapshot_count = 0;
        let mut diff_count = 0;
        let mut stored_bytes = 0usize;
        let mut full_bytes = 0usize;
        let mut state = VariableState::new();

        for turn in path.iter().filter(|turn| !turn.is_root()) {
            if let Some(snapshot) = &turn.state_snapshot {
                snapshot_count += 1;
                stored_bytes += state_byte_size(snapshot);
            } else if let Some(changes) = &turn.state_diff {
                diff_count += 1;
                stored_bytes += changes_byte_size(changes);
            }
            state = resolve_step(&state, turn);
            full_bytes += state_byte_size(&state);
        }

        StorageStatistics {
            total_nodes: path.iter().filter(|turn| !turn.is_root()).count(),
            snapshot_count,
            diff_count,
            compression_ratio: if full_bytes == 0 {
                1.0
            } else {
                stored_bytes as f64 / full_bytes as f64
            },
        }
    }
}

/// Number of consecutive diff turns at the end of `path`.
pub fn diff_depth(path: &[Turn]) -> usize {
    path.iter()
        .rev()
        .take_while(|turn| !turn.is_root() && !turn.is_snapshot() && turn.state_diff.is_some())
        .count()
}

fn structural_issue(path: &[Turn]) -> Option<ChainIssue> {
    let Some(first) = path.first() else {
        return Some(ChainIssue::EmptyPath);
    };
    if !first.is_root() {
        return Some(ChainIssue::NotRooted);
    }
    let linked = path
        .windows(2)
        .all(|pair| pair[1].parent_id.as_deref() == Some(pair[0].id.as_str()));
    (!linked).then_some(ChainIssue::BrokenLink)
}

// One replay step: a snapshot substitutes, a diff applies, no record inherits.
fn resolve_step(parent_state: &VariableState, turn: &Turn) -> VariableState {
    if let Some(snapshot) = &turn.state_snapshot {
        snapshot.clone()
    } else if let Some(changes) = &turn.state_diff {
        apply(parent_state, changes)
    } else {
        parent_state.clone()
    }
}
