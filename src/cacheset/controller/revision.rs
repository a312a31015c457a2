/*
 * Copyright (C) 2025 The Cacheset Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use super::identity::pod_revision;
use super::workerset::WorkerSetError;
use crate::cacheset::k8s::pod::{ObjectMeta, Pod};
use crate::cacheset::k8s::revision::ControllerRevision;
use crate::cacheset::k8s::store::ClusterState;
use crate::cacheset::k8s::workerset::{WorkerSet, SET_NAME_LABEL};
use crate::cacheset::logger::log_debug;

const COMPONENT: &str = "workerset.revisions";

/// Longest revision-name prefix that still leaves room for a hash suffix
/// within the 253-character object name limit.
const MAX_NAME_PREFIX: usize = 223;

/// Attempts before a run of hash collisions becomes a terminal error.
const MAX_COLLISION_RETRIES: i32 = 5;

/// History kept per set when `revision_history_limit` is unset.
const DEFAULT_HISTORY_LIMIT: usize = 10;

/// FNV-1 32-bit over the given bytes.
fn fnv32(data: &[u8], probe: Option<i32>) -> u32 {
    let mut hash: u32 = 2166136261;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash = hash.wrapping_mul(16777619);
            hash ^= *byte as u32;
        }
    };
    feed(data);
    if let Some(probe) = probe {
        feed(probe.to_string().as_bytes());
    }
    hash
}

/// Maps a string onto an alphabet with no vowels or lookalikes, so generated
/// names cannot spell anything or confuse 0/O and 1/l.
fn safe_encode(input: &str) -> String {
    const ALPHANUMS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
    input
        .bytes()
        .map(|byte| ALPHANUMS[byte as usize % ALPHANUMS.len()] as char)
        .collect()
}

/// Content hash for a revision: FNV-32 over the patch bytes mixed with the
/// collision counter, safe-encoded.
pub fn revision_hash(data: &[u8], collision_count: Option<i32>) -> String {
    safe_encode(&fnv32(data, collision_count).to_string())
}

/// `<set name>-<hash>`, with the prefix truncated to fit the name limit.
pub fn revision_name(set_name: &str, hash: &str) -> String {
    let prefix: String = set_name.chars().take(MAX_NAME_PREFIX).collect();
    format!("{}-{}", prefix, hash)
}

/// Serializes the part of the set a revision must capture: the pod template
/// subtree, marked as a replacement patch.
pub fn template_patch(set: &WorkerSet) -> Result<Value, serde_json::Error> {
    let mut template = serde_json::to_value(&set.spec.template)?;
    if let Some(object) = template.as_object_mut() {
        object.insert("$patch".to_string(), Value::String("replace".to_string()));
    }
    Ok(json!({ "spec": { "template": template } }))
}

/// Builds the numbered revision snapshot for the set's current template.
pub fn new_revision(
    set: &WorkerSet,
    number: i64,
    collision_count: Option<i32>,
) -> Result<ControllerRevision, serde_json::Error> {
    let patch = template_patch(set)?;
    let bytes = serde_json::to_vec(&patch)?;
    let name = revision_name(set.name(), &revision_hash(&bytes, collision_count));
    let mut labels = set.spec.selector.match_labels.clone();
    labels.insert(SET_NAME_LABEL.to_string(), set.name().to_string());
    Ok(ControllerRevision::new(
        ObjectMeta {
            name: Some(name),
            namespace: set.metadata.namespace.clone(),
            labels,
            ..Default::default()
        },
        patch,
        number,
    ))
}

/// Restores a set to the template a revision captured, via a JSON round trip
/// over the live object.
pub fn apply_revision(
    set: &WorkerSet,
    revision: &ControllerRevision,
) -> Result<WorkerSet, serde_json::Error> {
    let mut template = revision.data["spec"]["template"].clone();
    if let Some(object) = template.as_object_mut() {
        object.remove("$patch");
    }
    let mut restored = serde_json::to_value(set)?;
    restored["spec"]["template"] = template;
    serde_json::from_value(restored)
}

/// The number the next revision of this history receives.
pub fn next_revision_number(revisions: &[ControllerRevision]) -> i64 {
    revisions.last().map(|r| r.revision + 1).unwrap_or(1)
}

fn revisions_equal(a: &ControllerRevision, b: &ControllerRevision) -> bool {
    a.data == b.data
}

/// Current and update revisions resolved for one reconciliation pass.
pub struct RevisionPlan {
    pub current: ControllerRevision,
    pub update: ControllerRevision,
    pub collision_count: i32,
}

/// Owns ControllerRevision persistence for worker sets.
#[derive(Clone)]
pub struct RevisionStore {
    state: Arc<ClusterState>,
}

impl RevisionStore {
    pub fn new(state: Arc<ClusterState>) -> Self {
        Self { state }
    }

    /// The set's revision history, ascending by revision number with name as
    /// the tiebreaker.
    pub fn list(&self, set: &WorkerSet) -> Vec<ControllerRevision> {
        let mut revisions = self
            .state
            .list_revisions(set.metadata.namespace.as_deref(), &set.spec.selector)
            .into_iter()
            .filter(|revision| {
                revision.metadata.labels.get(SET_NAME_LABEL).map(String::as_str)
                    == Some(set.name())
            })
            .collect::<Vec<_>>();
        revisions.sort_by(|a, b| {
            a.revision
                .cmp(&b.revision)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        revisions
    }

    /// Resolves the current and update revisions for a pass, creating or
    /// re-stamping history entries as needed. `revisions` must be sorted
    /// ascending and is amended in place when new history is written.
    pub fn resolve(
        &self,
        set: &WorkerSet,
        revisions: &mut Vec<ControllerRevision>,
    ) -> Result<RevisionPlan, WorkerSetError> {
        let collision_count = set
            .status
            .as_ref()
            .and_then(|status| status.collision_count)
            .unwrap_or(0);
        let candidate = new_revision(set, next_revision_number(revisions), Some(collision_count))?;

        let equal_positions: Vec<usize> = revisions
            .iter()
            .enumerate()
            .filter(|(_, existing)| revisions_equal(existing, &candidate))
            .map(|(index, _)| index)
            .collect();

        let update = match equal_positions.last().copied() {
            // The template already heads the history: reuse it untouched.
            Some(index) if index == revisions.len() - 1 => revisions[index].clone(),
            // A rollback: pull the matching snapshot forward to the head.
            Some(index) => {
                let mut promoted = revisions[index].clone();
                promoted.revision = candidate.revision;
                let updated = self.state.update_revision(promoted)?;
                revisions[index] = updated.clone();
                updated
            }
            None => {
                let (created, collision_count) =
                    self.create_with_collision_handling(set, candidate, collision_count)?;
                revisions.push(created.clone());
                return Ok(RevisionPlan {
                    current: self.current_of(set, revisions, &created),
                    update: created,
                    collision_count,
                });
            }
        };

        Ok(RevisionPlan {
            current: self.current_of(set, revisions, &update),
            update,
            collision_count,
        })
    }

    fn current_of(
        &self,
        set: &WorkerSet,
        revisions: &[ControllerRevision],
        update: &ControllerRevision,
    ) -> ControllerRevision {
        let current_name = set
            .status
            .as_ref()
            .and_then(|status| status.current_revision.as_deref())
            .unwrap_or_default();
        revisions
            .iter()
            .find(|revision| revision.name() == current_name)
            .cloned()
            .unwrap_or_else(|| update.clone())
    }

    /// Creates the revision, renaming through the collision counter whenever
    /// an existing object holds the name with different content. Bounded; a
    /// set that keeps colliding is broken beyond what retrying can fix.
    fn create_with_collision_handling(
        &self,
        set: &WorkerSet,
        mut candidate: ControllerRevision,
        mut collision_count: i32,
    ) -> Result<(ControllerRevision, i32), WorkerSetError> {
        for _ in 0..MAX_COLLISION_RETRIES {
            match self.state.create_revision(candidate.clone()) {
                Ok(created) => return Ok((created, collision_count)),
                Err(error) if error.is_already_exists() => {
                    let existing = self
                        .state
                        .get_revision(candidate.metadata.namespace.as_deref(), candidate.name())?;
                    if revisions_equal(&existing, &candidate) {
                        return Ok((existing, collision_count));
                    }
                    collision_count += 1;
                    log_debug(
                        COMPONENT,
                        "revision name collision, renaming",
                        &[
                            ("set", set.name()),
                            ("collisionCount", &collision_count.to_string()),
                        ],
                    );
                    candidate = new_revision(set, candidate.revision, Some(collision_count))?;
                }
                Err(error) => return Err(WorkerSetError::Api(error)),
            }
        }
        Err(WorkerSetError::CollisionExhausted {
            set: set.name().to_string(),
            attempts: MAX_COLLISION_RETRIES,
        })
    }

    /// Deletes dead history beyond the retention limit, oldest first. Live
    /// revisions are the current and update revisions plus anything a pod
    /// still references.
    pub fn truncate_history(
        &self,
        set: &WorkerSet,
        pods: &[Pod],
        revisions: &[ControllerRevision],
        current: &ControllerRevision,
        update: &ControllerRevision,
    ) -> Result<(), WorkerSetError> {
        let limit = set
            .spec
            .revision_history_limit
            .map(|limit| limit.max(0) as usize)
            .unwrap_or(DEFAULT_HISTORY_LIMIT);
        let mut live: BTreeSet<String> = pods.iter().map(pod_revision).collect();
        live.insert(current.name().to_string());
        live.insert(update.name().to_string());

        let dead: Vec<&ControllerRevision> = revisions
            .iter()
            .filter(|revision| !live.contains(revision.name()))
            .collect();
        if dead.len() <= limit {
            return Ok(());
        }
        for revision in &dead[..dead.len() - limit] {
            self.state
                .delete_revision(revision.metadata.namespace.as_deref(), revision.name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacheset::k8s::pod::{ContainerSpec, ObjectMeta};
    use crate::cacheset::k8s::workerset::{WorkerSetSpec, WorkerSetStatus};

    fn sample_set(image: &str) -> WorkerSet {
        let mut set = WorkerSet::new(
            ObjectMeta::named("cache", "default"),
            WorkerSetSpec {
                replicas: Some(2),
                ..Default::default()
            },
        );
        set.spec.template.spec.containers = vec![ContainerSpec {
            name: "worker".to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }];
        set
    }

    #[test]
    fn patch_marks_template_as_replacement() {
        let patch = template_patch(&sample_set("cache:v1")).expect("patch");
        assert_eq!(patch["spec"]["template"]["$patch"], "replace");
        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"][0]["image"],
            "cache:v1"
        );
    }

    #[test]
    fn hash_is_stable_and_collision_count_changes_it() {
        let data = b"revision-bytes";
        assert_eq!(revision_hash(data, Some(0)), revision_hash(data, Some(0)));
        assert_ne!(revision_hash(data, Some(0)), revision_hash(data, Some(1)));
        assert_ne!(revision_hash(data, None), revision_hash(b"other", None));
    }

    #[test]
    fn names_stay_within_the_object_name_limit() {
        let long_name = "n".repeat(300);
        let name = revision_name(&long_name, "abcdef");
        assert!(name.len() <= 253);
        assert!(name.starts_with(&"n".repeat(MAX_NAME_PREFIX)));
        assert!(name.ends_with("-abcdef"));
    }

    #[test]
    fn apply_revision_restores_the_captured_template() {
        let old = sample_set("cache:v1");
        let revision = new_revision(&old, 1, Some(0)).expect("revision");
        let new = sample_set("cache:v2");
        let restored = apply_revision(&new, &revision).expect("apply");
        assert_eq!(
            restored.spec.template.spec.containers[0].image.as_deref(),
            Some("cache:v1")
        );
        // Everything outside the template comes from the live object.
        assert_eq!(restored.replicas(), 2);
    }

    #[test]
    fn resolve_is_idempotent_for_an_unchanged_template() {
        let state = Arc::new(ClusterState::new());
        let store = RevisionStore::new(state);
        let set = sample_set("cache:v1");

        let mut revisions = store.list(&set);
        let first = store.resolve(&set, &mut revisions).expect("first resolve");
        assert_eq!(first.update.revision, 1);

        let mut revisions = store.list(&set);
        assert_eq!(revisions.len(), 1);
        let second = store.resolve(&set, &mut revisions).expect("second resolve");
        assert_eq!(second.update.name(), first.update.name());
        assert_eq!(store.list(&set).len(), 1, "no duplicate history entries");
    }

    #[test]
    fn changed_template_appends_a_numbered_revision() {
        let state = Arc::new(ClusterState::new());
        let store = RevisionStore::new(state);

        let v1 = sample_set("cache:v1");
        let mut revisions = store.list(&v1);
        store.resolve(&v1, &mut revisions).expect("v1 resolve");

        let v2 = sample_set("cache:v2");
        let mut revisions = store.list(&v2);
        let plan = store.resolve(&v2, &mut revisions).expect("v2 resolve");
        assert_eq!(plan.update.revision, 2);
        assert_eq!(store.list(&v2).len(), 2);
    }

    #[test]
    fn rollback_restamps_the_old_snapshot_forward() {
        let state = Arc::new(ClusterState::new());
        let store = RevisionStore::new(state);

        let v1 = sample_set("cache:v1");
        let mut revisions = store.list(&v1);
        let v1_plan = store.resolve(&v1, &mut revisions).expect("v1");

        let v2 = sample_set("cache:v2");
        let mut revisions = store.list(&v2);
        store.resolve(&v2, &mut revisions).expect("v2");

        // Back to the v1 template: its snapshot moves to the head.
        let mut revisions = store.list(&v1);
        let rollback = store.resolve(&v1, &mut revisions).expect("rollback");
        assert_eq!(rollback.update.name(), v1_plan.update.name());
        assert_eq!(rollback.update.revision, 3);
        assert_eq!(store.list(&v1).len(), 2, "history is reused, not duplicated");
    }

    #[test]
    fn current_falls_back_to_update_for_new_sets() {
        let state = Arc::new(ClusterState::new());
        let store = RevisionStore::new(state);
        let set = sample_set("cache:v1");
        let mut revisions = store.list(&set);
        let plan = store.resolve(&set, &mut revisions).expect("resolve");
        assert_eq!(plan.current.name(), plan.update.name());
    }

    #[test]
    fn current_tracks_the_status_revision() {
        let state = Arc::new(ClusterState::new());
        let store = RevisionStore::new(state);

        let v1 = sample_set("cache:v1");
        let mut revisions = store.list(&v1);
        let v1_plan = store.resolve(&v1, &mut revisions).expect("v1");

        let mut v2 = sample_set("cache:v2");
        v2.status = Some(WorkerSetStatus {
            current_revision: Some(v1_plan.update.name().to_string()),
            ..Default::default()
        });
        let mut revisions = store.list(&v2);
        let plan = store.resolve(&v2, &mut revisions).expect("v2");
        assert_eq!(plan.current.name(), v1_plan.update.name());
        assert_ne!(plan.update.name(), plan.current.name());
    }

    #[test]
    fn name_collision_bumps_counter_and_renames() {
        let state = Arc::new(ClusterState::new());
        let store = RevisionStore::new(state.clone());
        let set = sample_set("cache:v1");

        // Occupy the candidate's name with different content.
        let candidate = new_revision(&set, 1, Some(0)).expect("candidate");
        let blocker = ControllerRevision::new(
            ObjectMeta {
                name: candidate.metadata.name.clone(),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            json!({ "spec": { "template": { "something": "else" } } }),
            9,
        );
        state.create_revision(blocker).expect("blocker");

        let mut revisions = Vec::new();
        let plan = store.resolve(&set, &mut revisions).expect("resolve");
        assert_eq!(plan.collision_count, 1);
        assert_ne!(plan.update.name(), candidate.name());
    }

    #[test]
    fn truncate_drops_only_dead_history() {
        let state = Arc::new(ClusterState::new());
        let store = RevisionStore::new(state);

        let mut set = sample_set("cache:v1");
        set.spec.revision_history_limit = Some(0);
        let mut names = Vec::new();
        for version in 1..=4 {
            let staged = sample_set(&format!("cache:v{version}"));
            let mut revisions = store.list(&staged);
            let plan = store.resolve(&staged, &mut revisions).expect("resolve");
            names.push(plan.update.name().to_string());
        }
        let revisions = store.list(&set);
        assert_eq!(revisions.len(), 4);

        let current = revisions[2].clone();
        let update = revisions[3].clone();
        store
            .truncate_history(&set, &[], &revisions, &current, &update)
            .expect("truncate");

        let remaining: Vec<String> = store
            .list(&set)
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&current.name().to_string()));
        assert!(remaining.contains(&update.name().to_string()));
    }
}
