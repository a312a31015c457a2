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

//! The worker set reconcile engine. Each pass observes the set and its pods,
//! performs at most one disruptive action under OrderedReady management, and
//! reports aggregate status. Progress across passes, not within one, is how
//! the set converges.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use super::identity::{
    identity_matches, member_ordinal, new_versioned_pod, pod_revision, storage_matches,
};
use super::ordinals::OrdinalWindow;
use super::pod_control::PodControl;
use super::revision::{apply_revision, RevisionStore};
use crate::cacheset::k8s::event::{EventRecorder, ObjectReference, EVENT_TYPE_WARNING};
use crate::cacheset::k8s::hijack::WorkerSetClient;
use crate::cacheset::k8s::pod::Pod;
use crate::cacheset::k8s::store::{ApiError, ClusterState};
use crate::cacheset::k8s::workerset::{WorkerSet, WorkerSetStatus};
use crate::cacheset::logger::{log_debug, log_info};
use crate::cacheset::util::{retry_with_backoff, Backoff};

const COMPONENT: &str = "workerset.controller";

/// Backoff for status writes racing other writers of the set.
const STATUS_UPDATE_BACKOFF: Backoff = Backoff::new(4, Duration::from_millis(50), 2.0);

/// Errors surfaced while reconciling a worker set.
#[derive(Debug)]
pub enum WorkerSetError {
    Api(ApiError),
    Serialization(serde_json::Error),
    CollisionExhausted { set: String, attempts: i32 },
}

impl WorkerSetError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, WorkerSetError::Api(error) if error.is_conflict())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WorkerSetError::Api(error) if error.is_not_found())
    }
}

impl Display for WorkerSetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerSetError::Api(error) => write!(f, "{}", error),
            WorkerSetError::Serialization(error) => {
                write!(f, "serializing workload state failed: {}", error)
            }
            WorkerSetError::CollisionExhausted { set, attempts } => write!(
                f,
                "revision hash for set {} kept colliding after {} attempts",
                set, attempts
            ),
        }
    }
}

impl Error for WorkerSetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerSetError::Api(error) => Some(error),
            WorkerSetError::Serialization(error) => Some(error),
            WorkerSetError::CollisionExhausted { .. } => None,
        }
    }
}

impl From<ApiError> for WorkerSetError {
    fn from(error: ApiError) -> Self {
        WorkerSetError::Api(error)
    }
}

impl From<serde_json::Error> for WorkerSetError {
    fn from(error: serde_json::Error) -> Self {
        WorkerSetError::Serialization(error)
    }
}

/// Reconciles worker sets against observed pods.
#[derive(Clone)]
pub struct WorkerSetController {
    state: Arc<ClusterState>,
    sets: WorkerSetClient,
    revisions: RevisionStore,
    pod_control: PodControl,
    recorder: Arc<EventRecorder>,
}

impl WorkerSetController {
    pub fn new(state: Arc<ClusterState>, recorder: Arc<EventRecorder>) -> Self {
        Self {
            sets: WorkerSetClient::new(state.clone()),
            revisions: RevisionStore::new(state.clone()),
            pod_control: PodControl::new(state.clone(), recorder.clone()),
            state,
            recorder,
        }
    }

    /// One reconciliation pass for the named set.
    pub async fn reconcile(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), WorkerSetError> {
        let set = match self.sets.get(namespace, name) {
            Ok(set) => set,
            Err(error) if error.is_not_found() => {
                log_debug(COMPONENT, "set vanished before reconcile", &[("set", name)]);
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let mut revisions = self.revisions.list(&set);
        let plan = self.revisions.resolve(&set, &mut revisions)?;
        let current_set = apply_revision(&set, &plan.current)?;
        let update_set = apply_revision(&set, &plan.update)?;

        let pods = self.member_pods(&set);
        let status = self
            .perform_pass(
                &set,
                &current_set,
                &update_set,
                plan.current.name(),
                plan.update.name(),
                plan.collision_count,
                pods,
            )
            .await?;

        self.write_status(&set, status).await?;

        let pods = self.member_pods(&set);
        self.revisions
            .truncate_history(&set, &pods, &revisions, &plan.current, &plan.update)?;
        Ok(())
    }

    fn member_pods(&self, set: &WorkerSet) -> Vec<Pod> {
        self.state
            .list_pods(set.metadata.namespace.as_deref(), &set.spec.selector)
            .into_iter()
            .filter(|pod| member_ordinal(set, pod).is_some())
            .collect()
    }

    /// The management pass. Mutates the cluster through unit control and
    /// returns the status observed along the way. Under monotonic management
    /// the pass returns right after its first disruptive action.
    #[allow(clippy::too_many_arguments)]
    async fn perform_pass(
        &self,
        set: &WorkerSet,
        current_set: &WorkerSet,
        update_set: &WorkerSet,
        current_revision: &str,
        update_revision: &str,
        collision_count: i32,
        pods: Vec<Pod>,
    ) -> Result<WorkerSetStatus, WorkerSetError> {
        let window = OrdinalWindow::compute(set.replicas(), &set.delete_slots());
        let monotonic = !set.allows_burst();

        let mut status = WorkerSetStatus {
            observed_generation: set.metadata.generation,
            current_revision: Some(current_revision.to_string()),
            update_revision: Some(update_revision.to_string()),
            collision_count: Some(collision_count),
            ..Default::default()
        };
        for pod in &pods {
            if pod.is_created() {
                status.replicas += 1;
            }
            if pod.is_running_and_ready() {
                status.ready_replicas += 1;
            }
            if pod.is_created() && !pod.is_terminating() {
                let revision = pod_revision(pod);
                if revision == current_revision {
                    status.current_replicas += 1;
                }
                if revision == update_revision {
                    status.updated_replicas += 1;
                }
            }
        }

        // Classify into the active window versus condemned. A pod whose
        // ordinal fell out of the window, or now sits in a delete slot, is on
        // its way out.
        let mut replicas: HashMap<u32, Pod> = HashMap::new();
        let mut condemned: Vec<Pod> = Vec::new();
        for pod in pods {
            let ordinal = match member_ordinal(set, &pod) {
                Some(ordinal) => ordinal,
                None => continue,
            };
            if window.contains(ordinal) {
                replicas.insert(ordinal, pod);
            } else {
                condemned.push(pod);
            }
        }
        for ordinal in window.ordinals() {
            replicas.entry(ordinal).or_insert_with(|| {
                new_versioned_pod(current_set, update_set, current_revision, update_revision, ordinal)
            });
        }
        condemned.sort_by_key(|pod| std::cmp::Reverse(member_ordinal(set, pod).unwrap_or(0)));

        // Lowest unhealthy ordinal across window and condemned units; the
        // monotonic gate lets only this one be acted on while others wait.
        let mut first_unhealthy: Option<(u32, String)> = None;
        for (ordinal, pod) in replicas
            .iter()
            .map(|(o, p)| (*o, p))
            .chain(
                condemned
                    .iter()
                    .filter_map(|p| member_ordinal(set, p).map(|o| (o, p))),
            )
        {
            if !pod.is_healthy() && first_unhealthy.as_ref().map(|(o, _)| ordinal < *o).unwrap_or(true)
            {
                first_unhealthy = Some((ordinal, pod.name().to_string()));
            }
        }

        if set.metadata.deletion_timestamp.is_some() {
            return Ok(status);
        }

        for ordinal in window.ordinals() {
            // The entry always exists after gap filling.
            let mut pod = match replicas.get(&ordinal) {
                Some(pod) => pod.clone(),
                None => continue,
            };

            // Failed or finished units are recreated at their revision.
            if pod.is_failed() || pod.is_succeeded() {
                let reason = if pod.is_failed() {
                    "RecreatingFailedPod"
                } else {
                    "RecreatingTerminatedPod"
                };
                self.recorder.record(
                    self.set_reference(set),
                    EVENT_TYPE_WARNING,
                    reason,
                    &format!(
                        "StatefulSet {}/{} is recreating Pod {}",
                        set.metadata.namespace.as_deref().unwrap_or("default"),
                        set.name(),
                        pod.name()
                    ),
                );
                self.pod_control.delete_set_pod(set, &pod)?;
                status.replicas -= 1;
                let revision = pod_revision(&pod);
                if revision == current_revision {
                    status.current_replicas -= 1;
                }
                if revision == update_revision {
                    status.updated_replicas -= 1;
                }
                pod = new_versioned_pod(
                    current_set,
                    update_set,
                    current_revision,
                    update_revision,
                    ordinal,
                );
                replicas.insert(ordinal, pod.clone());
            }

            if !pod.is_created() {
                self.pod_control.create_set_pod(set, &pod)?;
                status.replicas += 1;
                let revision = pod_revision(&pod);
                if revision == current_revision {
                    status.current_replicas += 1;
                }
                if revision == update_revision {
                    status.updated_replicas += 1;
                }
                if monotonic {
                    return Ok(status);
                }
                continue;
            }

            // A terminating unit blocks ordered progress until it goes away.
            if pod.is_terminating() && monotonic {
                log_debug(
                    COMPONENT,
                    "waiting for unit to terminate",
                    &[("set", set.name()), ("pod", pod.name())],
                );
                return Ok(status);
            }

            if !pod.is_running_and_ready() && monotonic {
                log_debug(
                    COMPONENT,
                    "waiting for unit to become ready",
                    &[("set", set.name()), ("pod", pod.name())],
                );
                return Ok(status);
            }

            // Repair identity or storage drift in place; not disruptive.
            if !identity_matches(set, &pod) || !storage_matches(set, &pod) {
                self.pod_control.update_set_pod(set, &pod).await?;
            }
        }

        // Condemned units leave highest ordinal first.
        for pod in &condemned {
            if pod.is_terminating() {
                if monotonic {
                    log_debug(
                        COMPONENT,
                        "waiting for condemned unit to terminate",
                        &[("set", set.name()), ("pod", pod.name())],
                    );
                    return Ok(status);
                }
                continue;
            }
            let is_first_unhealthy = first_unhealthy
                .as_ref()
                .map(|(_, name)| name == pod.name())
                .unwrap_or(false);
            if !pod.is_running_and_ready() && monotonic && !is_first_unhealthy {
                log_debug(
                    COMPONENT,
                    "blocked on unhealthy unit before scale-in",
                    &[("set", set.name()), ("pod", pod.name())],
                );
                return Ok(status);
            }
            self.pod_control.delete_set_pod(set, pod)?;
            let revision = pod_revision(pod);
            if revision == current_revision {
                status.current_replicas -= 1;
            }
            if revision == update_revision {
                status.updated_replicas -= 1;
            }
            if monotonic {
                return Ok(status);
            }
        }

        if set.spec.update_strategy.is_on_delete() {
            return Ok(status);
        }

        // Rolling update: walk from the top of the window down to the
        // partition, replacing one stale unit per pass and holding position
        // while anything is unhealthy.
        let partition = set.spec.update_strategy.partition();
        for ordinal in window.ordinals().into_iter().rev() {
            if ordinal < partition {
                break;
            }
            let pod = match replicas.get(&ordinal) {
                Some(pod) => pod,
                None => continue,
            };
            if pod_revision(pod) != update_revision && !pod.is_terminating() {
                log_info(
                    COMPONENT,
                    "terminating unit for rolling update",
                    &[("set", set.name()), ("pod", pod.name())],
                );
                self.pod_control.delete_set_pod(set, pod)?;
                if pod_revision(pod) == current_revision {
                    status.current_replicas -= 1;
                }
                return Ok(status);
            }
            if !pod.is_healthy() {
                return Ok(status);
            }
        }

        Ok(status)
    }

    /// Writes the pass's status, promoting a finished rolling update,
    /// suppressing no-ops, and riding out write conflicts by re-reading the
    /// live set.
    async fn write_status(
        &self,
        set: &WorkerSet,
        status: WorkerSetStatus,
    ) -> Result<(), WorkerSetError> {
        let status = complete_rolling_update(set, status);
        if set.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let namespace = set.metadata.namespace.clone();
        let name = set.name().to_string();
        retry_with_backoff(
            STATUS_UPDATE_BACKOFF,
            |attempt| {
                let namespace = namespace.clone();
                let name = name.clone();
                let status = status.clone();
                async move {
                    let mut target = if attempt == 0 {
                        set.clone()
                    } else {
                        self.sets.get(namespace.as_deref(), &name)?
                    };
                    if target.status.as_ref() == Some(&status) {
                        return Ok(());
                    }
                    target.status = Some(status);
                    self.sets.update_status(&target)?;
                    Ok(())
                }
            },
            |error: &WorkerSetError| error.is_conflict(),
        )
        .await
    }

    fn set_reference(&self, set: &WorkerSet) -> ObjectReference {
        ObjectReference::to_object(
            "StatefulSet",
            set.metadata.namespace.as_deref().unwrap_or("default"),
            set.name(),
        )
    }
}

/// Once every unit is updated and ready, the update revision becomes the
/// current one.
fn complete_rolling_update(set: &WorkerSet, mut status: WorkerSetStatus) -> WorkerSetStatus {
    if !set.spec.update_strategy.is_on_delete()
        && status.updated_replicas == status.replicas
        && status.ready_replicas == status.replicas
    {
        status.current_replicas = status.updated_replicas;
        status.current_revision = status.update_revision.clone();
    }
    status
}
