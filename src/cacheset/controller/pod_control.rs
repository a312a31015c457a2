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

use std::sync::Arc;
use std::time::Duration;

use super::identity::{
    claims_for_ordinal, identity_matches, member_ordinal, storage_matches, update_identity,
    update_storage,
};
use super::workerset::WorkerSetError;
use crate::cacheset::k8s::event::{EventRecorder, ObjectReference, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::cacheset::k8s::pod::Pod;
use crate::cacheset::k8s::store::ClusterState;
use crate::cacheset::k8s::workerset::WorkerSet;
use crate::cacheset::logger::log_debug;
use crate::cacheset::util::{retry_with_backoff, Backoff};

const COMPONENT: &str = "workerset.podcontrol";

/// Backoff for update attempts that race other writers of the pod.
const UPDATE_BACKOFF: Backoff = Backoff::new(4, Duration::from_millis(100), 1.5);

/// Executes pod-level actions for the set controller, recording an event per
/// attempted operation.
#[derive(Clone)]
pub struct PodControl {
    state: Arc<ClusterState>,
    recorder: Arc<EventRecorder>,
}

impl PodControl {
    pub fn new(state: Arc<ClusterState>, recorder: Arc<EventRecorder>) -> Self {
        Self { state, recorder }
    }

    /// Creates the pod's claims and then the pod itself.
    pub fn create_set_pod(&self, set: &WorkerSet, pod: &Pod) -> Result<(), WorkerSetError> {
        if let Err(error) = self.create_claims(set, pod) {
            self.record_pod_event("create", set, pod.name(), Some(&error));
            return Err(error);
        }
        let result = self
            .state
            .create_pod(pod.clone())
            .map(|_| ())
            .map_err(WorkerSetError::Api);
        self.record_pod_event("create", set, pod.name(), result.as_ref().err());
        result
    }

    /// Repairs identity and storage drift on the pod, retrying around write
    /// races. A pod that already matches is left untouched and unreported.
    pub async fn update_set_pod(&self, set: &WorkerSet, pod: &Pod) -> Result<(), WorkerSetError> {
        let namespace = set.metadata.namespace.clone();
        let pod_name = pod.name().to_string();
        let result = retry_with_backoff(
            UPDATE_BACKOFF,
            |attempt| {
                let namespace = namespace.clone();
                let pod_name = pod_name.clone();
                async move {
                    let mut target = if attempt == 0 {
                        pod.clone()
                    } else {
                        self.state.get_pod(namespace.as_deref(), &pod_name)?
                    };
                    let mut consistent = true;
                    if !identity_matches(set, &target) {
                        update_identity(set, &mut target);
                        consistent = false;
                    }
                    if !storage_matches(set, &target) {
                        update_storage(set, &mut target);
                        self.create_claims(set, &target)?;
                        consistent = false;
                    }
                    if consistent {
                        return Ok(false);
                    }
                    self.state.update_pod(target)?;
                    Ok(true)
                }
            },
            |error: &WorkerSetError| error.is_conflict(),
        )
        .await;

        match result {
            Ok(true) => {
                self.record_pod_event("update", set, &pod_name, None);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(error) => {
                self.record_pod_event("update", set, &pod_name, Some(&error));
                Err(error)
            }
        }
    }

    pub fn delete_set_pod(&self, set: &WorkerSet, pod: &Pod) -> Result<(), WorkerSetError> {
        let result = self
            .state
            .delete_pod(set.metadata.namespace.as_deref(), pod.name())
            .map(|_| ())
            .map_err(WorkerSetError::Api);
        self.record_pod_event("delete", set, pod.name(), result.as_ref().err());
        result
    }

    /// Creates any claims the pod's ordinal requires that do not exist yet.
    fn create_claims(&self, set: &WorkerSet, pod: &Pod) -> Result<(), WorkerSetError> {
        let ordinal = match member_ordinal(set, pod) {
            Some(ordinal) => ordinal,
            None => return Ok(()),
        };
        for claim in claims_for_ordinal(set, ordinal) {
            let claim_name = claim.metadata.name.clone().unwrap_or_default();
            match self.state.get_claim(set.metadata.namespace.as_deref(), &claim_name) {
                Ok(_) => continue,
                Err(error) if error.is_not_found() => {
                    let result = self.state.create_claim(claim);
                    match result {
                        Ok(_) => self.record_claim_event("create", set, &claim_name, None),
                        Err(error) if error.is_already_exists() => {
                            log_debug(
                                COMPONENT,
                                "claim appeared concurrently",
                                &[("claim", claim_name.as_str())],
                            );
                        }
                        Err(error) => {
                            let error = WorkerSetError::Api(error);
                            self.record_claim_event("create", set, &claim_name, Some(&error));
                            return Err(error);
                        }
                    }
                }
                Err(error) => return Err(WorkerSetError::Api(error)),
            }
        }
        Ok(())
    }

    fn set_reference(&self, set: &WorkerSet) -> ObjectReference {
        ObjectReference::to_object(
            "StatefulSet",
            set.metadata.namespace.as_deref().unwrap_or("default"),
            set.name(),
        )
    }

    fn record_pod_event(
        &self,
        verb: &str,
        set: &WorkerSet,
        pod_name: &str,
        error: Option<&WorkerSetError>,
    ) {
        let title = capitalize(verb);
        match error {
            None => self.recorder.record(
                self.set_reference(set),
                EVENT_TYPE_NORMAL,
                &format!("Successful{}", title),
                &format!("{} Pod {} in StatefulSet {} successful", verb, pod_name, set.name()),
            ),
            Some(error) => self.recorder.record(
                self.set_reference(set),
                EVENT_TYPE_WARNING,
                &format!("Failed{}", title),
                &format!(
                    "{} Pod {} in StatefulSet {} failed error: {}",
                    verb,
                    pod_name,
                    set.name(),
                    error
                ),
            ),
        }
    }

    fn record_claim_event(
        &self,
        verb: &str,
        set: &WorkerSet,
        claim_name: &str,
        error: Option<&WorkerSetError>,
    ) {
        let title = capitalize(verb);
        match error {
            None => self.recorder.record(
                self.set_reference(set),
                EVENT_TYPE_NORMAL,
                &format!("Successful{}", title),
                &format!(
                    "{} Claim {} in StatefulSet {} successful",
                    verb,
                    claim_name,
                    set.name()
                ),
            ),
            Some(error) => self.recorder.record(
                self.set_reference(set),
                EVENT_TYPE_WARNING,
                &format!("Failed{}", title),
                &format!(
                    "{} Claim {} in StatefulSet {} failed error: {}",
                    verb,
                    claim_name,
                    set.name(),
                    error
                ),
            ),
        }
    }
}

fn capitalize(verb: &str) -> String {
    let mut chars = verb.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacheset::controller::identity::new_set_pod;
    use crate::cacheset::k8s::persistentvolumeclaim::PersistentVolumeClaim;
    use crate::cacheset::k8s::pod::ObjectMeta;
    use crate::cacheset::k8s::workerset::{WorkerSetSpec, POD_NAME_LABEL};

    fn fixture() -> (Arc<ClusterState>, Arc<EventRecorder>, PodControl, WorkerSet) {
        let state = Arc::new(ClusterState::new());
        let recorder = Arc::new(EventRecorder::new("test-controller"));
        let control = PodControl::new(state.clone(), recorder.clone());
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("data".to_string());
        let set = WorkerSet::new(
            ObjectMeta::named("cache", "default"),
            WorkerSetSpec {
                replicas: Some(3),
                service_name: "cache-headless".to_string(),
                volume_claim_templates: vec![claim],
                ..Default::default()
            },
        );
        (state, recorder, control, set)
    }

    #[test]
    fn create_provisions_claims_before_the_pod() {
        let (state, recorder, control, set) = fixture();
        let pod = new_set_pod(&set, 0);
        control.create_set_pod(&set, &pod).expect("create");

        assert!(state.get_claim(Some("default"), "data-cache-0").is_ok());
        assert!(state.get_pod(Some("default"), "cache-0").is_ok());

        let reasons: Vec<String> = recorder
            .list_for("default", "cache")
            .into_iter()
            .filter_map(|event| event.reason)
            .collect();
        assert!(reasons.contains(&"SuccessfulCreate".to_string()));
    }

    #[test]
    fn duplicate_create_records_a_warning() {
        let (_, recorder, control, set) = fixture();
        let pod = new_set_pod(&set, 0);
        control.create_set_pod(&set, &pod).expect("create");
        assert!(control.create_set_pod(&set, &pod).is_err());

        let warning = recorder
            .list_for("default", "cache")
            .into_iter()
            .find(|event| event.reason.as_deref() == Some("FailedCreate"));
        assert!(warning.is_some());
    }

    #[tokio::test]
    async fn update_repairs_identity_drift() {
        let (state, recorder, control, set) = fixture();
        let pod = new_set_pod(&set, 1);
        control.create_set_pod(&set, &pod).expect("create");

        let mut drifted = state.get_pod(Some("default"), "cache-1").expect("get");
        drifted.metadata.labels.remove(POD_NAME_LABEL);
        state.update_pod(drifted).expect("inject drift");

        let live = state.get_pod(Some("default"), "cache-1").expect("get");
        control.update_set_pod(&set, &live).await.expect("update");

        let repaired = state.get_pod(Some("default"), "cache-1").expect("get");
        assert!(identity_matches(&set, &repaired));
        let reasons: Vec<String> = recorder
            .list_for("default", "cache")
            .into_iter()
            .filter_map(|event| event.reason)
            .collect();
        assert!(reasons.contains(&"SuccessfulUpdate".to_string()));
    }

    #[tokio::test]
    async fn update_recreates_missing_claims() {
        let (state, _, control, set) = fixture();
        let pod = new_set_pod(&set, 2);
        control.create_set_pod(&set, &pod).expect("create");
        state.delete_claim(Some("default"), "data-cache-2").expect("delete claim");

        let mut live = state.get_pod(Some("default"), "cache-2").expect("get");
        live.spec.volumes.clear();
        let live = state.update_pod(live).expect("inject drift");

        control.update_set_pod(&set, &live).await.expect("update");
        assert!(state.get_claim(Some("default"), "data-cache-2").is_ok());
        let repaired = state.get_pod(Some("default"), "cache-2").expect("get");
        assert!(storage_matches(&set, &repaired));
    }

    #[tokio::test]
    async fn consistent_pod_is_left_alone() {
        let (state, recorder, control, set) = fixture();
        let pod = new_set_pod(&set, 0);
        control.create_set_pod(&set, &pod).expect("create");
        let live = state.get_pod(Some("default"), "cache-0").expect("get");
        let version_before = live.metadata.resource_version.clone();

        control.update_set_pod(&set, &live).await.expect("update");

        let after = state.get_pod(Some("default"), "cache-0").expect("get");
        assert_eq!(after.metadata.resource_version, version_before);
        let update_events = recorder
            .list_for("default", "cache")
            .into_iter()
            .filter(|event| event.reason.as_deref() == Some("SuccessfulUpdate"))
            .count();
        assert_eq!(update_events, 0);
    }

    #[test]
    fn delete_records_an_event() {
        let (state, recorder, control, set) = fixture();
        let pod = new_set_pod(&set, 0);
        control.create_set_pod(&set, &pod).expect("create");

        let live = state.get_pod(Some("default"), "cache-0").expect("get");
        control.delete_set_pod(&set, &live).expect("delete");
        assert!(state.get_pod(Some("default"), "cache-0").is_err());

        let reasons: Vec<String> = recorder
            .list_for("default", "cache")
            .into_iter()
            .filter_map(|event| event.reason)
            .collect();
        assert!(reasons.contains(&"SuccessfulDelete".to_string()));
    }
}
