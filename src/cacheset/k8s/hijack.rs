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

//! Adapter between the native StatefulSet objects the store persists and the
//! extended worker set type the controller reasons about. Conversion is a full
//! serialize/deserialize round trip in both directions, never a field-by-field
//! copy, so the two shapes can only drift apart loudly.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::statefulset::StatefulSet;
use super::store::{ApiResult, ClusterState, WatchEvent};
use super::workerset::WorkerSet;
use crate::cacheset::logger::log_warn;

const COMPONENT: &str = "workerset.adapter";

/// Converts a native set into the extended shape.
pub fn from_native(set: &StatefulSet) -> ApiResult<WorkerSet> {
    let value = serde_json::to_value(set)?;
    Ok(serde_json::from_value(value)?)
}

/// Converts an extended set back into the native shape.
pub fn to_native(set: &WorkerSet) -> ApiResult<StatefulSet> {
    let value = serde_json::to_value(set)?;
    Ok(serde_json::from_value(value)?)
}

/// Worker-set facade over the native store.
#[derive(Clone)]
pub struct WorkerSetClient {
    state: Arc<ClusterState>,
}

impl WorkerSetClient {
    pub fn new(state: Arc<ClusterState>) -> Self {
        Self { state }
    }

    pub fn create(&self, set: &WorkerSet) -> ApiResult<WorkerSet> {
        let created = self.state.create_statefulset(to_native(set)?)?;
        from_native(&created)
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> ApiResult<WorkerSet> {
        from_native(&self.state.get_statefulset(namespace, name)?)
    }

    pub fn list(&self, namespace: Option<&str>) -> ApiResult<Vec<WorkerSet>> {
        self.state
            .list_statefulsets(namespace)
            .iter()
            .map(from_native)
            .collect()
    }

    pub fn update(&self, set: &WorkerSet) -> ApiResult<WorkerSet> {
        let updated = self.state.update_statefulset(to_native(set)?)?;
        from_native(&updated)
    }

    pub fn update_status(&self, set: &WorkerSet) -> ApiResult<WorkerSet> {
        let updated = self.state.update_statefulset_status(to_native(set)?)?;
        from_native(&updated)
    }

    pub fn delete(&self, namespace: Option<&str>, name: &str) -> ApiResult<WorkerSet> {
        from_native(&self.state.delete_statefulset(namespace, name)?)
    }

    pub fn watch(&self) -> WorkerSetWatch {
        WorkerSetWatch {
            inner: self.state.watch_statefulsets(),
        }
    }
}

/// Watch stream yielding extended sets, translated event by event so type and
/// order survive the adaptation.
pub struct WorkerSetWatch {
    inner: broadcast::Receiver<WatchEvent<StatefulSet>>,
}

impl WorkerSetWatch {
    /// Next translated event; None once the store side closes.
    pub async fn recv(&mut self) -> Option<WatchEvent<WorkerSet>> {
        loop {
            match self.inner.recv().await {
                Ok(event) => match from_native(&event.object) {
                    Ok(object) => {
                        return Some(WatchEvent {
                            event_type: event.event_type,
                            object,
                        })
                    }
                    Err(error) => {
                        log_warn(
                            COMPONENT,
                            "dropping untranslatable watch event",
                            &[("error", &error.to_string())],
                        );
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log_warn(
                        COMPONENT,
                        "watch lagged, events skipped",
                        &[("skipped", &skipped.to_string())],
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacheset::k8s::persistentvolumeclaim::PersistentVolumeClaim;
    use crate::cacheset::k8s::pod::ObjectMeta;
    use crate::cacheset::k8s::statefulset::{
        RollingUpdateStrategy, StatefulSetSpec, UpdateStrategy, UpdateStrategyType,
    };
    use crate::cacheset::k8s::store::WatchEventType;
    use crate::cacheset::k8s::workerset::{WorkerSetSpec, DELETE_SLOTS_ANNOTATION};

    fn full_native_set() -> StatefulSet {
        let mut metadata = ObjectMeta::named("cache", "default");
        metadata
            .annotations
            .insert(DELETE_SLOTS_ANNOTATION.to_string(), "[1,3]".to_string());
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("data".to_string());
        StatefulSet::new(
            metadata,
            StatefulSetSpec {
                replicas: Some(4),
                service_name: "cache-headless".to_string(),
                pod_management_policy: Some("Parallel".to_string()),
                revision_history_limit: Some(7),
                volume_claim_templates: vec![claim],
                update_strategy: UpdateStrategy {
                    strategy_type: UpdateStrategyType::RollingUpdate,
                    rolling_update: Some(RollingUpdateStrategy { partition: Some(2) }),
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn round_trip_is_lossless() {
        let native = full_native_set();
        let extended = from_native(&native).expect("to extended");
        assert_eq!(extended.replicas(), 4);
        assert!(extended.allows_burst());
        assert_eq!(
            extended.delete_slots().into_iter().collect::<Vec<_>>(),
            vec![1, 3]
        );

        let back = to_native(&extended).expect("to native");
        assert_eq!(back, native);
    }

    #[test]
    fn client_surfaces_extended_sets() {
        let state = Arc::new(ClusterState::new());
        let client = WorkerSetClient::new(state);
        let created = client
            .create(&WorkerSet::new(
                ObjectMeta::named("cache", "default"),
                WorkerSetSpec {
                    replicas: Some(2),
                    ..Default::default()
                },
            ))
            .expect("create");
        assert!(created.metadata.resource_version.is_some());

        let fetched = client.get(Some("default"), "cache").expect("get");
        assert_eq!(fetched.replicas(), 2);

        let listed = client.list(Some("default")).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "cache");
    }

    #[tokio::test]
    async fn watch_translation_preserves_type_and_order() {
        let state = Arc::new(ClusterState::new());
        let client = WorkerSetClient::new(state.clone());
        let mut watch = client.watch();

        let created = state
            .create_statefulset(full_native_set())
            .expect("create");
        let mut updated = created.clone();
        updated.spec.replicas = Some(5);
        state.update_statefulset(updated).expect("update");
        state
            .delete_statefulset(Some("default"), "cache")
            .expect("delete");

        let added = watch.recv().await.expect("added");
        assert_eq!(added.event_type, WatchEventType::Added);
        assert_eq!(added.object.name(), "cache");
        let modified = watch.recv().await.expect("modified");
        assert_eq!(modified.event_type, WatchEventType::Modified);
        assert_eq!(modified.object.replicas(), 5);
        let deleted = watch.recv().await.expect("deleted");
        assert_eq!(deleted.event_type, WatchEventType::Deleted);
    }
}
