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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;

use super::persistentvolumeclaim::PersistentVolumeClaim;
use super::pod::{ObjectMeta, Pod, PodPhase, PodStatus};
use super::revision::ControllerRevision;
use super::statefulset::{LabelSelector, StatefulSet};

const WATCH_BUFFER_SIZE: usize = 128;

/// Returns the effective namespace, defaulting when unset or blank.
pub fn normalize_namespace(namespace: Option<&str>) -> String {
    match namespace {
        Some(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => "default".to_string(),
    }
}

/// API-level failure taxonomy surfaced by the store.
#[derive(Debug)]
pub enum ApiError {
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    Invalid(String),
    Serialization(serde_json::Error),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::NotFound {
                kind,
                namespace,
                name,
            } => write!(f, "{} {}/{} not found", kind, namespace, name),
            ApiError::AlreadyExists {
                kind,
                namespace,
                name,
            } => write!(f, "{} {}/{} already exists", kind, namespace, name),
            ApiError::Conflict {
                kind,
                namespace,
                name,
            } => write!(
                f,
                "{} {}/{} was modified concurrently, re-read before retrying",
                kind, namespace, name
            ),
            ApiError::Invalid(message) => write!(f, "invalid request: {}", message),
            ApiError::Serialization(error) => write!(f, "serialization failed: {}", error),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Serialization(error) => Some(error),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        ApiError::Serialization(error)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// One change notification on a watched collection.
#[derive(Clone, Debug, Serialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: T,
}

trait Stored: Clone {
    const KIND: &'static str;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

impl Stored for StatefulSet {
    const KIND: &'static str = "StatefulSet";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for Pod {
    const KIND: &'static str = "Pod";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for PersistentVolumeClaim {
    const KIND: &'static str = "PersistentVolumeClaim";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for ControllerRevision {
    const KIND: &'static str = "ControllerRevision";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

struct ObjectMap<T: Stored> {
    objects: RwLock<HashMap<(String, String), T>>,
    watchers: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Stored> ObjectMap<T> {
    fn new() -> Self {
        let (watchers, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            objects: RwLock::new(HashMap::new()),
            watchers,
        }
    }

    fn key_for(object: &T) -> ApiResult<(String, String)> {
        let name = object
            .meta()
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ApiError::Invalid(format!("{} is missing metadata.name", T::KIND))
            })?;
        Ok((normalize_namespace(object.meta().namespace.as_deref()), name))
    }

    fn notify(&self, event_type: WatchEventType, object: T) {
        let _ = self.watchers.send(WatchEvent { event_type, object });
    }

    fn create(&self, mut object: T, resource_version: String) -> ApiResult<T> {
        let key = Self::key_for(&object)?;
        let mut objects = self.write_guard();
        if objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists {
                kind: T::KIND,
                namespace: key.0,
                name: key.1,
            });
        }
        object.meta_mut().namespace = Some(key.0.clone());
        object.meta_mut().resource_version = Some(resource_version);
        objects.insert(key, object.clone());
        drop(objects);
        self.notify(WatchEventType::Added, object.clone());
        Ok(object)
    }

    fn get(&self, namespace: Option<&str>, name: &str) -> ApiResult<T> {
        let key = (normalize_namespace(namespace), name.to_string());
        self.read_guard().get(&key).cloned().ok_or(ApiError::NotFound {
            kind: T::KIND,
            namespace: key.0,
            name: key.1,
        })
    }

    fn list(&self, namespace: Option<&str>) -> Vec<T> {
        let namespace = normalize_namespace(namespace);
        let mut items: Vec<T> = self
            .read_guard()
            .iter()
            .filter(|((ns, _), _)| *ns == namespace)
            .map(|(_, object)| object.clone())
            .collect();
        items.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        items
    }

    /// Replaces the stored object after an optimistic-concurrency check. The
    /// `merge` closure receives (live, incoming) and returns the object to
    /// persist, letting callers keep subresources out of the write.
    fn replace(
        &self,
        incoming: T,
        resource_version: String,
        merge: impl FnOnce(&T, T) -> T,
    ) -> ApiResult<T> {
        let key = Self::key_for(&incoming)?;
        let mut objects = self.write_guard();
        let live = objects.get(&key).ok_or_else(|| ApiError::NotFound {
            kind: T::KIND,
            namespace: key.0.clone(),
            name: key.1.clone(),
        })?;
        let incoming_version = incoming.meta().resource_version.clone().ok_or_else(|| {
            ApiError::Invalid(format!(
                "{} update is missing metadata.resourceVersion",
                T::KIND
            ))
        })?;
        if live.meta().resource_version.as_deref() != Some(incoming_version.as_str()) {
            return Err(ApiError::Conflict {
                kind: T::KIND,
                namespace: key.0,
                name: key.1,
            });
        }
        let mut merged = merge(live, incoming);
        merged.meta_mut().namespace = Some(key.0.clone());
        merged.meta_mut().resource_version = Some(resource_version);
        objects.insert(key, merged.clone());
        drop(objects);
        self.notify(WatchEventType::Modified, merged.clone());
        Ok(merged)
    }

    fn remove(&self, namespace: Option<&str>, name: &str) -> ApiResult<T> {
        let key = (normalize_namespace(namespace), name.to_string());
        let removed = self.write_guard().remove(&key);
        match removed {
            Some(object) => {
                self.notify(WatchEventType::Deleted, object.clone());
                Ok(object)
            }
            None => Err(ApiError::NotFound {
                kind: T::KIND,
                namespace: key.0,
                name: key.1,
            }),
        }
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.watchers.subscribe()
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, HashMap<(String, String), T>> {
        match self.objects.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<(String, String), T>> {
        match self.objects.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// In-process cluster state: the typed collections the controller works
/// against, with monotonically increasing resource versions and per-collection
/// watch streams.
pub struct ClusterState {
    statefulsets: ObjectMap<StatefulSet>,
    pods: ObjectMap<Pod>,
    claims: ObjectMap<PersistentVolumeClaim>,
    revisions: ObjectMap<ControllerRevision>,
    version_counter: AtomicU64,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            statefulsets: ObjectMap::new(),
            pods: ObjectMap::new(),
            claims: ObjectMap::new(),
            revisions: ObjectMap::new(),
            version_counter: AtomicU64::new(1),
        }
    }

    fn next_resource_version(&self) -> String {
        self.version_counter.fetch_add(1, Ordering::SeqCst).to_string()
    }

    // StatefulSets. Updates split spec and status writes the way the real
    // subresources do: update replaces spec and metadata, update_status only
    // replaces status. Spec changes advance the generation counter.

    pub fn create_statefulset(&self, mut set: StatefulSet) -> ApiResult<StatefulSet> {
        set.metadata.generation = Some(1);
        set.status = None;
        self.statefulsets.create(set, self.next_resource_version())
    }

    pub fn get_statefulset(&self, namespace: Option<&str>, name: &str) -> ApiResult<StatefulSet> {
        self.statefulsets.get(namespace, name)
    }

    pub fn list_statefulsets(&self, namespace: Option<&str>) -> Vec<StatefulSet> {
        self.statefulsets.list(namespace)
    }

    pub fn update_statefulset(&self, set: StatefulSet) -> ApiResult<StatefulSet> {
        self.statefulsets
            .replace(set, self.next_resource_version(), |live, mut incoming| {
                if incoming.spec != live.spec {
                    incoming.metadata.generation =
                        Some(live.metadata.generation.unwrap_or(1) + 1);
                } else {
                    incoming.metadata.generation = live.metadata.generation;
                }
                incoming.status = live.status.clone();
                incoming
            })
    }

    pub fn update_statefulset_status(&self, set: StatefulSet) -> ApiResult<StatefulSet> {
        self.statefulsets
            .replace(set, self.next_resource_version(), |live, incoming| {
                let mut merged = live.clone();
                merged.status = incoming.status;
                merged
            })
    }

    pub fn delete_statefulset(&self, namespace: Option<&str>, name: &str) -> ApiResult<StatefulSet> {
        self.statefulsets.remove(namespace, name)
    }

    pub fn watch_statefulsets(&self) -> broadcast::Receiver<WatchEvent<StatefulSet>> {
        self.statefulsets.watch()
    }

    // Pods.

    /// Admission stamps the initial phase; an accepted pod always reports one.
    pub fn create_pod(&self, mut pod: Pod) -> ApiResult<Pod> {
        if pod.status.is_none() {
            pod.status = Some(PodStatus {
                phase: PodPhase::Pending,
                conditions: Vec::new(),
            });
        }
        self.pods.create(pod, self.next_resource_version())
    }

    pub fn get_pod(&self, namespace: Option<&str>, name: &str) -> ApiResult<Pod> {
        self.pods.get(namespace, name)
    }

    /// Pods in the namespace whose labels satisfy the selector, name order.
    pub fn list_pods(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<Pod> {
        self.pods
            .list(namespace)
            .into_iter()
            .filter(|pod| selector.matches(&pod.metadata.labels))
            .collect()
    }

    pub fn update_pod(&self, pod: Pod) -> ApiResult<Pod> {
        self.pods
            .replace(pod, self.next_resource_version(), |_, incoming| incoming)
    }

    pub fn delete_pod(&self, namespace: Option<&str>, name: &str) -> ApiResult<Pod> {
        self.pods.remove(namespace, name)
    }

    pub fn watch_pods(&self) -> broadcast::Receiver<WatchEvent<Pod>> {
        self.pods.watch()
    }

    // PersistentVolumeClaims.

    pub fn create_claim(&self, claim: PersistentVolumeClaim) -> ApiResult<PersistentVolumeClaim> {
        self.claims.create(claim, self.next_resource_version())
    }

    pub fn get_claim(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> ApiResult<PersistentVolumeClaim> {
        self.claims.get(namespace, name)
    }

    pub fn delete_claim(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> ApiResult<PersistentVolumeClaim> {
        self.claims.remove(namespace, name)
    }

    // ControllerRevisions.

    pub fn create_revision(&self, revision: ControllerRevision) -> ApiResult<ControllerRevision> {
        self.revisions.create(revision, self.next_resource_version())
    }

    pub fn get_revision(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> ApiResult<ControllerRevision> {
        self.revisions.get(namespace, name)
    }

    /// Revisions in the namespace carrying every label in `selector`.
    pub fn list_revisions(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Vec<ControllerRevision> {
        self.revisions
            .list(namespace)
            .into_iter()
            .filter(|revision| selector.matches(&revision.metadata.labels))
            .collect()
    }

    pub fn update_revision(&self, revision: ControllerRevision) -> ApiResult<ControllerRevision> {
        self.revisions
            .replace(revision, self.next_resource_version(), |_, incoming| incoming)
    }

    pub fn delete_revision(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> ApiResult<ControllerRevision> {
        self.revisions.remove(namespace, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacheset::k8s::statefulset::StatefulSetSpec;

    fn sample_set(name: &str) -> StatefulSet {
        StatefulSet::new(ObjectMeta::named(name, "default"), StatefulSetSpec::default())
    }

    #[test]
    fn namespace_defaults_when_unset() {
        assert_eq!(normalize_namespace(None), "default");
        assert_eq!(normalize_namespace(Some("  ")), "default");
        assert_eq!(normalize_namespace(Some("cache-system")), "cache-system");
    }

    #[test]
    fn create_then_get_round_trips() {
        let state = ClusterState::new();
        let created = state.create_statefulset(sample_set("cache")).expect("create");
        assert!(created.metadata.resource_version.is_some());
        assert_eq!(created.metadata.generation, Some(1));

        let fetched = state.get_statefulset(Some("default"), "cache").expect("get");
        assert_eq!(fetched, created);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let state = ClusterState::new();
        state.create_statefulset(sample_set("cache")).expect("create");
        let error = state.create_statefulset(sample_set("cache")).unwrap_err();
        assert!(error.is_already_exists());
    }

    #[test]
    fn stale_update_conflicts() {
        let state = ClusterState::new();
        let created = state.create_statefulset(sample_set("cache")).expect("create");

        let mut first = created.clone();
        first.spec.replicas = Some(3);
        state.update_statefulset(first).expect("first update");

        let mut stale = created;
        stale.spec.replicas = Some(5);
        let error = state.update_statefulset(stale).unwrap_err();
        assert!(error.is_conflict());
    }

    #[test]
    fn spec_update_advances_generation_and_keeps_status() {
        let state = ClusterState::new();
        let created = state.create_statefulset(sample_set("cache")).expect("create");

        let mut with_status = created.clone();
        with_status.status = Some(Default::default());
        let stored = state
            .update_statefulset_status(with_status)
            .expect("status update");
        assert!(stored.status.is_some());
        assert_eq!(stored.metadata.generation, Some(1));

        let mut updated = stored.clone();
        updated.spec.replicas = Some(4);
        let updated = state.update_statefulset(updated).expect("spec update");
        assert_eq!(updated.metadata.generation, Some(2));
        assert!(updated.status.is_some(), "spec update must not clear status");
    }

    #[test]
    fn update_on_missing_object_is_not_found() {
        let state = ClusterState::new();
        let mut set = sample_set("ghost");
        set.metadata.resource_version = Some("1".to_string());
        assert!(state.update_statefulset(set).unwrap_err().is_not_found());
    }

    #[test]
    fn created_pods_start_in_the_pending_phase() {
        let state = ClusterState::new();
        let pod = Pod {
            metadata: ObjectMeta::named("cache-0", "default"),
            ..Default::default()
        };
        let created = state.create_pod(pod).expect("create");
        assert!(created.is_created());
        let status = created.status.expect("status");
        assert_eq!(status.phase, PodPhase::Pending);
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn pod_listing_honors_selector() {
        let state = ClusterState::new();
        let mut matching = Pod {
            metadata: ObjectMeta::named("cache-0", "default"),
            ..Default::default()
        };
        matching
            .metadata
            .labels
            .insert("app".to_string(), "cache".to_string());
        let other = Pod {
            metadata: ObjectMeta::named("other-0", "default"),
            ..Default::default()
        };
        state.create_pod(matching).expect("create matching");
        state.create_pod(other).expect("create other");

        let selector = LabelSelector {
            match_labels: [("app".to_string(), "cache".to_string())].into_iter().collect(),
        };
        let pods = state.list_pods(Some("default"), &selector);
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].name(), "cache-0");
    }

    #[tokio::test]
    async fn watch_sees_lifecycle_in_order() {
        let state = ClusterState::new();
        let mut watch = state.watch_statefulsets();

        let created = state.create_statefulset(sample_set("cache")).expect("create");
        let mut updated = created.clone();
        updated.spec.replicas = Some(2);
        state.update_statefulset(updated).expect("update");
        state.delete_statefulset(Some("default"), "cache").expect("delete");

        let added = watch.recv().await.expect("added");
        assert_eq!(added.event_type, WatchEventType::Added);
        let modified = watch.recv().await.expect("modified");
        assert_eq!(modified.event_type, WatchEventType::Modified);
        let deleted = watch.recv().await.expect("deleted");
        assert_eq!(deleted.event_type, WatchEventType::Deleted);
    }
}
