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

use super::persistentvolumeclaim::PersistentVolumeClaim;
use super::pod::ObjectMeta;
use super::statefulset::{LabelSelector, PodTemplateSpec, StatefulSetCondition, UpdateStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Label stamped on every managed pod with the pod's own name, so identity
/// drift is observable from the pod alone.
pub const POD_NAME_LABEL: &str = "workerset.cacheset.io/pod-name";
/// Label stamped on pods and revisions with the owning set's name.
pub const SET_NAME_LABEL: &str = "workerset.cacheset.io/set-name";
/// Label recording which controller revision produced a pod.
pub const REVISION_LABEL: &str = "controller-revision-hash";
/// Annotation holding the JSON array of ordinals excluded from the window.
pub const DELETE_SLOTS_ANNOTATION: &str = "workerset.cacheset.io/delete-slots";

/// How the controller sequences pod creation and deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodManagementPolicy {
    #[default]
    OrderedReady,
    Parallel,
}

/// Extended set specification. Wire-identical to the native StatefulSet spec;
/// the extra behaviour lives in accessors, not fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerSetSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub template: PodTemplateSpec,
    #[serde(
        rename = "volumeClaimTemplates",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
    #[serde(rename = "serviceName", default)]
    pub service_name: String,
    #[serde(
        rename = "podManagementPolicy",
        skip_serializing_if = "Option::is_none"
    )]
    pub pod_management_policy: Option<String>,
    #[serde(rename = "updateStrategy", default)]
    pub update_strategy: UpdateStrategy,
    #[serde(
        rename = "revisionHistoryLimit",
        skip_serializing_if = "Option::is_none"
    )]
    pub revision_history_limit: Option<i32>,
}

/// Extended set status counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerSetStatus {
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,
    #[serde(rename = "currentReplicas", default)]
    pub current_replicas: i32,
    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,
    #[serde(rename = "currentRevision", skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    #[serde(rename = "updateRevision", skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,
    #[serde(rename = "collisionCount", skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatefulSetCondition>,
}

/// Worker set: a StatefulSet whose ordinal window may contain delete slots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSet {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: WorkerSetSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkerSetStatus>,
}

impl WorkerSet {
    pub fn new(metadata: ObjectMeta, spec: WorkerSetSpec) -> Self {
        Self {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Desired replica count; an unset field means one replica.
    pub fn replicas(&self) -> u32 {
        self.spec.replicas.unwrap_or(1).max(0) as u32
    }

    /// Effective management policy; unknown strings fall back to OrderedReady
    /// so a bad value never bursts.
    pub fn pod_management_policy(&self) -> PodManagementPolicy {
        match self.spec.pod_management_policy.as_deref() {
            Some("Parallel") => PodManagementPolicy::Parallel,
            _ => PodManagementPolicy::OrderedReady,
        }
    }

    pub fn allows_burst(&self) -> bool {
        self.pod_management_policy() == PodManagementPolicy::Parallel
    }

    /// Ordinals excluded from the window. Malformed annotation data reads as
    /// empty; negative entries are dropped.
    pub fn delete_slots(&self) -> BTreeSet<u32> {
        let raw = match self.metadata.annotations.get(DELETE_SLOTS_ANNOTATION) {
            Some(raw) => raw,
            None => return BTreeSet::new(),
        };
        match serde_json::from_str::<Vec<i64>>(raw) {
            Ok(entries) => entries
                .into_iter()
                .filter(|ordinal| *ordinal >= 0)
                .map(|ordinal| ordinal as u32)
                .collect(),
            Err(_) => BTreeSet::new(),
        }
    }

    /// Rewrites the delete-slot annotation from a slot set.
    pub fn set_delete_slots(&mut self, slots: &BTreeSet<u32>) {
        let encoded =
            serde_json::to_string(&slots.iter().collect::<Vec<_>>()).unwrap_or_else(|_| "[]".into());
        self.metadata
            .annotations
            .insert(DELETE_SLOTS_ANNOTATION.to_string(), encoded);
    }
}
