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
use super::pod::{ObjectMeta, PodSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimal label selector supporting exact-match labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LabelSelector {
    #[serde(
        rename = "matchLabels",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub match_labels: HashMap<String, String>,
}

impl LabelSelector {
    /// True when every selector label is present with the same value.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

/// Template describing the pods managed by a set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

/// Native StatefulSet specification; the persisted wire shape that the worker
/// set type reinterprets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatefulSetSpec {
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

/// Update behaviour shared by the native and extended set shapes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateStrategy {
    #[serde(rename = "type", default)]
    pub strategy_type: UpdateStrategyType,
    #[serde(rename = "rollingUpdate", skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateStrategy>,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            strategy_type: UpdateStrategyType::RollingUpdate,
            rolling_update: None,
        }
    }
}

impl UpdateStrategy {
    pub fn is_on_delete(&self) -> bool {
        matches!(self.strategy_type, UpdateStrategyType::OnDelete)
    }

    pub fn partition(&self) -> u32 {
        self.rolling_update
            .as_ref()
            .and_then(|config| config.partition)
            .map(|partition| partition.max(0) as u32)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum UpdateStrategyType {
    #[default]
    RollingUpdate,
    OnDelete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RollingUpdateStrategy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

/// High-level condition describing set rollout state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatefulSetCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Native StatefulSet status counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatefulSetStatus {
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

/// Native StatefulSet object; what the cluster store persists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatefulSet {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: StatefulSetSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatefulSetStatus>,
}

impl StatefulSet {
    pub fn new(metadata: ObjectMeta, spec: StatefulSetSpec) -> Self {
        Self {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            metadata,
            spec,
            status: None,
        }
    }
}
