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

use super::ordinals::parse_ordinal;
use crate::cacheset::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::cacheset::k8s::pod::{
    ObjectMeta, PersistentVolumeClaimVolumeSource, Pod, VolumeSpec,
};
use crate::cacheset::k8s::workerset::{WorkerSet, POD_NAME_LABEL, REVISION_LABEL, SET_NAME_LABEL};

/// Name of the pod hosting `ordinal` for the set.
pub fn pod_name(set: &WorkerSet, ordinal: u32) -> String {
    format!("{}-{}", set.name(), ordinal)
}

/// Name of the claim instantiated from `template` for `ordinal`.
pub fn claim_name(set: &WorkerSet, template: &PersistentVolumeClaim, ordinal: u32) -> String {
    format!("{}-{}-{}", template.template_name(), set.name(), ordinal)
}

/// The ordinal encoded in the pod's name, when the pod belongs to the set.
pub fn member_ordinal(set: &WorkerSet, pod: &Pod) -> Option<u32> {
    let (parent, ordinal) = parse_ordinal(pod.name())?;
    if parent != set.name() {
        return None;
    }
    Some(ordinal)
}

/// The revision label stamped on the pod, empty when absent.
pub fn pod_revision(pod: &Pod) -> String {
    pod.metadata
        .labels
        .get(REVISION_LABEL)
        .cloned()
        .unwrap_or_default()
}

pub fn set_pod_revision(pod: &mut Pod, revision: &str) {
    pod.metadata
        .labels
        .insert(REVISION_LABEL.to_string(), revision.to_string());
}

/// True when the pod's name, namespace, and pod-name label all agree with the
/// identity its ordinal implies.
pub fn identity_matches(set: &WorkerSet, pod: &Pod) -> bool {
    let ordinal = match member_ordinal(set, pod) {
        Some(ordinal) => ordinal,
        None => return false,
    };
    pod.name() == pod_name(set, ordinal)
        && pod.metadata.namespace == set.metadata.namespace
        && pod.metadata.labels.get(POD_NAME_LABEL).map(String::as_str) == Some(pod.name())
}

/// True when every claim template resolves to a volume mounting the claim
/// belonging to the pod's ordinal.
pub fn storage_matches(set: &WorkerSet, pod: &Pod) -> bool {
    let ordinal = match member_ordinal(set, pod) {
        Some(ordinal) => ordinal,
        None => return false,
    };
    set.spec.volume_claim_templates.iter().all(|template| {
        pod.spec.volumes.iter().any(|volume| {
            volume.name == template.template_name()
                && volume
                    .persistent_volume_claim
                    .as_ref()
                    .map(|source| source.claim_name.as_str())
                    == Some(claim_name(set, template, ordinal).as_str())
        })
    })
}

/// Rewrites the pod's identity fields to what its ordinal implies.
pub fn update_identity(set: &WorkerSet, pod: &mut Pod) {
    if let Some(ordinal) = member_ordinal(set, pod) {
        pod.metadata.name = Some(pod_name(set, ordinal));
    }
    pod.metadata.namespace = set.metadata.namespace.clone();
    let name = pod.name().to_string();
    pod.metadata
        .labels
        .insert(POD_NAME_LABEL.to_string(), name);
    pod.metadata
        .labels
        .insert(SET_NAME_LABEL.to_string(), set.name().to_string());
}

/// Rewrites the pod's claim-backed volumes to reference its ordinal's claims,
/// leaving template-declared volumes of other kinds untouched.
pub fn update_storage(set: &WorkerSet, pod: &mut Pod) {
    let ordinal = match member_ordinal(set, pod) {
        Some(ordinal) => ordinal,
        None => return,
    };
    let template_names: Vec<&str> = set
        .spec
        .volume_claim_templates
        .iter()
        .map(|template| template.template_name())
        .collect();
    let mut volumes: Vec<VolumeSpec> = pod
        .spec
        .volumes
        .iter()
        .filter(|volume| !template_names.contains(&volume.name.as_str()))
        .cloned()
        .collect();
    for template in &set.spec.volume_claim_templates {
        volumes.push(VolumeSpec {
            name: template.template_name().to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name(set, template, ordinal),
                read_only: None,
            }),
            ..Default::default()
        });
    }
    pod.spec.volumes = volumes;
}

/// The claims the pod's ordinal requires, one per claim template.
pub fn claims_for_ordinal(set: &WorkerSet, ordinal: u32) -> Vec<PersistentVolumeClaim> {
    set.spec
        .volume_claim_templates
        .iter()
        .map(|template| {
            let mut claim = template.clone();
            claim.metadata = ObjectMeta {
                name: Some(claim_name(set, template, ordinal)),
                namespace: set.metadata.namespace.clone(),
                labels: set.spec.selector.match_labels.clone(),
                ..Default::default()
            };
            claim
        })
        .collect()
}

/// Instantiates the set's template at an ordinal: identity labels, stable
/// network identity, and claim-backed storage.
pub fn new_set_pod(set: &WorkerSet, ordinal: u32) -> Pod {
    let template = &set.spec.template;
    let name = pod_name(set, ordinal);
    let mut pod = Pod {
        api_version: Some("v1".to_string()),
        kind: Some("Pod".to_string()),
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: set.metadata.namespace.clone(),
            labels: template.metadata.labels.clone(),
            annotations: template.metadata.annotations.clone(),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    };
    pod.spec.hostname = Some(name);
    pod.spec.subdomain = Some(set.spec.service_name.clone());
    update_identity(set, &mut pod);
    update_storage(set, &mut pod);
    pod
}

/// Instantiates the template at an ordinal, choosing the current or update
/// generation of the set by the rolling-update partition: ordinals below the
/// partition stay on the current revision.
pub fn new_versioned_pod(
    current_set: &WorkerSet,
    update_set: &WorkerSet,
    current_revision: &str,
    update_revision: &str,
    ordinal: u32,
) -> Pod {
    let partition = current_set.spec.update_strategy.partition();
    let (source, revision) = if ordinal < partition {
        (current_set, current_revision)
    } else {
        (update_set, update_revision)
    };
    let mut pod = new_set_pod(source, ordinal);
    set_pod_revision(&mut pod, revision);
    pod
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacheset::k8s::statefulset::{
        LabelSelector, RollingUpdateStrategy, UpdateStrategy, UpdateStrategyType,
    };
    use crate::cacheset::k8s::workerset::WorkerSetSpec;

    fn sample_set() -> WorkerSet {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("data".to_string());
        WorkerSet::new(
            ObjectMeta::named("cache", "default"),
            WorkerSetSpec {
                replicas: Some(3),
                service_name: "cache-headless".to_string(),
                volume_claim_templates: vec![claim],
                selector: LabelSelector {
                    match_labels: [("app".to_string(), "cache".to_string())]
                        .into_iter()
                        .collect(),
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn names_compose_from_set_and_ordinal() {
        let set = sample_set();
        assert_eq!(pod_name(&set, 2), "cache-2");
        assert_eq!(
            claim_name(&set, &set.spec.volume_claim_templates[0], 2),
            "data-cache-2"
        );
    }

    #[test]
    fn new_pod_satisfies_both_matchers() {
        let set = sample_set();
        let pod = new_set_pod(&set, 1);
        assert!(identity_matches(&set, &pod));
        assert!(storage_matches(&set, &pod));
        assert_eq!(pod.spec.hostname.as_deref(), Some("cache-1"));
        assert_eq!(pod.spec.subdomain.as_deref(), Some("cache-headless"));
    }

    #[test]
    fn foreign_pod_never_matches_identity() {
        let set = sample_set();
        let mut pod = new_set_pod(&set, 0);
        pod.metadata.name = Some("other-0".to_string());
        assert!(!identity_matches(&set, &pod));
    }

    #[test]
    fn dropped_pod_name_label_fails_identity_and_is_repairable() {
        let set = sample_set();
        let mut pod = new_set_pod(&set, 0);
        pod.metadata.labels.remove(POD_NAME_LABEL);
        assert!(!identity_matches(&set, &pod));
        update_identity(&set, &mut pod);
        assert!(identity_matches(&set, &pod));
    }

    #[test]
    fn storage_mismatch_is_repairable() {
        let set = sample_set();
        let mut pod = new_set_pod(&set, 2);
        pod.spec.volumes.clear();
        assert!(!storage_matches(&set, &pod));
        update_storage(&set, &mut pod);
        assert!(storage_matches(&set, &pod));
        assert_eq!(
            pod.spec.volumes[0]
                .persistent_volume_claim
                .as_ref()
                .map(|s| s.claim_name.as_str()),
            Some("data-cache-2")
        );
    }

    #[test]
    fn claims_carry_selector_labels() {
        let set = sample_set();
        let claims = claims_for_ordinal(&set, 1);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.name.as_deref(), Some("data-cache-1"));
        assert_eq!(
            claims[0].metadata.labels.get("app").map(String::as_str),
            Some("cache")
        );
    }

    #[test]
    fn versioned_pod_respects_partition() {
        let mut current = sample_set();
        current.spec.update_strategy = UpdateStrategy {
            strategy_type: UpdateStrategyType::RollingUpdate,
            rolling_update: Some(RollingUpdateStrategy { partition: Some(2) }),
        };
        let update = current.clone();

        let below = new_versioned_pod(&current, &update, "rev-current", "rev-update", 1);
        assert_eq!(pod_revision(&below), "rev-current");

        let at = new_versioned_pod(&current, &update, "rev-current", "rev-update", 2);
        assert_eq!(pod_revision(&at), "rev-update");
    }
}
