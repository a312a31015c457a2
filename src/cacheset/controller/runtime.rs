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

//! Controller runtime: a bounded work queue of set keys, executor tasks that
//! drain it through the reconciler, and watch tasks that translate object
//! churn back into queued keys.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::workerset::WorkerSetController;
use crate::cacheset::k8s::event::EventRecorder;
use crate::cacheset::k8s::hijack::WorkerSetClient;
use crate::cacheset::k8s::store::{normalize_namespace, ClusterState};
use crate::cacheset::k8s::workerset::SET_NAME_LABEL;
use crate::cacheset::logger::{log_debug, log_error, log_info};

const COMPONENT: &str = "workerset.runtime";

/// Key of a set awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl SetKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for SetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StatefulSet/{}/{}",
            normalize_namespace(self.namespace.as_deref()),
            self.name
        )
    }
}

/// Multi-consumer fifo backed by a bounded channel.
#[derive(Clone)]
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

struct WorkQueueInner<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
}

impl<T> WorkQueue<T>
where
    T: Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(WorkQueueInner {
                sender,
                receiver: Mutex::new(receiver),
            }),
        }
    }

    pub async fn enqueue(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.inner.sender.send(item).await
    }

    pub async fn next(&self) -> Option<T> {
        let mut guard = self.inner.receiver.lock().await;
        guard.recv().await
    }
}

/// Owns the queue, the reconciler, and the tasks that feed and drain it.
pub struct ControllerRuntime {
    state: Arc<ClusterState>,
    controller: WorkerSetController,
    work_queue: WorkQueue<SetKey>,
}

impl ControllerRuntime {
    pub fn new(
        state: Arc<ClusterState>,
        recorder: Arc<EventRecorder>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller: WorkerSetController::new(state.clone(), recorder),
            work_queue: WorkQueue::new(queue_capacity),
            state,
        })
    }

    pub fn work_queue(&self) -> WorkQueue<SetKey> {
        self.work_queue.clone()
    }

    /// Spawns `count` executor tasks draining the queue through the
    /// reconciler. A conflicting pass is queued again; a pass that lost its
    /// object waits for the next watch event; other errors are logged and
    /// dropped.
    pub fn spawn_executors(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|index| {
                let runtime = self.clone();
                tokio::spawn(async move {
                    log_debug(
                        COMPONENT,
                        "executor started",
                        &[("worker", &index.to_string())],
                    );
                    while let Some(key) = runtime.work_queue.next().await {
                        let result = runtime
                            .controller
                            .reconcile(key.namespace.as_deref(), &key.name)
                            .await;
                        match result {
                            Ok(()) => {}
                            Err(error) if error.is_conflict() => {
                                log_debug(
                                    COMPONENT,
                                    "requeueing after write conflict",
                                    &[("target", &key.to_string())],
                                );
                                let _ = runtime.work_queue.enqueue(key).await;
                            }
                            Err(error) if error.is_not_found() => {
                                log_debug(
                                    COMPONENT,
                                    "target vanished mid-pass",
                                    &[("target", &key.to_string())],
                                );
                            }
                            Err(error) => {
                                log_error(
                                    COMPONENT,
                                    "reconcile failed",
                                    &[
                                        ("target", &key.to_string()),
                                        ("error", &error.to_string()),
                                    ],
                                );
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Spawns the watch tasks: set churn enqueues the set itself, pod churn
    /// enqueues the owning set read off the pod's set-name label.
    pub fn spawn_watchers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let runtime = self.clone();
        handles.push(tokio::spawn(async move {
            let client = WorkerSetClient::new(runtime.state.clone());
            let mut watch = client.watch();
            log_info(COMPONENT, "watching sets", &[]);
            while let Some(event) = watch.recv().await {
                let key = SetKey::new(
                    event.object.metadata.namespace.as_deref(),
                    event.object.name(),
                );
                if runtime.work_queue.enqueue(key).await.is_err() {
                    return;
                }
            }
        }));

        let runtime = self.clone();
        handles.push(tokio::spawn(async move {
            let mut watch = runtime.state.watch_pods();
            log_info(COMPONENT, "watching pods", &[]);
            loop {
                match watch.recv().await {
                    Ok(event) => {
                        let owner = match event.object.metadata.labels.get(SET_NAME_LABEL) {
                            Some(owner) => owner.clone(),
                            None => continue,
                        };
                        let key =
                            SetKey::new(event.object.metadata.namespace.as_deref(), &owner);
                        if runtime.work_queue.enqueue(key).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        log_debug(
                            COMPONENT,
                            "pod watch lagged",
                            &[("skipped", &skipped.to_string())],
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacheset::k8s::pod::{ContainerSpec, ObjectMeta};
    use crate::cacheset::k8s::statefulset::LabelSelector;
    use crate::cacheset::k8s::workerset::{WorkerSet, WorkerSetSpec};
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn work_queue_orders_items() {
        let queue: WorkQueue<u32> = WorkQueue::new(4);
        queue.enqueue(1).await.expect("enqueue 1");
        queue.enqueue(2).await.expect("enqueue 2");
        queue.enqueue(3).await.expect("enqueue 3");

        assert_eq!(queue.next().await, Some(1));
        assert_eq!(queue.next().await, Some(2));
        assert_eq!(queue.next().await, Some(3));
    }

    #[test]
    fn set_keys_render_with_namespace_defaulting() {
        assert_eq!(
            SetKey::new(None, "cache").to_string(),
            "StatefulSet/default/cache"
        );
        assert_eq!(
            SetKey::new(Some("prod"), "cache").to_string(),
            "StatefulSet/prod/cache"
        );
    }

    fn burst_set(name: &str, replicas: i32) -> WorkerSet {
        let labels: std::collections::HashMap<String, String> =
            [("app".to_string(), name.to_string())].into_iter().collect();
        let mut set = WorkerSet::new(
            ObjectMeta::named(name, "default"),
            WorkerSetSpec {
                replicas: Some(replicas),
                service_name: format!("{name}-headless"),
                pod_management_policy: Some("Parallel".to_string()),
                selector: LabelSelector {
                    match_labels: labels.clone(),
                },
                ..Default::default()
            },
        );
        set.spec.template.metadata.labels = labels;
        set.spec.template.spec.containers = vec![ContainerSpec {
            name: "worker".to_string(),
            image: Some("cache:v1".to_string()),
            ..Default::default()
        }];
        set
    }

    async fn await_pod_count(
        state: &ClusterState,
        set: &WorkerSet,
        expected: usize,
    ) -> Vec<String> {
        timeout(Duration::from_secs(5), async {
            loop {
                let pods = state.list_pods(Some("default"), &set.spec.selector);
                if pods.len() == expected {
                    return pods.into_iter().map(|p| p.name().to_string()).collect();
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pods did not converge in time")
    }

    #[tokio::test]
    async fn executors_drain_queued_sets() {
        let state = Arc::new(ClusterState::new());
        let recorder = Arc::new(EventRecorder::new("test-controller"));
        let runtime = ControllerRuntime::new(state.clone(), recorder, 16);
        let _workers = runtime.spawn_executors(2);

        let set = burst_set("cache", 3);
        WorkerSetClient::new(state.clone())
            .create(&set)
            .expect("create set");
        runtime
            .work_queue()
            .enqueue(SetKey::new(Some("default"), "cache"))
            .await
            .expect("enqueue");

        let names = await_pod_count(&state, &set, 3).await;
        assert_eq!(names, vec!["cache-0", "cache-1", "cache-2"]);
    }

    #[tokio::test]
    async fn watchers_enqueue_set_churn() {
        let state = Arc::new(ClusterState::new());
        let recorder = Arc::new(EventRecorder::new("test-controller"));
        let runtime = ControllerRuntime::new(state.clone(), recorder, 16);
        let _watchers = runtime.spawn_watchers();
        // Give the watch tasks a beat to subscribe before producing churn.
        sleep(Duration::from_millis(20)).await;
        let _workers = runtime.spawn_executors(1);

        let set = burst_set("cache", 2);
        WorkerSetClient::new(state.clone())
            .create(&set)
            .expect("create set");

        let names = await_pod_count(&state, &set, 2).await;
        assert_eq!(names, vec!["cache-0", "cache-1"]);
    }
}
