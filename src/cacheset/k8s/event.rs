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

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::pod::ObjectMeta;

const DEFAULT_EVENT_RETENTION: usize = 1024;
const WATCH_BUFFER_SIZE: usize = 64;

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectReference {
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectReference {
    pub fn to_object(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            api_version: Some("apps/v1".to_string()),
            kind: Some(kind.to_string()),
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EventSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Minimal representation of Kubernetes core/v1 Event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(rename = "firstTimestamp", skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<String>,
    #[serde(rename = "lastTimestamp", skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
}

/// Records controller events into a bounded in-memory ring and fans them out
/// to live watchers.
pub struct EventRecorder {
    component: String,
    store: Mutex<VecDeque<Event>>,
    watchers: broadcast::Sender<Event>,
}

impl EventRecorder {
    pub fn new(component: &str) -> Self {
        let (watchers, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            component: component.to_string(),
            store: Mutex::new(VecDeque::with_capacity(DEFAULT_EVENT_RETENTION)),
            watchers,
        }
    }

    pub fn shared() -> Arc<Self> {
        static INSTANCE: OnceLock<Arc<EventRecorder>> = OnceLock::new();
        INSTANCE
            .get_or_init(|| Arc::new(Self::new("workerset-controller")))
            .clone()
    }

    /// Records an event against the referenced object.
    pub fn record(
        &self,
        subject: ObjectReference,
        event_type: &str,
        reason: &str,
        message: &str,
    ) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let event = Event {
            api_version: "v1".to_string(),
            kind: "Event".to_string(),
            metadata: ObjectMeta {
                namespace: subject.namespace.clone(),
                name: subject
                    .name
                    .as_ref()
                    .map(|name| format!("{}.{}", name, timestamp)),
                ..Default::default()
            },
            involved_object: subject,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            event_type: Some(event_type.to_string()),
            first_timestamp: Some(timestamp.clone()),
            last_timestamp: Some(timestamp),
            count: Some(1),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
        };

        {
            let mut store = match self.store.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if store.len() == DEFAULT_EVENT_RETENTION {
                store.pop_front();
            }
            store.push_back(event.clone());
        }

        let _ = self.watchers.send(event);
    }

    /// Returns recorded events involving the named object, oldest first.
    pub fn list_for(&self, namespace: &str, name: &str) -> Vec<Event> {
        let store = match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        store
            .iter()
            .filter(|event| {
                event.involved_object.namespace.as_deref() == Some(namespace)
                    && event.involved_object.name.as_deref() == Some(name)
            })
            .cloned()
            .collect()
    }

    pub fn watch(&self) -> broadcast::Receiver<Event> {
        self.watchers.subscribe()
    }
}
