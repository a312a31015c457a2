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

use super::pod::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable snapshot of a set's pod template, numbered within its owner's
/// history. `data` holds the serialized patch that reproduces the template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerRevision {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    pub revision: i64,
}

impl ControllerRevision {
    pub fn new(metadata: ObjectMeta, data: Value, revision: i64) -> Self {
        Self {
            api_version: "apps/v1".to_string(),
            kind: "ControllerRevision".to_string(),
            metadata,
            data,
            revision,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}
