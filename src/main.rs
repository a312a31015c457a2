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

mod cacheset;

use std::sync::Arc;

use cacheset::config::Config;
use cacheset::controller::runtime::ControllerRuntime;
use cacheset::k8s::event::EventRecorder;
use cacheset::k8s::store::ClusterState;
use cacheset::logger::{log_info, set_log_format, set_min_level, LogFormat, LogLevel};
use cacheset::util::{new_error, with_context};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    set_log_format(LogFormat::from_env_value(&Config::LogFormat.get()));
    set_min_level(LogLevel::from_env_value(&Config::LogLevel.get()));

    let workers = Config::Workers.get_count();
    let queue_capacity = Config::QueueCapacity.get_count();
    log_info(
        "main",
        "starting worker set controller",
        &[
            ("workers", &workers.to_string()),
            ("queueCapacity", &queue_capacity.to_string()),
        ],
    );

    let state = Arc::new(ClusterState::new());
    let recorder = EventRecorder::shared();
    let runtime = ControllerRuntime::new(state, recorder, queue_capacity);
    let mut handles = runtime.spawn_watchers();
    handles.extend(runtime.spawn_executors(workers));

    for handle in handles {
        handle
            .await
            .map_err(|error| with_context(error, "controller task failed"))?;
    }

    // The watchers and executors run for the life of the process; reaching
    // this point means the queue closed underneath them.
    Err(new_error("controller tasks exited unexpectedly"))
}
