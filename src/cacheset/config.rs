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

use std::env;

/// Enum for supported configuration parameters
#[derive(Debug, Clone, Copy)]
pub enum Config {
    LogFormat,
    LogLevel,
    Workers,
    QueueCapacity,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::LogFormat => "CACHESET_LOG_FORMAT",
            Config::LogLevel => "CACHESET_LOG_LEVEL",
            Config::Workers => "CACHESET_WORKERS",
            Config::QueueCapacity => "CACHESET_QUEUE_CAPACITY",
        }
    }

    /// Returns the default value used when the environment variable is unset.
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::LogFormat => "text",
            Config::LogLevel => "info",
            Config::Workers => "2",
            Config::QueueCapacity => "256",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get(&self) -> String {
        env::var(self.env_var()).unwrap_or_else(|_| self.default_value().to_string())
    }

    /// Parses the effective value as a positive integer, falling back to the
    /// default when the variable holds garbage or zero.
    pub fn get_count(&self) -> usize {
        let raw = self.get();
        match raw.trim().parse::<usize>() {
            Ok(value) if value > 0 => value,
            _ => self
                .default_value()
                .parse::<usize>()
                .unwrap_or(1),
        }
    }
}
