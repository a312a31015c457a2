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

use std::collections::BTreeSet;

/// The ordinal window of a set: the half-open range `[0, end)` minus the
/// retained delete slots. Exactly `replicas` ordinals remain inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrdinalWindow {
    end: u32,
    slots: BTreeSet<u32>,
}

impl OrdinalWindow {
    /// Builds the window for a desired replica count and requested delete
    /// slots. The window starts at `replicas` and grows by one for every slot
    /// that lands inside it, processed in ascending order; slots at or beyond
    /// the current window end cannot shift it and are discarded.
    pub fn compute(replicas: u32, requested_slots: &BTreeSet<u32>) -> Self {
        let mut end = replicas;
        let mut slots = BTreeSet::new();
        for slot in requested_slots {
            if *slot < end {
                end += 1;
                slots.insert(*slot);
            }
        }
        Self { end, slots }
    }

    /// One past the highest ordinal the window may occupy.
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Delete slots that actually punched a hole in the window.
    pub fn slots(&self) -> &BTreeSet<u32> {
        &self.slots
    }

    /// True when the ordinal hosts a desired replica.
    pub fn contains(&self, ordinal: u32) -> bool {
        ordinal < self.end && !self.slots.contains(&ordinal)
    }

    /// The ordinals hosting desired replicas, ascending.
    pub fn ordinals(&self) -> Vec<u32> {
        (0..self.end).filter(|o| self.contains(*o)).collect()
    }
}

/// Splits a unit name of the form `<parent>-<ordinal>` into its parts.
pub fn parse_ordinal(name: &str) -> Option<(&str, u32)> {
    let (parent, suffix) = name.rsplit_once('-')?;
    if parent.is_empty() || suffix.is_empty() {
        return None;
    }
    let ordinal = suffix.parse::<u32>().ok()?;
    Some((parent, ordinal))
}
