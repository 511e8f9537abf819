/*
 * Copyright 2020-2021 Replicate, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An experiment older than this without a heartbeat is considered
/// stopped.
pub const HEARTBEAT_AGE_THRESHOLD_SECONDS: i64 = 60;

/// A liveness timestamp written periodically by a running experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub experiment_id: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(experiment_id: &str) -> Self {
        Heartbeat {
            experiment_id: experiment_id.to_string(),
            last_heartbeat: Utc::now(),
        }
    }

    /// The repository path of the heartbeat for `experiment_id`.
    pub fn storage_path(experiment_id: &str) -> String {
        format!("metadata/heartbeats/{}.json", experiment_id)
    }

    /// Whether this heartbeat is recent enough, as of `now`, for its
    /// experiment to count as running.
    pub fn is_alive(&self, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat < Duration::seconds(HEARTBEAT_AGE_THRESHOLD_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heartbeats_are_alive() {
        let heartbeat = Heartbeat::new("abc");
        assert!(heartbeat.is_alive(Utc::now()));
    }

    #[test]
    fn stale_heartbeats_are_dead() {
        let mut heartbeat = Heartbeat::new("abc");
        heartbeat.last_heartbeat = Utc::now() - Duration::seconds(61);
        assert!(!heartbeat.is_alive(Utc::now()));

        heartbeat.last_heartbeat = Utc::now() - Duration::seconds(30);
        assert!(heartbeat.is_alive(Utc::now()));
    }
}
