// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use dashmap::{DashMap, DashSet};

/// Per-timeline record of decrypted Megolm message indices.
///
/// A (sender key, session id, message index) triple may legitimately be
/// decrypted once per timeline; seeing it a second time within the same
/// timeline is a replay. Back-pagination re-exposes old events under a fresh
/// timeline id, which is why the ledger is timeline scoped.
#[derive(Debug, Default)]
pub(crate) struct ReplayLedger {
    timelines: DashMap<String, DashSet<String>>,
}

impl ReplayLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the decryption of a message index within a timeline.
    ///
    /// Returns false if the index was already decrypted in this timeline.
    pub fn record(
        &self,
        timeline_id: &str,
        sender_key: &str,
        session_id: &str,
        message_index: u32,
    ) -> bool {
        let key = format!("{}|{}|{}", sender_key, session_id, message_index);

        self.timelines
            .entry(timeline_id.to_owned())
            .or_insert_with(DashSet::new)
            .insert(key)
    }

    /// Forget everything recorded for the given timeline.
    pub fn reset_timeline(&self, timeline_id: &str) {
        self.timelines.remove(timeline_id);
    }
}

#[cfg(test)]
mod test {
    use super::ReplayLedger;

    #[test]
    fn indices_are_timeline_scoped() {
        let ledger = ReplayLedger::new();

        assert!(ledger.record("tl1", "key", "session", 0));
        assert!(!ledger.record("tl1", "key", "session", 0));

        // The same index under another timeline is pagination, not replay.
        assert!(ledger.record("tl2", "key", "session", 0));

        ledger.reset_timeline("tl1");
        assert!(ledger.record("tl1", "key", "session", 0));
    }
}
