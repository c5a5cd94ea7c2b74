// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and response shapes for resource manager commands.

use serde::{Deserialize, Serialize};

use crate::NUM_COS;

/// Resources to attach to a new scheduling domain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSchedDomainArgs {
    pub num_ldb_queues: u32,
    /// Load-balanced ports from any class of service
    pub num_ldb_ports: u32,
    /// Load-balanced ports from each specific class of service
    pub num_cos_ldb_ports: [u32; NUM_COS],
    /// Take `num_cos_ldb_ports[c]` only from class `c`
    pub cos_strict: bool,
    pub num_dir_ports: u32,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub num_ldb_credits: u32,
    pub num_dir_credits: u32,
}

impl CreateSchedDomainArgs {
    pub(crate) fn total_ldb_ports(&self) -> u32 {
        self.num_ldb_ports + self.num_cos_ldb_ports.iter().sum::<u32>()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateLdbQueueArgs {
    /// Sequence numbers per queue for ordered scheduling, or 0 if unordered
    pub num_sequence_numbers: u32,
    pub num_qid_inflights: u32,
    pub num_atomic_inflights: u32,
    pub lock_id_comp_level: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDirQueueArgs {
    /// The already-created port this queue pairs with
    pub port_id: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLdbPortArgs {
    pub cq_depth: u32,
    pub cq_history_list_size: u32,
    pub cos_id: u8,
    pub cos_strict: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDirPortArgs {
    pub cq_depth: u32,
    /// The already-created queue this port pairs with
    pub queue_id: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapQidArgs {
    pub port_id: u32,
    pub qid: u32,
    pub priority: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnmapQidArgs {
    pub port_id: u32,
    pub qid: u32,
}

/// Result of a map or unmap request which was accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum MapOutcome {
    /// The requested mapping now holds
    Complete,
    /// The change is in progress; a maintenance pass will finish it
    Pending,
}

/// Resource totals held by a function or its domains.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NumResources {
    pub num_sched_domains: u32,
    pub num_ldb_queues: u32,
    pub num_ldb_ports: u32,
    pub num_cos_ldb_ports: [u32; NUM_COS],
    pub num_dir_ports: u32,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub max_contiguous_hist_list_entries: u32,
    pub num_ldb_credits: u32,
    pub num_dir_credits: u32,
}
