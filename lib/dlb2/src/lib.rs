// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resource management for the DLB 2.0 dynamic load balancer.
//!
//! The device exposes a fixed set of hardware objects (scheduling domains,
//! load-balanced queues and ports, directed port/queue pairs, credit pools,
//! history-list entries and sequence-number groups).  [Dlb2] partitions those
//! objects between the physical function and its virtual functions, builds
//! scheduling domains out of them, and drives the queue-to-port mapping state
//! machine used to rebind queues while traffic is flowing.
//!
//! Register programming, producer-port writes, VF mailboxes and deferred work
//! are all supplied by the embedding system through the traits in [hw],
//! [mbox] and [Worker].

#![allow(clippy::too_many_arguments)]

pub mod bitmap;
pub mod hw;
pub mod id;
pub mod mbox;
pub mod rsrc;
pub mod status;

pub use id::{Func, Id, ResId};
pub use rsrc::{Dlb2, Limits};
pub use status::{Error, Locked, Status};

/// Number of load-balanced port classes of service.
pub const NUM_COS: usize = 4;

/// Number of queue slots in each load-balanced consumer queue.
pub const QIDS_PER_LDB_CQ: usize = 8;

/// Number of scheduling priorities a queue mapping may use.
pub const NUM_QID_PRIORITIES: u8 = 8;

/// Largest consumer queue depth a port may request.
pub const MAX_CQ_DEPTH: u32 = 1024;

/// Upper bound on a load-balanced queue's inflight allocation.
pub const MAX_QID_INFLIGHTS: u32 = 4096;

/// Sequence numbers backing each sequence-number group.
pub const SEQUENCE_NUMBERS_PER_GROUP: u32 = 1024;

/// Deferred-work capability provided by the embedding system.
///
/// Map and unmap requests issued against a started domain may be left in an
/// in-progress state.  When that happens the manager calls [Worker::schedule]
/// and expects the host to later invoke
/// [Dlb2::finish_unmap_qid_procedures] and [Dlb2::finish_map_qid_procedures]
/// (under the same device lock) until both report nothing outstanding.
pub trait Worker: Send + Sync {
    fn schedule(&self);
}

/// A [Worker] for hosts which poll the maintenance procedures themselves.
#[derive(Default)]
pub struct NoopWorker;
impl Worker for NoopWorker {
    fn schedule(&self) {}
}
