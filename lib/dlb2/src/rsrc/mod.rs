// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The resource manager proper.
//!
//! Every hardware object lives in a fixed array indexed by physical id.
//! Ownership is expressed by membership of that id in one of the
//! avail/used [IdList]s held by a [FunctionResources] or a [Domain], so
//! creating and destroying objects never allocates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slog::o;

use crate::bitmap::Bitmap;
use crate::hw::{Csr, Hw};
use crate::id::{Func, Id, ResId};
use crate::mbox::{Mailbox, MboxPolicy};
use crate::status::{Error, Status};
use crate::{NoopWorker, Worker, NUM_COS, QIDS_PER_LDB_CQ};

mod cmds;
mod domain;
mod list;
mod port;
mod qid;
mod query;
mod queue;
mod reset;
mod sn;
mod vdev;

#[cfg(test)]
mod test;

pub use cmds::*;
pub use qid::{PendingMap, QidSlot, SlotState};
pub use sn::SnGroup;

use list::IdList;

/// Hardware totals and the bounds applied while draining a domain for reset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub num_domains: u32,
    pub num_ldb_queues: u32,
    /// Load-balanced ports across all classes of service
    pub num_ldb_ports: u32,
    pub num_dir_ports: u32,
    pub num_ldb_credits: u32,
    pub num_dir_credits: u32,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub num_vdevs: u8,
    pub num_sn_groups: u32,
    /// Polls of a CQ's inflight count while waiting for it to drain
    pub cq_comp_check_loops: u32,
    /// Drain passes made while waiting for a domain's queues to empty
    pub qid_empty_check_loops: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            num_domains: 32,
            num_ldb_queues: 32,
            num_ldb_ports: 64,
            num_dir_ports: 64,
            num_ldb_credits: 8192,
            num_dir_credits: 2048,
            num_atomic_inflights: 2048,
            num_hist_list_entries: 2048,
            num_vdevs: 16,
            num_sn_groups: 2,
            cq_comp_check_loops: 409600,
            qid_empty_check_loops: 65536,
        }
    }
}

impl Limits {
    /// Largest number of load-balanced ports a queue's port mask can name.
    pub const MAX_LDB_PORTS: u32 = 64;
    pub const MAX_VDEVS: u8 = 16;

    pub fn ldb_ports_per_cos(&self) -> u32 {
        self.num_ldb_ports / NUM_COS as u32
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.num_ldb_ports == 0
            || self.num_ldb_ports % NUM_COS as u32 != 0
        {
            return Err(Error::InvalidArgument(
                "ldb ports must be a non-zero multiple of the class count",
            ));
        }
        if self.num_ldb_ports > Self::MAX_LDB_PORTS {
            return Err(Error::InvalidArgument("too many ldb ports"));
        }
        if self.num_vdevs > Self::MAX_VDEVS {
            return Err(Error::InvalidArgument("too many vdevs"));
        }
        if self.cq_comp_check_loops == 0 || self.qid_empty_check_loops == 0 {
            return Err(Error::InvalidArgument("drain bounds must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
struct LdbQueue {
    id: ResId,
    /// Physical id of the owning domain
    domain: Option<u32>,
    configured: bool,
    num_qid_inflights: u32,
    aqed_limit: u32,
    /// Sequence-number (group, slot) held by an ordered queue
    sn: Option<(u32, u32)>,
    num_mappings: u32,
    num_pending_additions: u32,
}

#[derive(Clone, Debug, Default)]
struct LdbPort {
    id: ResId,
    domain: Option<u32>,
    cos: usize,
    configured: bool,
    enabled: bool,
    qid_map: [QidSlot; QIDS_PER_LDB_CQ],
    /// Slots holding a queue: mapped, or being unmapped
    num_mappings: u32,
    num_pending_removals: u32,
    hist_list_entry_base: u32,
    hist_list_entry_limit: u32,
    init_tkn_cnt: u32,
    cq_depth: u32,
}

/// A directed queue and the directed port sharing its id.
#[derive(Clone, Debug, Default)]
struct DirPqPair {
    id: ResId,
    domain: Option<u32>,
    port_configured: bool,
    queue_configured: bool,
    enabled: bool,
    init_tkn_cnt: u32,
    cq_depth: u32,
}

/// A domain's slice of history-list entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct HistList {
    base: u32,
    /// Entries already handed to the domain's ports
    offset: u32,
    total: u32,
    avail: u32,
}

#[derive(Clone, Debug)]
struct Domain {
    id: ResId,
    parent: Func,
    configured: bool,
    started: bool,
    avail_ldb_queues: IdList,
    used_ldb_queues: IdList,
    avail_ldb_ports: [IdList; NUM_COS],
    used_ldb_ports: [IdList; NUM_COS],
    avail_dir_pqs: IdList,
    used_dir_pqs: IdList,
    num_ldb_credits: u32,
    num_dir_credits: u32,
    num_avail_aqed: u32,
    num_used_aqed: u32,
    hist: HistList,
    num_pending_removals: u32,
    num_pending_additions: u32,
}

impl Domain {
    fn new(id: u32) -> Self {
        Self {
            id: ResId::new(id),
            parent: Func::Pf,
            configured: false,
            started: false,
            avail_ldb_queues: IdList::default(),
            used_ldb_queues: IdList::default(),
            avail_ldb_ports: Default::default(),
            used_ldb_ports: Default::default(),
            avail_dir_pqs: IdList::default(),
            used_dir_pqs: IdList::default(),
            num_ldb_credits: 0,
            num_dir_credits: 0,
            num_avail_aqed: 0,
            num_used_aqed: 0,
            hist: HistList::default(),
            num_pending_removals: 0,
            num_pending_additions: 0,
        }
    }

    /// Configured ports of every class, in class order.
    fn used_ldb_port_ids(&self) -> Vec<u32> {
        self.used_ldb_ports.iter().flat_map(IdList::iter).collect()
    }

    fn all_ldb_port_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.used_ldb_ports
            .iter()
            .chain(self.avail_ldb_ports.iter())
            .flat_map(IdList::iter)
    }
}

/// Resources held by the PF or one VF and not yet attached to a domain.
#[derive(Clone, Debug)]
struct FunctionResources {
    func: Func,
    locked: bool,
    avail_domains: IdList,
    used_domains: IdList,
    avail_ldb_queues: IdList,
    avail_ldb_ports: [IdList; NUM_COS],
    avail_dir_pqs: IdList,
    num_avail_ldb_credits: u32,
    num_avail_dir_credits: u32,
    num_avail_aqed: u32,
    /// Set bits are entries available to this function
    avail_hist_list_entries: Bitmap,
}

impl FunctionResources {
    fn new(func: Func, num_hist_list_entries: u32) -> Self {
        Self {
            func,
            locked: false,
            avail_domains: IdList::default(),
            used_domains: IdList::default(),
            avail_ldb_queues: IdList::default(),
            avail_ldb_ports: Default::default(),
            avail_dir_pqs: IdList::default(),
            num_avail_ldb_credits: 0,
            num_avail_dir_credits: 0,
            num_avail_aqed: 0,
            avail_hist_list_entries: Bitmap::new(
                num_hist_list_entries as usize,
            ),
        }
    }

    fn num_avail_ldb_ports(&self) -> u32 {
        self.avail_ldb_ports.iter().map(IdList::count).sum()
    }
}

/// The DLB 2.0 resource manager.
///
/// All methods expect to be serialized by the caller, which typically holds
/// one lock per device around every call.
pub struct Dlb2 {
    log: slog::Logger,
    limits: Limits,
    hw: Hw,
    worker: Arc<dyn Worker>,
    mbox: Option<Arc<dyn Mailbox>>,
    mbox_policy: MboxPolicy,

    domains: Vec<Domain>,
    ldb_queues: Vec<LdbQueue>,
    ldb_ports: Vec<LdbPort>,
    dir_pqs: Vec<DirPqPair>,
    sn_groups: Vec<SnGroup>,

    pf: FunctionResources,
    vfs: Vec<FunctionResources>,

    /// Percentage of scheduling bandwidth reserved for each class
    cos_reservation: [u8; NUM_COS],
}

impl Dlb2 {
    /// Build a manager in which the PF owns every resource.
    pub fn new(
        log: slog::Logger,
        limits: Limits,
        csr: Arc<dyn Csr>,
    ) -> Result<Self, Error> {
        limits.validate()?;
        let log = log.new(o!("component" => "dlb2"));

        let num_hist = limits.num_hist_list_entries;
        let mut pf = FunctionResources::new(Func::Pf, num_hist);
        let vfs = (0..limits.num_vdevs)
            .map(|v| FunctionResources::new(Func::Vf(v), num_hist))
            .collect();

        let domains = (0..limits.num_domains).map(Domain::new).collect();
        pf.avail_domains = (0..limits.num_domains).collect();

        let ldb_queues = (0..limits.num_ldb_queues)
            .map(|i| LdbQueue { id: ResId::new(i), ..Default::default() })
            .collect();
        pf.avail_ldb_queues = (0..limits.num_ldb_queues).collect();

        let per_cos = limits.ldb_ports_per_cos();
        let ldb_ports = (0..limits.num_ldb_ports)
            .map(|i| LdbPort {
                id: ResId::new(i),
                cos: (i / per_cos) as usize,
                ..Default::default()
            })
            .collect();
        for (cos, list) in pf.avail_ldb_ports.iter_mut().enumerate() {
            let base = cos as u32 * per_cos;
            *list = Self::ldb_port_order(per_cos).map(|i| base + i).collect();
        }

        let dir_pqs = (0..limits.num_dir_ports)
            .map(|i| DirPqPair { id: ResId::new(i), ..Default::default() })
            .collect();
        pf.avail_dir_pqs = (0..limits.num_dir_ports).collect();

        pf.num_avail_ldb_credits = limits.num_ldb_credits;
        pf.num_avail_dir_credits = limits.num_dir_credits;
        pf.num_avail_aqed = limits.num_atomic_inflights;
        pf.avail_hist_list_entries.fill();

        let sn_groups = (0..limits.num_sn_groups).map(SnGroup::new).collect();

        slog::info!(log, "resource manager initialized";
            "domains" => limits.num_domains,
            "ldb_queues" => limits.num_ldb_queues,
            "ldb_ports" => limits.num_ldb_ports,
            "dir_ports" => limits.num_dir_ports,
            "vdevs" => limits.num_vdevs);

        Ok(Self {
            log,
            limits,
            hw: Hw::new(csr),
            worker: Arc::new(NoopWorker),
            mbox: None,
            mbox_policy: MboxPolicy::default(),
            domains,
            ldb_queues,
            ldb_ports,
            dir_pqs,
            sn_groups,
            pf,
            vfs,
            cos_reservation: [25; NUM_COS],
        })
    }

    /// Order in which a class's ports are handed out.
    ///
    /// Striding by 7 spreads consecutive allocations across the class so
    /// neighbouring ports tend to land in different domains.
    fn ldb_port_order(per_cos: u32) -> impl Iterator<Item = u32> {
        let stride = if per_cos % 7 != 0 { 7 } else { 1 };
        (0..per_cos).map(move |i| (i * stride) % per_cos)
    }

    pub fn set_worker(&mut self, worker: Arc<dyn Worker>) {
        self.worker = worker;
    }

    pub fn set_mailbox(&mut self, mbox: Arc<dyn Mailbox>, policy: MboxPolicy) {
        self.mbox = Some(mbox);
        self.mbox_policy = policy;
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Log and build the error for a request rejected before any mutation.
    fn rejected(&self, op: &'static str, status: Status) -> Error {
        slog::debug!(self.log, "request rejected";
            "op" => op, "status" => %status);
        status.reject()
    }

    /// Log and build the error for bookkeeping found to be inconsistent.
    fn fault(&self, detail: String) -> Error {
        slog::error!(self.log, "internal error"; "detail" => &detail);
        Error::Internal(detail)
    }

    fn rsrcs(&self, func: Func) -> Result<&FunctionResources, Error> {
        match func {
            Func::Pf => Ok(&self.pf),
            Func::Vf(v) => self
                .vfs
                .get(usize::from(v))
                .ok_or(Error::InvalidArgument("no such vdev")),
        }
    }

    fn rsrcs_mut(
        &mut self,
        func: Func,
    ) -> Result<&mut FunctionResources, Error> {
        match func {
            Func::Pf => Ok(&mut self.pf),
            Func::Vf(v) => self
                .vfs
                .get_mut(usize::from(v))
                .ok_or(Error::InvalidArgument("no such vdev")),
        }
    }

    /// Resolve a domain id from its requester's id space.
    ///
    /// The PF addresses domains directly; a VF may only name domains it
    /// owns.
    fn domain_from_id(&self, id: Id) -> Option<u32> {
        match id {
            Id::Physical(p) => {
                ((p as usize) < self.domains.len()).then_some(p)
            }
            Id::Virtual { vdev, .. } => {
                let rsrcs = self.vfs.get(usize::from(vdev))?;
                rsrcs
                    .used_domains
                    .iter()
                    .chain(rsrcs.avail_domains.iter())
                    .find(|&d| self.domains[d as usize].id.matches(id))
            }
        }
    }

    fn configured_domain(&self, id: Id) -> Result<u32, Status> {
        let d = self.domain_from_id(id).ok_or(Status::InvalidDomainId)?;
        if !self.domains[d as usize].configured {
            return Err(Status::DomainNotConfigured);
        }
        Ok(d)
    }

    /// A configured domain which may still have objects added to it.
    fn unstarted_domain(&self, id: Id) -> Result<u32, Status> {
        let d = self.configured_domain(id)?;
        if self.domains[d as usize].started {
            return Err(Status::DomainStarted);
        }
        Ok(d)
    }

    /// Any load-balanced port attached to the domain, configured or not.
    fn domain_ldb_port(&self, d: u32, id: Id) -> Option<u32> {
        self.domains[d as usize]
            .all_ldb_port_ids()
            .find(|&p| self.ldb_ports[p as usize].id.matches(id))
    }

    fn domain_used_ldb_queue(&self, d: u32, id: Id) -> Option<u32> {
        self.domains[d as usize]
            .used_ldb_queues
            .iter()
            .find(|&q| self.ldb_queues[q as usize].id.matches(id))
    }

    fn domain_used_dir_pq(&self, d: u32, id: Id) -> Option<u32> {
        self.domains[d as usize]
            .used_dir_pqs
            .iter()
            .find(|&pq| self.dir_pqs[pq as usize].id.matches(id))
    }

    fn domain_dir_pq(&self, d: u32, id: Id) -> Option<u32> {
        let domain = &self.domains[d as usize];
        domain
            .used_dir_pqs
            .iter()
            .chain(domain.avail_dir_pqs.iter())
            .find(|&pq| self.dir_pqs[pq as usize].id.matches(id))
    }

    /// The id of a domain as seen by its owner.
    fn domain_external_id(&self, d: u32) -> u32 {
        let domain = &self.domains[d as usize];
        domain.id.external(domain.parent)
    }
}
