// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole-manager tests, run against the simulated device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use slog::o;

use super::*;
use crate::hw::regs::Reg;
use crate::hw::sim::SimDevice;
use crate::mbox::{Loopback, VfNotification, VfRequest};
use crate::status::Locked;

fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}

fn manager(limits: Limits) -> (Dlb2, Arc<SimDevice>) {
    let sim = Arc::new(SimDevice::new());
    let dlb = Dlb2::new(logger(), limits, sim.clone()).unwrap();
    (dlb, sim)
}

/// A device with 4 domains, 4 LDB queues, 16 LDB ports and 400 LDB credits.
fn small_limits() -> Limits {
    Limits {
        num_domains: 4,
        num_ldb_queues: 4,
        num_ldb_ports: 16,
        num_dir_ports: 4,
        num_ldb_credits: 400,
        num_dir_credits: 100,
        num_atomic_inflights: 64,
        num_hist_list_entries: 64,
        num_vdevs: 2,
        ..Default::default()
    }
}

#[derive(Default)]
struct CountingWorker(AtomicUsize);
impl Worker for CountingWorker {
    fn schedule(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

const CQ_BASE: u64 = 0x10_0000;

/// A domain holding `queues` LDB queues (all created) and one created LDB
/// port, not yet started.
struct Fixture {
    dlb: Dlb2,
    sim: Arc<SimDevice>,
    worker: Arc<CountingWorker>,
    domain: Id,
    port: u32,
    queues: Vec<u32>,
}

impl Fixture {
    fn new(queues: u32) -> Self {
        let (mut dlb, sim) = manager(Limits::default());
        let worker = Arc::new(CountingWorker::default());
        dlb.set_worker(worker.clone());

        let args = CreateSchedDomainArgs {
            num_ldb_queues: queues,
            num_ldb_ports: 1,
            num_dir_ports: 1,
            num_ldb_credits: 256,
            num_dir_credits: 64,
            num_hist_list_entries: 64,
            ..Default::default()
        };
        let domain =
            Id::Physical(dlb.create_sched_domain(Func::Pf, &args).unwrap());
        let queues = (0..queues)
            .map(|_| {
                dlb.create_ldb_queue(domain, &CreateLdbQueueArgs::default())
                    .unwrap()
            })
            .collect();
        let port_args = CreateLdbPortArgs {
            cq_depth: 8,
            cq_history_list_size: 64,
            ..Default::default()
        };
        let port = dlb.create_ldb_port(domain, &port_args, CQ_BASE).unwrap();
        Self { dlb, sim, worker, domain, port, queues }
    }

    fn map(&mut self, q: u32) -> Result<MapOutcome, Error> {
        let args = MapQidArgs { port_id: self.port, qid: q, priority: 0 };
        self.dlb.map_qid(self.domain, &args)
    }

    fn map_at(&mut self, q: u32, priority: u8) -> Result<MapOutcome, Error> {
        let args = MapQidArgs { port_id: self.port, qid: q, priority };
        self.dlb.map_qid(self.domain, &args)
    }

    fn unmap(&mut self, q: u32) -> Result<MapOutcome, Error> {
        let args = UnmapQidArgs { port_id: self.port, qid: q };
        self.dlb.unmap_qid(self.domain, &args)
    }

    fn start(&mut self) {
        self.dlb.start_domain(self.domain).unwrap();
    }

    fn slot(&self, q: u32) -> Option<QidSlot> {
        self.dlb.ldb_ports[self.port as usize]
            .qid_map
            .iter()
            .find(|s| s.qid == q && s.state != SlotState::Unmapped)
            .copied()
    }

    fn scheduled(&self) -> usize {
        self.worker.0.load(Ordering::Relaxed)
    }

    fn slot_at(&self, slot: usize) -> QidSlot {
        self.dlb.ldb_ports[self.port as usize].qid_map[slot]
    }

    /// The queue, port and domain counters agree with the slot table.
    fn check_slot_counters(&self) {
        let port = &self.dlb.ldb_ports[self.port as usize];
        let held = |s: &QidSlot| {
            matches!(s.state, SlotState::Mapped | SlotState::UnmapInProg { .. })
        };
        for &q in &self.queues {
            let queue = &self.dlb.ldb_queues[q as usize];
            let mapped =
                port.qid_map.iter().filter(|s| s.qid == q && held(s)).count();
            assert_eq!(queue.num_mappings as usize, mapped, "queue {q}");
            let adding = port
                .qid_map
                .iter()
                .filter(|s| s.qid == q && s.state == SlotState::MapInProg)
                .count();
            assert_eq!(queue.num_pending_additions as usize, adding, "{q}");
        }
        let removing = port
            .qid_map
            .iter()
            .filter(|s| matches!(s.state, SlotState::UnmapInProg { .. }))
            .count();
        let adding = port
            .qid_map
            .iter()
            .filter(|s| s.state == SlotState::MapInProg)
            .count();
        let mapped = port.qid_map.iter().filter(|s| held(s)).count();
        assert_eq!(port.num_mappings as usize, mapped);
        assert_eq!(port.num_pending_removals as usize, removing);

        let dom = &self.dlb.domains[self.domain.raw() as usize];
        assert_eq!(dom.num_pending_removals as usize, removing);
        assert_eq!(dom.num_pending_additions as usize, adding);
    }
}

/// Every id of every kind appears in exactly one list, and every counted
/// resource sums to the device total.
fn check_conservation(dlb: &Dlb2) {
    let lim = &dlb.limits;
    let funcs: Vec<&FunctionResources> =
        std::iter::once(&dlb.pf).chain(dlb.vfs.iter()).collect();
    let doms: Vec<&Domain> =
        dlb.domains.iter().filter(|d| d.configured).collect();

    let mut domains: Vec<u32> = funcs
        .iter()
        .flat_map(|f| f.avail_domains.iter().chain(f.used_domains.iter()))
        .collect();
    domains.sort_unstable();
    assert_eq!(domains, (0..lim.num_domains).collect::<Vec<_>>());

    let mut queues: Vec<u32> = funcs
        .iter()
        .flat_map(|f| f.avail_ldb_queues.iter())
        .chain(doms.iter().flat_map(|d| {
            d.avail_ldb_queues.iter().chain(d.used_ldb_queues.iter())
        }))
        .collect();
    queues.sort_unstable();
    assert_eq!(queues, (0..lim.num_ldb_queues).collect::<Vec<_>>());

    let mut ports: Vec<u32> = funcs
        .iter()
        .flat_map(|f| f.avail_ldb_ports.iter().flat_map(IdList::iter))
        .chain(doms.iter().flat_map(|d| d.all_ldb_port_ids()))
        .collect();
    ports.sort_unstable();
    assert_eq!(ports, (0..lim.num_ldb_ports).collect::<Vec<_>>());

    let mut pairs: Vec<u32> = funcs
        .iter()
        .flat_map(|f| f.avail_dir_pqs.iter())
        .chain(doms.iter().flat_map(|d| {
            d.avail_dir_pqs.iter().chain(d.used_dir_pqs.iter())
        }))
        .collect();
    pairs.sort_unstable();
    assert_eq!(pairs, (0..lim.num_dir_ports).collect::<Vec<_>>());

    let sum = |f: fn(&FunctionResources) -> u32, g: fn(&Domain) -> u32| {
        funcs.iter().map(|r| f(r)).sum::<u32>()
            + doms.iter().map(|d| g(d)).sum::<u32>()
    };
    assert_eq!(
        sum(|f| f.num_avail_ldb_credits, |d| d.num_ldb_credits),
        lim.num_ldb_credits
    );
    assert_eq!(
        sum(|f| f.num_avail_dir_credits, |d| d.num_dir_credits),
        lim.num_dir_credits
    );
    assert_eq!(
        sum(|f| f.num_avail_aqed, |d| d.num_avail_aqed + d.num_used_aqed),
        lim.num_atomic_inflights
    );
    assert_eq!(
        sum(|f| f.avail_hist_list_entries.count() as u32, |d| d.hist.total),
        lim.num_hist_list_entries
    );
}

#[test]
fn create_domain_draws_from_pf() {
    let (mut dlb, _sim) = manager(small_limits());
    let args = CreateSchedDomainArgs {
        num_ldb_queues: 2,
        num_ldb_ports: 2,
        num_ldb_credits: 100,
        ..Default::default()
    };
    let id = dlb.create_sched_domain(Func::Pf, &args).unwrap();
    assert_eq!(id, 0);

    let avail = dlb.get_num_resources(Func::Pf).unwrap();
    assert_eq!(avail.num_sched_domains, 3);
    assert_eq!(avail.num_ldb_queues, 2);
    assert_eq!(avail.num_ldb_ports, 14);
    assert_eq!(avail.num_ldb_credits, 300);

    let used = dlb.get_num_used_resources(Func::Pf).unwrap();
    assert_eq!(used.num_sched_domains, 1);
    assert_eq!(used.num_ldb_queues, 2);
    assert_eq!(used.num_ldb_ports, 2);
    assert_eq!(used.num_ldb_credits, 100);
    check_conservation(&dlb);
}

#[test]
fn rejected_domain_leaves_pf_untouched() {
    let (mut dlb, _sim) = manager(small_limits());
    let before = dlb.get_num_resources(Func::Pf).unwrap();

    let args = CreateSchedDomainArgs {
        num_ldb_queues: 5,
        num_ldb_ports: 2,
        num_ldb_credits: 100,
        ..Default::default()
    };
    let err = dlb.create_sched_domain(Func::Pf, &args).unwrap_err();
    assert!(matches!(err, Error::Unavailable(Status::LdbQueuesUnavailable)));
    assert_eq!(dlb.get_num_resources(Func::Pf).unwrap(), before);

    // Queues without a port to schedule them can never drain.
    let args =
        CreateSchedDomainArgs { num_ldb_queues: 1, ..Default::default() };
    let err = dlb.create_sched_domain(Func::Pf, &args).unwrap_err();
    assert_eq!(err.status(), Some(Status::LdbPortRequiredForLdbQueues));

    let args = CreateSchedDomainArgs {
        num_hist_list_entries: 65,
        ..Default::default()
    };
    let err = dlb.create_sched_domain(Func::Pf, &args).unwrap_err();
    assert_eq!(err.status(), Some(Status::HistListEntriesUnavailable));
    assert_eq!(dlb.get_num_resources(Func::Pf).unwrap(), before);
}

#[test]
fn dynamic_map_waits_for_queue_inflights() {
    let mut fx = Fixture::new(1);
    let q = fx.queues[0];
    fx.start();

    fx.sim.set(Reg::LdbQidInflightCount(q), 3);
    assert_eq!(fx.map(q).unwrap(), MapOutcome::Pending);
    assert_eq!(fx.slot(q).unwrap().state, SlotState::MapInProg);
    assert_eq!(fx.dlb.ldb_queues[q as usize].num_mappings, 0);
    assert!(fx.scheduled() > 0);

    // Still busy: the pass changes nothing.
    assert_eq!(fx.dlb.finish_map_qid_procedures().unwrap(), 1);
    assert_eq!(fx.slot(q).unwrap().state, SlotState::MapInProg);

    fx.sim.set(Reg::LdbQidInflightCount(q), 0);
    assert_eq!(fx.dlb.finish_map_qid_procedures().unwrap(), 0);
    assert_eq!(fx.slot(q).unwrap().state, SlotState::Mapped);
    assert_eq!(fx.dlb.ldb_queues[q as usize].num_mappings, 1);
    assert_eq!(fx.dlb.ldb_ports[fx.port as usize].num_mappings, 1);
    assert_eq!(fx.sim.ldb_cq_mapped_qids(fx.port), vec![q]);
}

#[test]
fn dynamic_unmap_waits_for_cq_completions() {
    let mut fx = Fixture::new(1);
    let q = fx.queues[0];
    assert_eq!(fx.map(q).unwrap(), MapOutcome::Complete);
    fx.start();

    fx.sim.set(Reg::LdbCqInflightCount(fx.port), 2);
    assert_eq!(fx.unmap(q).unwrap(), MapOutcome::Pending);
    assert_eq!(
        fx.slot(q).unwrap().state,
        SlotState::UnmapInProg { pending: None }
    );
    assert_eq!(fx.dlb.pending_port_unmaps(fx.domain, fx.port).unwrap(), 1);
    assert_eq!(fx.dlb.finish_unmap_qid_procedures().unwrap(), 1);

    fx.sim.set(Reg::LdbCqInflightCount(fx.port), 0);
    assert_eq!(fx.dlb.finish_unmap_qid_procedures().unwrap(), 0);
    assert_eq!(fx.slot(q), None);
    assert_eq!(fx.dlb.ldb_ports[fx.port as usize].num_mappings, 0);
    assert_eq!(fx.dlb.ldb_queues[q as usize].num_mappings, 0);
    assert_eq!(fx.dlb.pending_port_unmaps(fx.domain, fx.port).unwrap(), 0);
    assert!(fx.sim.ldb_cq_mapped_qids(fx.port).is_empty());
}

#[test]
fn map_rides_on_unmap_when_port_is_full() {
    let mut fx = Fixture::new(9);
    let queues = fx.queues.clone();
    for &q in &queues[..8] {
        fx.map(q).unwrap();
    }
    fx.start();

    fx.sim.set(Reg::LdbCqInflightCount(fx.port), 1);
    assert_eq!(fx.unmap(queues[0]).unwrap(), MapOutcome::Pending);
    assert_eq!(fx.map(queues[8]).unwrap(), MapOutcome::Pending);
    let pending = PendingMap { qid: queues[8], priority: 0 };
    assert_eq!(
        fx.slot(queues[0]).unwrap().state,
        SlotState::UnmapInProg { pending: Some(pending) }
    );

    // The slot now belongs to the queued mapping.
    let err = fx.unmap(queues[0]).unwrap_err();
    assert!(matches!(err, Error::Invalid(Status::InvalidQid)));

    fx.sim.set(Reg::LdbCqInflightCount(fx.port), 0);
    assert_eq!(fx.dlb.finish_unmap_qid_procedures().unwrap(), 0);
    assert_eq!(fx.slot(queues[0]), None);
    assert_eq!(fx.slot(queues[8]).unwrap().state, SlotState::Mapped);
    assert_eq!(fx.dlb.ldb_ports[fx.port as usize].num_mappings, 8);
}

#[test]
fn map_finishes_removals_on_the_port_first() {
    let mut fx = Fixture::new(3);
    let queues = fx.queues.clone();
    fx.map(queues[0]).unwrap();
    fx.start();

    fx.sim.set(Reg::LdbCqInflightCount(fx.port), 1);
    assert_eq!(fx.unmap(queues[0]).unwrap(), MapOutcome::Pending);
    assert_eq!(fx.sim.get(Reg::LdbCqEnable(fx.port)), 0);

    // A free slot takes the new queue while the removal keeps the CQ off.
    assert_eq!(fx.map(queues[1]).unwrap(), MapOutcome::Complete);
    assert_eq!(fx.slot_at(0).qid, queues[0]);
    assert_eq!(fx.slot_at(0).state, SlotState::UnmapInProg { pending: None });
    assert_eq!(fx.slot_at(1).qid, queues[1]);
    assert_eq!(fx.slot_at(1).state, SlotState::Mapped);
    assert_eq!(fx.dlb.pending_port_unmaps(fx.domain, fx.port).unwrap(), 1);
    assert_eq!(fx.sim.get(Reg::LdbCqEnable(fx.port)), 0);
    fx.check_slot_counters();

    // Once the completions drain, the next map retires the removal itself.
    fx.sim.set(Reg::LdbCqInflightCount(fx.port), 0);
    assert_eq!(fx.map(queues[2]).unwrap(), MapOutcome::Complete);
    assert_eq!(fx.slot(queues[0]), None);
    assert_eq!(fx.slot(queues[2]).unwrap().state, SlotState::Mapped);
    assert_eq!(fx.dlb.pending_port_unmaps(fx.domain, fx.port).unwrap(), 0);
    assert_eq!(fx.dlb.ldb_queues[queues[0] as usize].num_mappings, 0);
    assert_eq!(fx.sim.get(Reg::LdbCqEnable(fx.port)), 1);
    fx.check_slot_counters();
    assert_eq!(fx.dlb.finish_unmap_qid_procedures().unwrap(), 0);
}

/// Fill the port, leaving `queues[0]` unmapping with its slot promised to
/// `queues[8]` and slot 7 holding `queues[7]` mid-map.
fn handed_over(queues: u32) -> Fixture {
    let mut fx = Fixture::new(queues);
    let q = fx.queues.clone();
    for &qid in &q[..7] {
        fx.map(qid).unwrap();
    }
    fx.start();

    fx.sim.set(Reg::LdbQidInflightCount(q[7]), 3);
    assert_eq!(fx.map(q[7]).unwrap(), MapOutcome::Pending);
    fx.sim.set(Reg::LdbCqInflightCount(fx.port), 1);
    assert_eq!(fx.unmap(q[0]).unwrap(), MapOutcome::Pending);
    assert_eq!(fx.map(q[8]).unwrap(), MapOutcome::Pending);

    let pending = PendingMap { qid: q[8], priority: 0 };
    assert_eq!(
        fx.slot_at(0),
        QidSlot {
            qid: q[0],
            priority: 0,
            state: SlotState::UnmapInProg { pending: Some(pending) },
        }
    );
    fx.check_slot_counters();
    fx
}

#[test]
fn remap_of_handed_over_queue_is_refused() {
    let mut fx = handed_over(9);
    let q = fx.queues.clone();

    // Aborting the map in slot 7 frees a slot, yet the queue leaving slot 0
    // may not come back until its removal completes.
    assert_eq!(fx.unmap(q[7]).unwrap(), MapOutcome::Complete);
    assert_eq!(fx.slot_at(7).state, SlotState::Unmapped);
    let err = fx.map(q[0]).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(fx.slot_at(0).qid, q[0]);
    assert_eq!(fx.slot_at(7).state, SlotState::Unmapped);
    fx.check_slot_counters();

    // Still waiting on completions: nothing moves.
    assert_eq!(fx.dlb.finish_unmap_qid_procedures().unwrap(), 1);
    fx.check_slot_counters();

    fx.sim.set(Reg::LdbCqInflightCount(fx.port), 0);
    assert_eq!(fx.dlb.finish_unmap_qid_procedures().unwrap(), 0);
    assert_eq!(fx.slot_at(0).qid, q[8]);
    assert_eq!(fx.slot_at(0).state, SlotState::Mapped);
    assert_eq!(fx.dlb.ldb_queues[q[0] as usize].num_mappings, 0);
    assert_eq!(fx.dlb.ldb_queues[q[8] as usize].num_mappings, 1);
    assert_eq!(fx.sim.get(Reg::LdbCqEnable(fx.port)), 1);
    fx.check_slot_counters();

    // With the removal done the queue maps into the free slot.
    assert_eq!(fx.map(q[0]).unwrap(), MapOutcome::Complete);
    assert_eq!(fx.slot_at(7).qid, q[0]);
    assert_eq!(fx.slot_at(7).state, SlotState::Mapped);
    assert_eq!(fx.dlb.ldb_ports[fx.port as usize].num_mappings, 8);
    fx.check_slot_counters();
    let mut mapped = fx.sim.ldb_cq_mapped_qids(fx.port);
    mapped.sort_unstable();
    assert_eq!(mapped, vec![q[0], q[1], q[2], q[3], q[4], q[5], q[6], q[8]]);
}

#[test]
fn pending_map_is_replaced_not_duplicated() {
    let mut fx = handed_over(10);
    let q = fx.queues.clone();

    // Mapping the waiting queue again only updates its pending priority.
    assert_eq!(fx.map_at(q[8], 4).unwrap(), MapOutcome::Pending);
    let pending = PendingMap { qid: q[8], priority: 4 };
    assert_eq!(
        fx.slot_at(0).state,
        SlotState::UnmapInProg { pending: Some(pending) }
    );
    assert_eq!(fx.slot(q[8]), None);
    fx.check_slot_counters();

    // The only slot on its way out is already promised.
    let err = fx.map(q[9]).unwrap_err();
    assert!(matches!(err, Error::Unavailable(Status::NoQidSlotsAvailable)));
    fx.check_slot_counters();

    fx.sim.set(Reg::LdbCqInflightCount(fx.port), 0);
    assert_eq!(fx.dlb.finish_unmap_qid_procedures().unwrap(), 0);
    assert_eq!(
        fx.slot_at(0),
        QidSlot { qid: q[8], priority: 4, state: SlotState::Mapped }
    );
    fx.check_slot_counters();

    // The map in slot 7 is still held up by its queue's inflights.
    assert_eq!(fx.dlb.finish_map_qid_procedures().unwrap(), 1);
    fx.sim.set(Reg::LdbQidInflightCount(q[7]), 0);
    assert_eq!(fx.dlb.finish_map_qid_procedures().unwrap(), 0);
    assert_eq!(fx.slot_at(7).state, SlotState::Mapped);
    assert_eq!(fx.dlb.ldb_ports[fx.port as usize].num_mappings, 8);
    fx.check_slot_counters();
}

#[test]
fn full_port_rejects_new_queue() {
    let mut fx = Fixture::new(9);
    let queues = fx.queues.clone();
    for &q in &queues[..8] {
        fx.map(q).unwrap();
    }
    let err = fx.map(queues[8]).unwrap_err();
    assert!(matches!(err, Error::Unavailable(Status::NoQidSlotsAvailable)));

    // Remapping a mapped queue only changes its priority.
    let args = MapQidArgs { port_id: fx.port, qid: queues[3], priority: 5 };
    let outcome = fx.dlb.map_qid(fx.domain, &args).unwrap();
    assert_eq!(outcome, MapOutcome::Complete);
    assert_eq!(fx.slot(queues[3]).unwrap().priority, 5);
    assert_eq!(fx.dlb.ldb_ports[fx.port as usize].num_mappings, 8);
}

#[test]
fn map_rejections() {
    let mut fx = Fixture::new(1);
    let q = fx.queues[0];
    let domain = fx.domain;

    let bad_prio = MapQidArgs { port_id: fx.port, qid: q, priority: 8 };
    let err = fx.dlb.map_qid(domain, &bad_prio).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidPriority));

    let bad_port = MapQidArgs { port_id: 63, qid: q, priority: 0 };
    let err = fx.dlb.map_qid(domain, &bad_port).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidPortId));

    let bad_qid = MapQidArgs { port_id: fx.port, qid: 31, priority: 0 };
    let err = fx.dlb.map_qid(domain, &bad_qid).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidQid));

    // Unmapping something never mapped.
    let err = fx.unmap(q).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidQid));

    let err = fx.dlb.map_qid(Id::Physical(7), &bad_prio).unwrap_err();
    assert_eq!(err.status(), Some(Status::DomainNotConfigured));
}

/// The slot states reachable on the fixture's port, for queue `queues[0]`.
#[derive(Clone, Copy, Debug)]
enum Staged {
    Unmapped,
    Mapped,
    MapInProg,
    UnmapInProg,
    UnmapPendingMap,
}

fn staged(state: Staged) -> Fixture {
    let mut fx = Fixture::new(9);
    let queues = fx.queues.clone();
    let q = queues[0];
    fx.start();
    match state {
        Staged::Unmapped => {}
        Staged::Mapped => {
            fx.map(q).unwrap();
        }
        Staged::MapInProg => {
            fx.sim.set(Reg::LdbQidInflightCount(q), 3);
            fx.map(q).unwrap();
        }
        Staged::UnmapInProg => {
            fx.map(q).unwrap();
            fx.sim.set(Reg::LdbCqInflightCount(fx.port), 2);
            fx.unmap(q).unwrap();
        }
        Staged::UnmapPendingMap => {
            for &q in &queues[..8] {
                fx.map(q).unwrap();
            }
            fx.sim.set(Reg::LdbCqInflightCount(fx.port), 2);
            fx.unmap(q).unwrap();
            fx.map(queues[8]).unwrap();
        }
    }
    fx
}

#[test]
fn slot_events_are_total() {
    let states = [
        Staged::Unmapped,
        Staged::Mapped,
        Staged::MapInProg,
        Staged::UnmapInProg,
        Staged::UnmapPendingMap,
    ];
    for state in states {
        for event in 0..4 {
            let mut fx = staged(state);
            let q = fx.queues[0];
            let res = match event {
                0 => fx.map(q).map(|_| ()),
                1 => fx.unmap(q).map(|_| ()),
                2 => fx.dlb.finish_map_qid_procedures().map(|_| ()),
                _ => fx.dlb.finish_unmap_qid_procedures().map(|_| ()),
            };
            // Either the event applies or it is refused up front; the
            // bookkeeping is never found inconsistent.
            match res {
                Ok(()) => {}
                Err(Error::Invalid(_))
                | Err(Error::Unavailable(_))
                | Err(Error::InvalidArgument(_)) => {}
                Err(e) => panic!("{state:?} event {event}: {e}"),
            }
            let port = &fx.dlb.ldb_ports[fx.port as usize];
            let held = port
                .qid_map
                .iter()
                .filter(|s| {
                    matches!(
                        s.state,
                        SlotState::Mapped | SlotState::UnmapInProg { .. }
                    )
                })
                .count();
            assert_eq!(port.num_mappings as usize, held, "{state:?} {event}");
        }
    }
}

#[test]
fn idle_maintenance_changes_nothing() {
    let mut fx = staged(Staged::MapInProg);
    let snapshot = |fx: &Fixture| {
        let port = &fx.dlb.ldb_ports[fx.port as usize];
        let dom = &fx.dlb.domains[fx.domain.raw() as usize];
        (
            port.qid_map,
            port.num_mappings,
            port.num_pending_removals,
            dom.num_pending_additions,
            dom.num_pending_removals,
        )
    };
    let before = snapshot(&fx);
    for _ in 0..3 {
        assert_eq!(fx.dlb.finish_unmap_qid_procedures().unwrap(), 0);
        assert_eq!(fx.dlb.finish_map_qid_procedures().unwrap(), 1);
    }
    assert_eq!(snapshot(&fx), before);

    let (mut dlb, _sim) = manager(small_limits());
    assert_eq!(dlb.finish_map_qid_procedures().unwrap(), 0);
    assert_eq!(dlb.finish_unmap_qid_procedures().unwrap(), 0);
}

#[test]
fn abort_map_in_progress() {
    let mut fx = staged(Staged::MapInProg);
    let q = fx.queues[0];
    assert_eq!(fx.unmap(q).unwrap(), MapOutcome::Complete);
    assert_eq!(fx.slot(q), None);
    let dom = &fx.dlb.domains[fx.domain.raw() as usize];
    assert_eq!(dom.num_pending_additions, 0);
    assert_eq!(fx.dlb.finish_map_qid_procedures().unwrap(), 0);
}

#[test]
fn cancel_unmap_in_progress() {
    let mut fx = staged(Staged::UnmapInProg);
    let q = fx.queues[0];
    let args = MapQidArgs { port_id: fx.port, qid: q, priority: 3 };
    let outcome = fx.dlb.map_qid(fx.domain, &args).unwrap();
    assert_eq!(outcome, MapOutcome::Complete);
    let slot = fx.slot(q).unwrap();
    assert_eq!(slot.state, SlotState::Mapped);
    assert_eq!(slot.priority, 3);
    assert_eq!(fx.dlb.pending_port_unmaps(fx.domain, fx.port).unwrap(), 0);
}

#[test]
fn queue_ids_are_unique() {
    let (mut dlb, _sim) = manager(small_limits());
    let args = CreateSchedDomainArgs {
        num_ldb_queues: 3,
        num_ldb_ports: 1,
        ..Default::default()
    };
    let domain =
        Id::Physical(dlb.create_sched_domain(Func::Pf, &args).unwrap());
    let qargs = CreateLdbQueueArgs::default();
    let a = dlb.create_ldb_queue(domain, &qargs).unwrap();
    let b = dlb.create_ldb_queue(domain, &qargs).unwrap();
    let c = dlb.create_ldb_queue(domain, &qargs).unwrap();
    assert!(a != b && b != c && a != c);

    let err = dlb.create_ldb_queue(domain, &qargs).unwrap_err();
    assert_eq!(err.status(), Some(Status::LdbQueuesUnavailable));

    dlb.start_domain(domain).unwrap();
    let err = dlb.create_ldb_queue(domain, &qargs).unwrap_err();
    assert_eq!(err.status(), Some(Status::DomainStarted));
    let err = dlb.start_domain(domain).unwrap_err();
    assert_eq!(err.status(), Some(Status::DomainStarted));
}

#[test]
fn create_queue_checks() {
    let (mut dlb, sim) = manager(small_limits());
    let args = CreateSchedDomainArgs {
        num_ldb_queues: 2,
        num_ldb_ports: 1,
        num_atomic_inflights: 16,
        ..Default::default()
    };
    let domain =
        Id::Physical(dlb.create_sched_domain(Func::Pf, &args).unwrap());

    let too_many = CreateLdbQueueArgs {
        num_qid_inflights: 4097,
        ..Default::default()
    };
    let err = dlb.create_ldb_queue(domain, &too_many).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidQidInflightAllocation));

    let ordered = CreateLdbQueueArgs {
        num_sequence_numbers: 64,
        num_qid_inflights: 128,
        ..Default::default()
    };
    let err = dlb.create_ldb_queue(domain, &ordered).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidQidInflightAllocation));

    let atomic = CreateLdbQueueArgs {
        num_atomic_inflights: 32,
        lock_id_comp_level: 64,
        ..Default::default()
    };
    let err = dlb.create_ldb_queue(domain, &atomic).unwrap_err();
    assert_eq!(err.status(), Some(Status::AtomicInflightsUnavailable));

    let bad_level = CreateLdbQueueArgs {
        num_atomic_inflights: 8,
        lock_id_comp_level: 100,
        ..Default::default()
    };
    let err = dlb.create_ldb_queue(domain, &bad_level).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidLockIdCompLevel));

    let good = CreateLdbQueueArgs {
        num_qid_inflights: 32,
        num_atomic_inflights: 8,
        lock_id_comp_level: 64,
        ..Default::default()
    };
    let q = dlb.create_ldb_queue(domain, &good).unwrap();
    assert_eq!(sim.get(Reg::LdbQidInflightLimit(q)), 32);
    assert_eq!(sim.get(Reg::LdbQidAqedLimit(q)), 8);
    assert_eq!(sim.get(Reg::LdbQidLockIdComp(q)), 1);
    assert_eq!(sim.get(Reg::LdbQidWritePerm(q)), 0);

    let used = dlb.get_num_used_resources(Func::Pf).unwrap();
    assert_eq!(used.num_atomic_inflights, 8);
    check_conservation(&dlb);

    dlb.start_domain(domain).unwrap();
    assert_eq!(sim.get(Reg::LdbQidWritePerm(q)), 1);
}

#[test]
fn create_port_checks() {
    let (mut dlb, sim) = manager(small_limits());
    let args = CreateSchedDomainArgs {
        num_cos_ldb_ports: [0, 1, 0, 0],
        cos_strict: true,
        num_dir_ports: 1,
        num_hist_list_entries: 16,
        ..Default::default()
    };
    let domain =
        Id::Physical(dlb.create_sched_domain(Func::Pf, &args).unwrap());

    let port = |cos_id, cos_strict, depth, hist| CreateLdbPortArgs {
        cq_depth: depth,
        cq_history_list_size: hist,
        cos_id,
        cos_strict,
    };
    let cases = [
        (port(4, false, 8, 8), CQ_BASE, Status::InvalidCosId),
        (port(0, true, 8, 8), CQ_BASE, Status::LdbPortsUnavailable),
        (port(1, true, 8, 8), CQ_BASE + 4, Status::InvalidCqVirtAddr),
        (port(1, true, 12, 8), CQ_BASE, Status::InvalidCqDepth),
        (port(1, true, 8, 0), CQ_BASE, Status::InvalidHistListDepth),
        (port(1, true, 8, 17), CQ_BASE, Status::HistListEntriesUnavailable),
    ];
    for (args, base, status) in cases {
        let err = dlb.create_ldb_port(domain, &args, base).unwrap_err();
        assert_eq!(err.status(), Some(status), "{args:?}");
    }

    // Non-strict requests fall back to the class which has a port.
    let p =
        dlb.create_ldb_port(domain, &port(0, false, 4, 16), CQ_BASE).unwrap();
    assert_eq!(dlb.ldb_ports[p as usize].cos, 1);
    assert_eq!(sim.get(Reg::LdbCqTokenInit(p)), 4);
    assert_eq!(sim.get(Reg::LdbCqEnable(p)), 1);
    assert!(dlb.ldb_port_owned_by_domain(domain, p).unwrap());
    assert!(!dlb.ldb_port_owned_by_domain(domain, 0).unwrap());

    // A directed queue created first hands its pair to the port.
    let dq = dlb
        .create_dir_queue(domain, &CreateDirQueueArgs::default())
        .unwrap();
    let err = dlb
        .create_dir_queue(domain, &CreateDirQueueArgs::default())
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::DirQueuesUnavailable));
    let dargs = CreateDirPortArgs { cq_depth: 8, queue_id: Some(dq + 1) };
    let err = dlb.create_dir_port(domain, &dargs, CQ_BASE).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidDirQueueId));
    let dargs = CreateDirPortArgs { cq_depth: 8, queue_id: Some(dq) };
    let dp = dlb.create_dir_port(domain, &dargs, CQ_BASE).unwrap();
    assert_eq!(dp, dq);
    assert!(dlb.dir_port_owned_by_domain(domain, dp).unwrap());

    dlb.disable_dir_port(domain, dp).unwrap();
    assert_eq!(sim.get(Reg::DirCqEnable(dp)), 0);
    dlb.enable_dir_port(domain, dp).unwrap();
    assert_eq!(sim.get(Reg::DirCqEnable(dp)), 1);
    dlb.disable_ldb_port(domain, p).unwrap();
    assert_eq!(sim.get(Reg::LdbCqEnable(p)), 0);
    let err = dlb.enable_ldb_port(domain, p + 1).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidPortId));
}

#[test]
fn reset_restores_owner_pools() {
    let (mut dlb, _sim) = manager(small_limits());
    let before = dlb.get_num_resources(Func::Pf).unwrap();
    let bitmap = dlb.pf.avail_hist_list_entries.clone();

    let args = CreateSchedDomainArgs {
        num_ldb_queues: 2,
        num_cos_ldb_ports: [1, 1, 0, 0],
        num_ldb_ports: 1,
        num_dir_ports: 2,
        num_ldb_credits: 100,
        num_dir_credits: 10,
        num_atomic_inflights: 16,
        num_hist_list_entries: 24,
        ..Default::default()
    };
    let id = dlb.create_sched_domain(Func::Pf, &args).unwrap();
    assert_ne!(dlb.get_num_resources(Func::Pf).unwrap(), before);

    dlb.reset_domain(Id::Physical(id)).unwrap();
    assert_eq!(dlb.get_num_resources(Func::Pf).unwrap(), before);
    assert_eq!(dlb.pf.avail_hist_list_entries, bitmap);
    assert_eq!(
        dlb.get_num_used_resources(Func::Pf).unwrap(),
        NumResources::default()
    );
    check_conservation(&dlb);

    let err = dlb.reset_domain(Id::Physical(id)).unwrap_err();
    assert_eq!(err.status(), Some(Status::DomainNotConfigured));
    let err = dlb.reset_domain(Id::Physical(99)).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidDomainId));
}

#[test]
fn reset_drains_started_domain() {
    let (mut dlb, sim) = manager(Limits::default());
    let before = dlb.get_num_resources(Func::Pf).unwrap();

    let args = CreateSchedDomainArgs {
        num_ldb_queues: 2,
        num_ldb_ports: 1,
        num_dir_ports: 1,
        num_ldb_credits: 64,
        num_dir_credits: 64,
        num_hist_list_entries: 32,
        ..Default::default()
    };
    let domain =
        Id::Physical(dlb.create_sched_domain(Func::Pf, &args).unwrap());
    let qargs = CreateLdbQueueArgs::default();
    let q0 = dlb.create_ldb_queue(domain, &qargs).unwrap();
    let q1 = dlb.create_ldb_queue(domain, &qargs).unwrap();
    let pargs = CreateLdbPortArgs {
        cq_depth: 4,
        cq_history_list_size: 32,
        ..Default::default()
    };
    let p = dlb.create_ldb_port(domain, &pargs, CQ_BASE).unwrap();
    let dargs = CreateDirPortArgs { cq_depth: 8, queue_id: None };
    let dp = dlb.create_dir_port(domain, &dargs, CQ_BASE).unwrap();
    let dq = dlb
        .create_dir_queue(domain, &CreateDirQueueArgs { port_id: Some(dp) })
        .unwrap();
    assert_eq!(dp, dq);
    dlb.map_qid(domain, &MapQidArgs { port_id: p, qid: q0, priority: 0 })
        .unwrap();
    dlb.start_domain(domain).unwrap();

    // Events left behind by the domain's owner: some on the mapped queue,
    // some on a queue no port serves, and some on the directed queue.
    sim.set(Reg::LdbQidDepth(q0), 5);
    sim.set(Reg::LdbQidDepth(q1), 3);
    sim.set(Reg::DirQidDepth(dq), 2);
    assert_eq!(dlb.get_ldb_queue_depth(domain, q1).unwrap(), 3);
    assert_eq!(dlb.get_dir_queue_depth(domain, dq).unwrap(), 2);

    dlb.reset_domain(domain).unwrap();

    assert_eq!(sim.get(Reg::LdbQidDepth(q0)), 0);
    assert_eq!(sim.get(Reg::LdbQidDepth(q1)), 0);
    assert_eq!(sim.get(Reg::DirQidDepth(dq)), 0);
    assert_eq!(sim.get(Reg::LdbCqInflightCount(p)), 0);
    assert_eq!(sim.get(Reg::LdbCqTokenCount(p)), 0);
    assert_eq!(sim.get(Reg::DirCqTokenCount(dp)), 0);
    assert_eq!(sim.get(Reg::LdbCqEnable(p)), 0);
    assert_eq!(sim.get(Reg::LdbPpValid(p)), 0);
    assert_eq!(sim.get(Reg::LdbQidWritePerm(q0)), 0);
    assert_eq!(sim.get(Reg::DomainLdbCredits(domain.raw())), 0);
    assert!(sim.ldb_cq_mapped_qids(p).is_empty());

    assert_eq!(dlb.get_num_resources(Func::Pf).unwrap(), before);
    check_conservation(&dlb);
}

#[test]
fn reset_fails_on_stuck_completions() {
    let limits = Limits { cq_comp_check_loops: 4, ..Default::default() };
    let (mut dlb, sim) = manager(limits);
    let args = CreateSchedDomainArgs {
        num_ldb_queues: 1,
        num_ldb_ports: 1,
        num_hist_list_entries: 8,
        ..Default::default()
    };
    let domain =
        Id::Physical(dlb.create_sched_domain(Func::Pf, &args).unwrap());
    let pargs = CreateLdbPortArgs {
        cq_depth: 8,
        cq_history_list_size: 8,
        ..Default::default()
    };
    let p = dlb.create_ldb_port(domain, &pargs, CQ_BASE).unwrap();
    // The domain was never started, so nothing drains the CQ.
    sim.set(Reg::LdbCqInflightCount(p), 1);

    let err = dlb.reset_domain(domain).unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
    assert_eq!(err.status(), Some(Status::InternalError));
}

#[test]
fn resource_reset_returns_everything() {
    let (mut dlb, _sim) = manager(small_limits());
    let before_pf = dlb.get_num_resources(Func::Pf).unwrap();

    dlb.update_vdev_sched_domains(1, 1).unwrap();
    dlb.update_vdev_ldb_queues(1, 1).unwrap();
    dlb.update_vdev_ldb_ports(1, 1).unwrap();
    let before_vf = dlb.get_num_resources(Func::Vf(1)).unwrap();

    let args = CreateSchedDomainArgs {
        num_ldb_queues: 1,
        num_ldb_ports: 1,
        ..Default::default()
    };
    dlb.create_sched_domain(Func::Vf(1), &args).unwrap();
    dlb.create_sched_domain(Func::Pf, &args).unwrap();
    dlb.create_sched_domain(Func::Pf, &args).unwrap();

    dlb.resource_reset().unwrap();
    assert_eq!(dlb.get_num_resources(Func::Vf(1)).unwrap(), before_vf);
    dlb.reset_vdev_resources(1).unwrap();
    assert_eq!(dlb.get_num_resources(Func::Pf).unwrap(), before_pf);
    check_conservation(&dlb);
}

#[test]
fn port_placement_spreads_domains() {
    let (mut dlb, _sim) = manager(Limits::default());
    let a = CreateSchedDomainArgs {
        num_cos_ldb_ports: [1, 0, 0, 0],
        ..Default::default()
    };
    let b = CreateSchedDomainArgs {
        num_cos_ldb_ports: [2, 0, 0, 0],
        ..Default::default()
    };
    let da = dlb.create_sched_domain(Func::Pf, &a).unwrap();
    let db = dlb.create_sched_domain(Func::Pf, &b).unwrap();

    assert_eq!(dlb.domains[da as usize].avail_ldb_ports[0].to_vec(), vec![0]);
    // Port 1 sits beside domain A's port; port 2 would sit beside B's own.
    assert_eq!(
        dlb.domains[db as usize].avail_ldb_ports[0].to_vec(),
        vec![1, 7]
    );
}

#[test]
fn initial_port_order() {
    let (dlb, _sim) = manager(Limits::default());
    assert_eq!(
        dlb.pf.avail_ldb_ports[0].to_vec(),
        vec![0, 7, 14, 5, 12, 3, 10, 1, 8, 15, 6, 13, 4, 11, 2, 9]
    );
    assert_eq!(dlb.pf.avail_ldb_ports[2].front(), Some(32));
}

#[test]
fn cos_fallback() {
    let mut args = CreateSchedDomainArgs {
        num_cos_ldb_ports: [0, 0, 0, 5],
        cos_strict: true,
        ..Default::default()
    };
    let (mut dlb, _sim) = manager(small_limits());
    let err = dlb.create_sched_domain(Func::Pf, &args).unwrap_err();
    assert_eq!(err.status(), Some(Status::LdbPortsUnavailable));

    args.cos_strict = false;
    let d = dlb.create_sched_domain(Func::Pf, &args).unwrap();
    let dom = &dlb.domains[d as usize];
    assert_eq!(dom.avail_ldb_ports[3].count(), 4);
    assert_eq!(dom.avail_ldb_ports[0].count(), 1);
    let used = dlb.get_num_used_resources(Func::Pf).unwrap();
    assert_eq!(used.num_cos_ldb_ports, [1, 0, 0, 4]);
}

#[test]
fn sequence_number_groups() {
    let (mut dlb, sim) = manager(Limits::default());
    assert_eq!(dlb.get_group_sequence_numbers(0).unwrap(), 64);

    dlb.set_group_sequence_numbers(0, 512).unwrap();
    assert_eq!(dlb.get_group_sequence_numbers(0).unwrap(), 512);
    assert_eq!(sim.get(Reg::SnGroupMode(0)), 3);
    let err = dlb.set_group_sequence_numbers(0, 100).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(dlb.get_group_sequence_numbers(2).is_err());

    let args = CreateSchedDomainArgs {
        num_ldb_queues: 3,
        num_ldb_ports: 1,
        ..Default::default()
    };
    let domain =
        Id::Physical(dlb.create_sched_domain(Func::Pf, &args).unwrap());
    let ordered = CreateLdbQueueArgs {
        num_sequence_numbers: 512,
        num_qid_inflights: 512,
        ..Default::default()
    };
    dlb.create_ldb_queue(domain, &ordered).unwrap();
    dlb.create_ldb_queue(domain, &ordered).unwrap();
    let err = dlb.create_ldb_queue(domain, &ordered).unwrap_err();
    assert_eq!(err.status(), Some(Status::SequenceNumbersUnavailable));
    assert_eq!(dlb.get_group_sequence_number_occupancy(0).unwrap(), 2);

    let err = dlb.set_group_sequence_numbers(0, 64).unwrap_err();
    assert!(matches!(err, Error::Permission(Locked::SnGroup(0))));

    dlb.reset_domain(domain).unwrap();
    assert_eq!(dlb.get_group_sequence_number_occupancy(0).unwrap(), 0);
    dlb.set_group_sequence_numbers(0, 64).unwrap();
}

#[test]
fn cos_bandwidth() {
    let (mut dlb, sim) = manager(Limits::default());
    assert_eq!(dlb.get_cos_bandwidth(2).unwrap(), 25);

    let err = dlb.set_cos_bandwidth(0, 40).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(dlb.get_cos_bandwidth(0).unwrap(), 25);

    dlb.set_cos_bandwidth(1, 10).unwrap();
    dlb.set_cos_bandwidth(0, 40).unwrap();
    assert_eq!(dlb.get_cos_bandwidth(0).unwrap(), 40);
    assert_eq!(sim.get(Reg::CosBandwidth(0)), 102);

    let err = dlb.set_cos_bandwidth(4, 10).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidCosId));
    let err = dlb.get_cos_bandwidth(4).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidCosId));
    let err = dlb.set_cos_bandwidth(1, 101).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn vf_hist_list_reuses_own_entries() {
    let limits = Limits {
        num_hist_list_entries: 16,
        num_vdevs: 4,
        ..small_limits()
    };
    let (mut dlb, _sim) = manager(limits);

    dlb.update_vdev_hist_list_entries(3, 2).unwrap();
    dlb.update_vdev_hist_list_entries(1, 6).unwrap();
    dlb.update_vdev_hist_list_entries(2, 3).unwrap();
    dlb.update_vdev_hist_list_entries(1, 0).unwrap();
    // Free runs of 6 (next to VF3's entries) and 5.
    let ranges = |f: &FunctionResources| f.avail_hist_list_entries.set_ranges();
    assert_eq!(ranges(&dlb.pf), vec![(2, 6), (11, 5)]);
    assert_eq!(ranges(&dlb.vfs[3]), vec![(0, 2)]);

    dlb.update_vdev_hist_list_entries(3, 8).unwrap();
    assert_eq!(ranges(&dlb.vfs[3]), vec![(0, 8)]);
    assert_eq!(ranges(&dlb.pf), vec![(11, 5)]);

    let err = dlb.update_vdev_hist_list_entries(2, 9).unwrap_err();
    assert!(matches!(
        err,
        Error::Unavailable(Status::HistListEntriesUnavailable)
    ));
    assert_eq!(ranges(&dlb.vfs[2]), vec![(8, 3)]);
    check_conservation(&dlb);
}

#[test]
fn vf_port_assignment_spans_classes() {
    let (mut dlb, _sim) = manager(small_limits());
    dlb.update_vdev_ldb_ports(0, 6).unwrap();
    let vf = dlb.get_num_resources(Func::Vf(0)).unwrap();
    assert_eq!(vf.num_cos_ldb_ports, [4, 2, 0, 0]);
    let pf = dlb.get_num_resources(Func::Pf).unwrap();
    assert_eq!(pf.num_cos_ldb_ports, [0, 2, 4, 4]);

    dlb.update_vdev_ldb_ports(0, 1).unwrap();
    let vf = dlb.get_num_resources(Func::Vf(0)).unwrap();
    assert_eq!(vf.num_cos_ldb_ports, [0, 1, 0, 0]);

    let err = dlb.update_vdev_ldb_ports(1, 16).unwrap_err();
    assert_eq!(err.status(), Some(Status::LdbPortsUnavailable));
    let err = dlb.update_vdev_ldb_cos_ports(1, 4, 1).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidCosId));
    check_conservation(&dlb);
}

#[test]
fn vf_domain_assignment() {
    let (mut dlb, _sim) = manager(small_limits());
    dlb.update_vdev_sched_domains(0, 2).unwrap();
    assert_eq!(dlb.vfs[0].avail_domains.to_vec(), vec![0, 1]);
    assert_eq!(dlb.domains[1].parent, Func::Vf(0));

    dlb.update_vdev_ldb_credits(0, 100).unwrap();
    assert_eq!(dlb.pf.num_avail_ldb_credits, 300);
    let err = dlb.update_vdev_ldb_credits(1, 301).unwrap_err();
    assert!(matches!(err, Error::Unavailable(Status::LdbCreditsUnavailable)));
    // Shrinking returns the difference.
    dlb.update_vdev_ldb_credits(0, 40).unwrap();
    assert_eq!(dlb.pf.num_avail_ldb_credits, 360);

    dlb.update_vdev_sched_domains(0, 0).unwrap();
    assert_eq!(dlb.domains[1].parent, Func::Pf);
    assert_eq!(dlb.pf.avail_domains.to_vec(), vec![2, 3, 0, 1]);

    let err = dlb.update_vdev_sched_domains(2, 1).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    check_conservation(&dlb);
}

#[test]
fn locked_vf_refuses_updates() {
    let (mut dlb, _sim) = manager(small_limits());
    dlb.update_vdev_sched_domains(0, 1).unwrap();
    dlb.update_vdev_ldb_queues(0, 2).unwrap();
    dlb.lock_vdev(0).unwrap();
    assert!(dlb.vdev_is_locked(0).unwrap());
    assert!(!dlb.vdev_is_locked(1).unwrap());

    let pf = dlb.get_num_resources(Func::Pf).unwrap();
    let vf = dlb.get_num_resources(Func::Vf(0)).unwrap();
    let attempts: [fn(&mut Dlb2) -> Result<(), Error>; 10] = [
        |d| d.update_vdev_sched_domains(0, 0),
        |d| d.update_vdev_ldb_queues(0, 3),
        |d| d.update_vdev_ldb_ports(0, 1),
        |d| d.update_vdev_ldb_cos_ports(0, 2, 1),
        |d| d.update_vdev_dir_ports(0, 1),
        |d| d.update_vdev_ldb_credits(0, 1),
        |d| d.update_vdev_dir_credits(0, 1),
        |d| d.update_vdev_hist_list_entries(0, 1),
        |d| d.update_vdev_atomic_inflights(0, 1),
        |d| d.reset_vdev_resources(0),
    ];
    for attempt in attempts {
        let err = attempt(&mut dlb).unwrap_err();
        assert!(matches!(err, Error::Permission(Locked::Vf(0))));
    }
    assert_eq!(dlb.get_num_resources(Func::Pf).unwrap(), pf);
    assert_eq!(dlb.get_num_resources(Func::Vf(0)).unwrap(), vf);

    dlb.unlock_vdev(0).unwrap();
    dlb.update_vdev_ldb_queues(0, 3).unwrap();
}

#[test]
fn vf_ids_are_relative() {
    let (mut dlb, sim) = manager(Limits::default());
    dlb.update_vdev_sched_domains(1, 1).unwrap();
    dlb.update_vdev_ldb_queues(1, 2).unwrap();
    dlb.update_vdev_ldb_ports(1, 1).unwrap();
    dlb.update_vdev_dir_ports(1, 1).unwrap();
    dlb.update_vdev_hist_list_entries(1, 16).unwrap();
    dlb.lock_vdev(1).unwrap();

    let args = CreateSchedDomainArgs {
        num_ldb_queues: 2,
        num_ldb_ports: 1,
        num_dir_ports: 1,
        num_hist_list_entries: 16,
        ..Default::default()
    };
    let id = dlb.create_sched_domain(Func::Vf(1), &args).unwrap();
    assert_eq!(id, 0);
    let domain = Id::Virtual { vdev: 1, id };
    let phys = dlb.domain_from_id(domain).unwrap();
    assert_eq!(phys, 0);
    // VF ids don't leak into the PF's space and vice versa.
    assert_eq!(dlb.domain_from_id(Id::Virtual { vdev: 0, id: 0 }), None);

    let qargs = CreateLdbQueueArgs::default();
    assert_eq!(dlb.create_ldb_queue(domain, &qargs).unwrap(), 0);
    assert_eq!(dlb.create_ldb_queue(domain, &qargs).unwrap(), 1);
    let pargs = CreateLdbPortArgs {
        cq_depth: 8,
        cq_history_list_size: 16,
        ..Default::default()
    };
    let port = dlb.create_ldb_port(domain, &pargs, CQ_BASE).unwrap();
    assert_eq!(port, 0);
    let dargs = CreateDirPortArgs { cq_depth: 8, queue_id: None };
    let dport = dlb.create_dir_port(domain, &dargs, CQ_BASE).unwrap();
    assert_eq!(dport, 0);

    let map = MapQidArgs { port_id: 0, qid: 1, priority: 2 };
    assert_eq!(dlb.map_qid(domain, &map).unwrap(), MapOutcome::Complete);

    dlb.start_domain(domain).unwrap();
    sim.set(Reg::VfLdbVppValid { vdev: 1, vpp: 0 }, 1);
    sim.set(Reg::VfDirVppValid { vdev: 1, vpp: 0 }, 1);
    dlb.reset_vdev(1).unwrap();
    assert_eq!(sim.get(Reg::VfLdbVppValid { vdev: 1, vpp: 0 }), 0);
    assert_eq!(sim.get(Reg::VfDirVppValid { vdev: 1, vpp: 0 }), 0);

    let vf = dlb.get_num_resources(Func::Vf(1)).unwrap();
    assert_eq!(vf.num_sched_domains, 1);
    assert_eq!(vf.num_ldb_queues, 2);
    assert_eq!(vf.num_hist_list_entries, 16);
    check_conservation(&dlb);
}

#[test]
fn mailbox_requests() {
    let (mut dlb, _sim) = manager(Limits::default());
    let err = dlb.notify_vf(0, VfNotification::PreReset).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let mbox = Arc::new(Loopback::new());
    let policy =
        MboxPolicy { retries: 3, poll_interval: Duration::from_micros(10) };
    dlb.set_mailbox(mbox.clone(), policy);

    dlb.notify_vf(2, VfNotification::PreReset).unwrap();
    dlb.notify_vf_alarm(2, 1, 7, 9).unwrap();
    assert_eq!(
        mbox.received(2),
        vec![
            VfRequest::Notification(VfNotification::PreReset),
            VfRequest::DomainAlert {
                domain_id: 1,
                alert_id: 7,
                aux_alert_data: 9
            },
        ]
    );

    mbox.set_in_use(4, true);
    assert!(dlb.vdev_in_use(4).unwrap());
    assert!(!dlb.vdev_in_use(5).unwrap());

    mbox.set_mute(1, true);
    let err = dlb.vdev_in_use(1).unwrap_err();
    assert!(matches!(err, Error::Timeout(1)));
    let err = dlb.notify_vf(1, VfNotification::PostReset).unwrap_err();
    assert!(matches!(err, Error::Timeout(1)));

    let err = dlb.notify_vf(16, VfNotification::PostReset).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn limits_validation() {
    let bad = [
        Limits { num_ldb_ports: 0, ..Default::default() },
        Limits { num_ldb_ports: 18, ..Default::default() },
        Limits { num_ldb_ports: 128, ..Default::default() },
        Limits { num_vdevs: 17, ..Default::default() },
        Limits { qid_empty_check_loops: 0, ..Default::default() },
    ];
    for limits in bad {
        let res = Dlb2::new(logger(), limits, Arc::new(SimDevice::new()));
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }
}

/// Operations driven against the device in randomized sequences.
#[derive(Clone, Debug)]
enum Op {
    Create { owner: Option<u8>, args: CreateSchedDomainArgs },
    Reset(usize),
    Assign { vdev: u8, kind: u8, num: u32 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let args = (
        0u32..3,
        prop::array::uniform4(0u32..3),
        0u32..3,
        any::<bool>(),
        0u32..3,
        0u32..150,
        0u32..40,
        0u32..20,
        0u32..24,
    )
        .prop_map(|(q, cos, any, strict, dir, lc, dc, aq, hist)| {
            CreateSchedDomainArgs {
                num_ldb_queues: q,
                num_ldb_ports: any,
                num_cos_ldb_ports: cos,
                cos_strict: strict,
                num_dir_ports: dir,
                num_atomic_inflights: aq,
                num_hist_list_entries: hist,
                num_ldb_credits: lc,
                num_dir_credits: dc,
            }
        });
    prop_oneof![
        (prop::option::of(0u8..2), args)
            .prop_map(|(owner, args)| Op::Create { owner, args }),
        (0usize..4).prop_map(Op::Reset),
        (0u8..2, 0u8..9, 0u32..20)
            .prop_map(|(vdev, kind, num)| Op::Assign { vdev, kind, num }),
    ]
}

fn apply(dlb: &mut Dlb2, op: &Op) {
    // Rejections are expected; faults are not.
    let res = match op {
        Op::Create { owner, args } => {
            let func = owner.map(Func::Vf).unwrap_or(Func::Pf);
            dlb.create_sched_domain(func, args).map(|_| ())
        }
        Op::Reset(n) => {
            let configured: Vec<u32> = (0..dlb.domains.len() as u32)
                .filter(|&d| dlb.domains[d as usize].configured)
                .collect();
            match configured.get(*n) {
                Some(&d) => dlb.reset_domain(Id::Physical(d)),
                None => Ok(()),
            }
        }
        Op::Assign { vdev, kind, num } => {
            let (v, n) = (*vdev, *num);
            match kind {
                0 => dlb.update_vdev_sched_domains(v, n % 3),
                1 => dlb.update_vdev_ldb_queues(v, n % 4),
                2 => dlb.update_vdev_ldb_ports(v, n % 8),
                3 => dlb.update_vdev_dir_ports(v, n % 4),
                4 => dlb.update_vdev_ldb_credits(v, n * 10),
                5 => dlb.update_vdev_dir_credits(v, n * 3),
                6 => dlb.update_vdev_atomic_inflights(v, n),
                7 => dlb.update_vdev_hist_list_entries(v, n),
                _ => dlb.update_vdev_ldb_cos_ports(v, (n % 4) as u8, n % 3),
            }
        }
    };
    if let Err(e) = res {
        assert!(
            matches!(e, Error::Unavailable(_) | Error::Invalid(_)),
            "{op:?}: {e}"
        );
    }
}

proptest! {
    #[test]
    fn resources_are_conserved(
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let (mut dlb, _sim) = manager(small_limits());
        for op in &ops {
            apply(&mut dlb, op);
            check_conservation(&dlb);
        }
    }

    #[test]
    fn create_then_reset_round_trips(
        ops in prop::collection::vec(op_strategy(), 0..20),
        args in op_strategy(),
    ) {
        let (mut dlb, _sim) = manager(small_limits());
        for op in &ops {
            apply(&mut dlb, op);
        }
        let Op::Create { owner, args } = args else {
            return Ok(());
        };
        let func = owner.map(Func::Vf).unwrap_or(Func::Pf);
        let before = dlb.get_num_resources(func).unwrap();
        let bitmap = dlb.rsrcs(func).unwrap().avail_hist_list_entries.clone();

        if let Ok(id) = dlb.create_sched_domain(func, &args) {
            // Unlocked VFs are handed physical ids.
            dlb.reset_domain(Id::Physical(id)).unwrap();
            prop_assert_eq!(dlb.get_num_resources(func).unwrap(), before);
            prop_assert_eq!(
                &dlb.rsrcs(func).unwrap().avail_hist_list_entries,
                &bitmap
            );
        } else {
            prop_assert_eq!(dlb.get_num_resources(func).unwrap(), before);
        }
    }
}
