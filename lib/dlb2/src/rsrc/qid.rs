// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queue-to-port mapping.
//!
//! Each load-balanced port has [QIDS_PER_LDB_CQ] slots, each of which binds
//! one queue to the port's CQ at some priority.  In a domain which has not
//! been started a slot is programmed directly.  Once traffic may be flowing,
//! adding a mapping must wait for the queue's inflight events to complete,
//! and removing one must wait for the port's outstanding completions.  Those
//! waits are modelled by the in-progress slot states, which the maintenance
//! passes ([Dlb2::finish_map_qid_procedures] and
//! [Dlb2::finish_unmap_qid_procedures]) drive to completion.

use super::{Dlb2, MapOutcome, MapQidArgs, UnmapQidArgs};
use crate::hw::regs::{slot_map, Reg};
use crate::id::Id;
use crate::status::{Error, Status};
use crate::NUM_QID_PRIORITIES;

/// A mapping queued behind the removal of a slot's current queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingMap {
    pub qid: u32,
    pub priority: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::IntoStaticStr)]
pub enum SlotState {
    #[default]
    Unmapped,
    Mapped,
    /// Waiting for the queue's inflight count to reach zero
    MapInProg,
    /// Waiting for the port's CQ inflight count to reach zero, after which
    /// `pending` (if any) is mapped into the freed slot
    UnmapInProg { pending: Option<PendingMap> },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QidSlot {
    pub qid: u32,
    pub priority: u8,
    pub state: SlotState,
}

impl QidSlot {
    fn holds(&self, qid: u32, state: SlotState) -> bool {
        self.qid == qid && self.state == state
    }

    fn pending_qid(&self) -> Option<u32> {
        match self.state {
            SlotState::UnmapInProg { pending: Some(pm) } => Some(pm.qid),
            _ => None,
        }
    }
}

/// Counter adjustments implied by one slot transition.
#[derive(Default)]
struct Delta {
    queue_map: i32,
    port_map: i32,
    queue_add: i32,
    domain_add: i32,
    port_rem: i32,
    domain_rem: i32,
}

impl Delta {
    fn between(from: SlotState, to: SlotState) -> Option<Delta> {
        use SlotState::*;
        let d = match (from, to) {
            (Unmapped, Mapped) => {
                Delta { queue_map: 1, port_map: 1, ..Default::default() }
            }
            (Unmapped, MapInProg) => {
                Delta { queue_add: 1, domain_add: 1, ..Default::default() }
            }
            (Mapped, Unmapped) => {
                Delta { queue_map: -1, port_map: -1, ..Default::default() }
            }
            (Mapped, UnmapInProg { pending: None }) => {
                Delta { port_rem: 1, domain_rem: 1, ..Default::default() }
            }
            (Mapped, Mapped) => Delta::default(),
            (MapInProg, Unmapped) => {
                Delta { queue_add: -1, domain_add: -1, ..Default::default() }
            }
            (MapInProg, Mapped) => Delta {
                queue_map: 1,
                port_map: 1,
                queue_add: -1,
                domain_add: -1,
                ..Default::default()
            },
            (UnmapInProg { .. }, Unmapped) => Delta {
                queue_map: -1,
                port_map: -1,
                port_rem: -1,
                domain_rem: -1,
                ..Default::default()
            },
            (UnmapInProg { pending: None }, Mapped) => {
                Delta { port_rem: -1, domain_rem: -1, ..Default::default() }
            }
            (
                UnmapInProg { pending: None },
                UnmapInProg { pending: Some(_) },
            )
            | (
                UnmapInProg { pending: Some(_) },
                UnmapInProg { pending: None },
            ) => Delta::default(),
            _ => return None,
        };
        Some(d)
    }
}

fn adjust(val: u32, delta: i32) -> Option<u32> {
    val.checked_add_signed(delta)
}

impl Dlb2 {
    /// Move a slot to `to`, keeping the mapping and pending counters of its
    /// queue, port and domain in step.
    fn slot_transition(
        &mut self,
        p: u32,
        slot: usize,
        to: SlotState,
    ) -> Result<(), Error> {
        let port = &self.ldb_ports[p as usize];
        let from = port.qid_map[slot].state;
        let q = port.qid_map[slot].qid;
        let Some(d) = port.domain else {
            return Err(self.fault(format!("port {p} has no domain")));
        };
        let Some(delta) = Delta::between(from, to) else {
            let from: &'static str = from.into();
            let to: &'static str = to.into();
            return Err(self.fault(format!(
                "port {p} slot {slot}: invalid transition {from} -> {to}"
            )));
        };

        let queue = &self.ldb_queues[q as usize];
        let domain = &self.domains[d as usize];
        let updated = (|| {
            Some((
                adjust(queue.num_mappings, delta.queue_map)?,
                adjust(queue.num_pending_additions, delta.queue_add)?,
                adjust(port.num_mappings, delta.port_map)?,
                adjust(port.num_pending_removals, delta.port_rem)?,
                adjust(domain.num_pending_additions, delta.domain_add)?,
                adjust(domain.num_pending_removals, delta.domain_rem)?,
            ))
        })();
        let Some((q_map, q_add, p_map, p_rem, d_add, d_rem)) = updated else {
            return Err(self.fault(format!(
                "port {p} slot {slot}: mapping counters out of range"
            )));
        };

        let queue = &mut self.ldb_queues[q as usize];
        queue.num_mappings = q_map;
        queue.num_pending_additions = q_add;
        let port = &mut self.ldb_ports[p as usize];
        port.num_mappings = p_map;
        port.num_pending_removals = p_rem;
        port.qid_map[slot].state = to;
        let domain = &mut self.domains[d as usize];
        domain.num_pending_additions = d_add;
        domain.num_pending_removals = d_rem;
        Ok(())
    }

    fn find_slot(&self, p: u32, q: u32, state: SlotState) -> Option<usize> {
        self.ldb_ports[p as usize]
            .qid_map
            .iter()
            .position(|s| s.holds(q, state))
    }

    fn find_free_slot(&self, p: u32, state: SlotState) -> Option<usize> {
        self.ldb_ports[p as usize]
            .qid_map
            .iter()
            .position(|s| s.state == state)
    }

    /// Is `q` being removed from a slot already promised to another queue?
    fn find_handed_over_slot(&self, p: u32, q: u32) -> Option<usize> {
        self.ldb_ports[p as usize].qid_map.iter().position(|s| {
            s.qid == q && s.pending_qid().is_some()
        })
    }

    fn find_pending_map_slot(&self, p: u32, q: u32) -> Option<usize> {
        self.ldb_ports[p as usize]
            .qid_map
            .iter()
            .position(|s| s.pending_qid() == Some(q))
    }

    /// Program a slot for `q` and mark it mapped.
    fn map_qid_static(
        &mut self,
        p: u32,
        q: u32,
        prio: u8,
    ) -> Result<(), Error> {
        let slot = self
            .find_slot(p, q, SlotState::MapInProg)
            .or_else(|| self.find_slot(p, q, SlotState::Mapped))
            .or_else(|| self.find_free_slot(p, SlotState::Unmapped));
        let Some(slot) = slot else {
            return Err(self.fault(format!("port {p}: no slot to map {q}")));
        };

        self.hw.write(
            Reg::LdbCqSlotMap { port: p, slot: slot as u8 },
            slot_map::encode(q, prio),
        );
        self.hw.update_bits(Reg::LdbQidCqIdx(q), 1u64 << p, true);

        let entry = &mut self.ldb_ports[p as usize].qid_map[slot];
        entry.qid = q;
        entry.priority = prio;
        self.slot_transition(p, slot, SlotState::Mapped)
    }

    /// Remove a mapped or unmapping slot from the port's tables and mark it
    /// unmapped.
    pub(super) fn unmap_qid_static(
        &mut self,
        p: u32,
        slot: usize,
    ) -> Result<(), Error> {
        let entry = self.ldb_ports[p as usize].qid_map[slot];
        if !matches!(
            entry.state,
            SlotState::Mapped | SlotState::UnmapInProg { .. }
        ) {
            return Err(self.fault(format!("port {p} slot {slot}: not mapped")));
        }
        let q = entry.qid;

        self.hw.update_bits(
            Reg::LdbCqSlotMap { port: p, slot: slot as u8 },
            slot_map::VALID,
            false,
        );
        self.hw.update_bits(Reg::LdbQidCqIdx(q), 1u64 << p, false);
        self.slot_transition(p, slot, SlotState::Unmapped)
    }

    fn set_inflight_limit(&self, q: u32) {
        let limit = self.ldb_queues[q as usize].num_qid_inflights;
        self.hw.write(Reg::LdbQidInflightLimit(q), limit.into());
    }

    fn clear_inflight_limit(&self, q: u32) {
        self.hw.write(Reg::LdbQidInflightLimit(q), 0);
    }

    /// Used ports of the domain which have `q` mapped.
    fn mapped_ports(&self, d: u32, q: u32) -> Vec<(u32, usize)> {
        self.domains[d as usize]
            .used_ldb_port_ids()
            .into_iter()
            .filter_map(|p| {
                self.find_slot(p, q, SlotState::Mapped).map(|s| (p, s))
            })
            .collect()
    }

    fn disable_mapped_cqs(&self, d: u32, q: u32) {
        for (p, _) in self.mapped_ports(d, q) {
            if self.ldb_ports[p as usize].enabled {
                self.ldb_port_cq_disable(p);
            }
        }
    }

    fn enable_mapped_cqs(&self, d: u32, q: u32) {
        for (p, _) in self.mapped_ports(d, q) {
            if self.ldb_ports[p as usize].enabled {
                self.ldb_port_cq_enable(p);
            }
        }
    }

    fn set_has_work(&self, p: u32, slot: usize, set: bool) {
        self.hw.update_bits(Reg::LdbCqHasWork(p), 1u64 << slot, set);
    }

    fn set_if_status(&self, p: u32, slot: usize, set: bool) {
        self.hw.update_bits(Reg::LdbCqInflightOk(p), 1u64 << slot, set);
    }

    /// Complete a dynamic mapping whose queue has no inflight events.
    fn finish_map_qid_dynamic(
        &mut self,
        d: u32,
        p: u32,
        q: u32,
    ) -> Result<(), Error> {
        let infl = self.hw.ldb_queue_inflight_count(q);
        if infl != 0 {
            return Err(self.fault(format!(
                "queue {q} has {infl} inflights at map completion"
            )));
        }
        let Some(slot) = self.find_slot(p, q, SlotState::MapInProg) else {
            return Err(self.fault(format!("port {p}: no map in progress")));
        };
        let prio = self.ldb_ports[p as usize].qid_map[slot].priority;

        self.map_qid_static(p, q, prio)?;

        self.set_has_work(p, slot, true);
        // The slot must not look inflight before the CQ is re-enabled.
        self.set_if_status(p, slot, false);
        for (port, s) in self.mapped_ports(d, q) {
            self.set_if_status(port, s, true);
        }

        self.set_inflight_limit(q);
        self.enable_mapped_cqs(d, q);

        if self.ldb_queues[q as usize].num_pending_additions > 0 {
            self.clear_inflight_limit(q);
        }
        slog::debug!(self.log, "dynamic map complete"; "port" => p, "qid" => q);
        Ok(())
    }

    pub(super) fn map_qid_dynamic(
        &mut self,
        d: u32,
        p: u32,
        q: u32,
        prio: u8,
    ) -> Result<MapOutcome, Error> {
        // Stop further scheduling from the queue.
        self.clear_inflight_limit(q);

        let Some(slot) = self.find_free_slot(p, SlotState::Unmapped) else {
            return Err(self.fault(format!("port {p}: no unmapped slot")));
        };
        let entry = &mut self.ldb_ports[p as usize].qid_map[slot];
        entry.qid = q;
        entry.priority = prio;
        self.slot_transition(p, slot, SlotState::MapInProg)?;

        if self.hw.ldb_queue_inflight_count(q) != 0 {
            self.worker.schedule();
            return Ok(MapOutcome::Pending);
        }

        // Quiesce every CQ the queue can reach, then look again: the queue
        // may have scheduled one more event before the first read.
        let enabled = self.ldb_ports[p as usize].enabled;
        if enabled {
            self.ldb_port_cq_disable(p);
        }
        self.disable_mapped_cqs(d, q);

        if self.hw.ldb_queue_inflight_count(q) != 0 {
            if enabled {
                self.ldb_port_cq_enable(p);
            }
            self.enable_mapped_cqs(d, q);
            self.worker.schedule();
            return Ok(MapOutcome::Pending);
        }

        self.finish_map_qid_dynamic(d, p, q)?;
        Ok(MapOutcome::Complete)
    }

    fn ldb_port_map_qid(
        &mut self,
        d: u32,
        p: u32,
        q: u32,
        prio: u8,
    ) -> Result<MapOutcome, Error> {
        if self.domains[d as usize].started {
            self.map_qid_dynamic(d, p, q, prio)
        } else {
            self.map_qid_static(p, q, prio)?;
            Ok(MapOutcome::Complete)
        }
    }

    /// Resolve and validate the objects named by a map request.
    fn verify_map_qid(
        &self,
        domain: Id,
        args: &MapQidArgs,
    ) -> Result<(u32, u32, u32), Status> {
        let d = self.configured_domain(domain)?;
        let p = self
            .domain_ldb_port(d, domain.sibling(args.port_id))
            .filter(|&p| self.ldb_ports[p as usize].configured)
            .ok_or(Status::InvalidPortId)?;
        if args.priority >= NUM_QID_PRIORITIES {
            return Err(Status::InvalidPriority);
        }
        let q = self
            .domain_used_ldb_queue(d, domain.sibling(args.qid))
            .filter(|&q| self.ldb_queues[q as usize].configured)
            .ok_or(Status::InvalidQid)?;
        Ok((d, p, q))
    }

    /// Can the port take (or already hold) a mapping for `q`?
    fn verify_map_qid_slot_available(
        &self,
        p: u32,
        q: u32,
    ) -> Result<(), Status> {
        let port = &self.ldb_ports[p as usize];
        let holds_queue = port.qid_map.iter().any(|s| {
            s.holds(q, SlotState::Mapped)
                || s.holds(q, SlotState::MapInProg)
                || s.pending_qid() == Some(q)
        });
        let has_room = port.qid_map.iter().any(|s| {
            matches!(
                s.state,
                SlotState::Unmapped | SlotState::UnmapInProg { pending: None }
            )
        });
        if holds_queue || has_room {
            Ok(())
        } else {
            Err(Status::NoQidSlotsAvailable)
        }
    }

    fn verify_unmap_qid(
        &self,
        domain: Id,
        args: &UnmapQidArgs,
    ) -> Result<(u32, u32, u32), Status> {
        let d = self.configured_domain(domain)?;
        let p = self
            .domain_ldb_port(d, domain.sibling(args.port_id))
            .filter(|&p| self.ldb_ports[p as usize].configured)
            .ok_or(Status::InvalidPortId)?;
        let q = self
            .domain_used_ldb_queue(d, domain.sibling(args.qid))
            .filter(|&q| self.ldb_queues[q as usize].configured)
            .ok_or(Status::InvalidQid)?;

        // A queue counts as mapped from the requester's point of view while
        // its map is in progress or held behind another unmap.
        let mapped = self.find_slot(p, q, SlotState::Mapped).is_some()
            || self.find_slot(p, q, SlotState::MapInProg).is_some()
            || self.find_pending_map_slot(p, q).is_some();
        if !mapped {
            return Err(Status::InvalidQid);
        }
        Ok((d, p, q))
    }

    /// Map a load-balanced queue to a port's CQ at the given priority.
    ///
    /// Remapping a queue which is already mapped (or on its way to being
    /// mapped) only updates its priority.  In a started domain the mapping
    /// may be left in progress, in which case [MapOutcome::Pending] is
    /// returned and the worker is asked to schedule a maintenance pass.
    pub fn map_qid(
        &mut self,
        domain: Id,
        args: &MapQidArgs,
    ) -> Result<MapOutcome, Error> {
        slog::debug!(self.log, "map qid";
            "domain" => %domain, "port" => args.port_id,
            "qid" => args.qid, "priority" => args.priority);

        let (d, p, q) = self
            .verify_map_qid(domain, args)
            .map_err(|st| self.rejected("map_qid", st))?;
        let prio = args.priority;

        // Completing outstanding removals may free a slot.
        if self.ldb_ports[p as usize].num_pending_removals > 0 {
            self.finish_unmap_port(d, p)?;
        }

        // The queue's removal is committed once its slot has been promised
        // to another queue, and a port may hold a queue only once.
        if let Some(slot) = self.find_handed_over_slot(p, q) {
            slog::debug!(self.log, "request rejected";
                "op" => "map_qid", "port" => p, "slot" => slot, "qid" => q);
            return Err(Error::InvalidArgument(
                "queue is being unmapped from the port",
            ));
        }

        self.verify_map_qid_slot_available(p, q)
            .map_err(|st| self.rejected("map_qid", st))?;

        let enabled = self.ldb_ports[p as usize].enabled;
        if enabled {
            self.ldb_port_cq_disable(p);
        }

        let outcome = self.map_qid_slot(d, p, q, prio)?;

        if enabled {
            self.ldb_port_cq_enable(p);
        }
        Ok(outcome)
    }

    fn change_slot_priority(&mut self, p: u32, slot: usize, prio: u8) {
        let entry = &mut self.ldb_ports[p as usize].qid_map[slot];
        if entry.priority == prio {
            return;
        }
        entry.priority = prio;
        let q = entry.qid;
        self.hw.write(
            Reg::LdbCqSlotMap { port: p, slot: slot as u8 },
            slot_map::encode(q, prio),
        );
    }

    fn map_qid_slot(
        &mut self,
        d: u32,
        p: u32,
        q: u32,
        prio: u8,
    ) -> Result<MapOutcome, Error> {
        if let Some(slot) = self.find_slot(p, q, SlotState::Mapped) {
            self.change_slot_priority(p, slot, prio);
            self.slot_transition(p, slot, SlotState::Mapped)?;
            return Ok(MapOutcome::Complete);
        }

        // Cancel an unmap of this very queue, keeping the new priority.
        let unmapping = SlotState::UnmapInProg { pending: None };
        if let Some(slot) = self.find_slot(p, q, unmapping) {
            self.change_slot_priority(p, slot, prio);
            self.slot_transition(p, slot, SlotState::Mapped)?;
            return Ok(MapOutcome::Complete);
        }

        if let Some(slot) = self.find_slot(p, q, SlotState::MapInProg) {
            self.ldb_ports[p as usize].qid_map[slot].priority = prio;
            return Ok(MapOutcome::Pending);
        }

        if let Some(slot) = self.find_pending_map_slot(p, q) {
            let pending = Some(PendingMap { qid: q, priority: prio });
            self.ldb_ports[p as usize].qid_map[slot].state =
                SlotState::UnmapInProg { pending };
            return Ok(MapOutcome::Pending);
        }

        // With every slot occupied the mapping rides on an unmap in
        // progress, taking over its slot once the unmap finishes.
        if self.find_free_slot(p, SlotState::Unmapped).is_none() {
            let Some(slot) = self.find_free_slot(p, unmapping) else {
                return Err(self.fault(format!("port {p}: no slot to borrow")));
            };
            let pending = Some(PendingMap { qid: q, priority: prio });
            self.slot_transition(p, slot, SlotState::UnmapInProg { pending })?;
            return Ok(MapOutcome::Pending);
        }

        self.ldb_port_map_qid(d, p, q, prio)
    }

    /// Remove a load-balanced queue's mapping from a port's CQ.
    ///
    /// A mapping still in progress is abandoned immediately.  An established
    /// mapping requires the port's outstanding completions to drain first;
    /// if they have not, [MapOutcome::Pending] is returned and the worker is
    /// asked to schedule a maintenance pass.
    pub fn unmap_qid(
        &mut self,
        domain: Id,
        args: &UnmapQidArgs,
    ) -> Result<MapOutcome, Error> {
        slog::debug!(self.log, "unmap qid";
            "domain" => %domain, "port" => args.port_id, "qid" => args.qid);

        let (d, p, q) = self
            .verify_unmap_qid(domain, args)
            .map_err(|st| self.rejected("unmap_qid", st))?;

        if let Some(slot) = self.find_slot(p, q, SlotState::MapInProg) {
            self.slot_transition(p, slot, SlotState::Unmapped)?;
            // Aborting the map re-enables the queue's scheduling, unless
            // another port is still waiting to map it.
            if self.ldb_queues[q as usize].num_pending_additions == 0 {
                self.set_inflight_limit(q);
            }
            return Ok(MapOutcome::Complete);
        }

        if let Some(slot) = self.find_pending_map_slot(p, q) {
            let unmapping = SlotState::UnmapInProg { pending: None };
            self.slot_transition(p, slot, unmapping)?;
            return Ok(MapOutcome::Complete);
        }

        let Some(slot) = self.find_slot(p, q, SlotState::Mapped) else {
            return Err(self.fault(format!("port {p}: {q} not mapped")));
        };

        self.ldb_port_cq_disable(p);
        let unmapping = SlotState::UnmapInProg { pending: None };
        self.slot_transition(p, slot, unmapping)?;

        if self.finish_unmap_port(d, p)? {
            Ok(MapOutcome::Complete)
        } else {
            self.worker.schedule();
            Ok(MapOutcome::Pending)
        }
    }

    fn finish_unmap_port_slot(
        &mut self,
        d: u32,
        p: u32,
        slot: usize,
    ) -> Result<(), Error> {
        let entry = self.ldb_ports[p as usize].qid_map[slot];

        self.unmap_qid_static(p, slot)?;
        self.set_has_work(p, slot, false);
        self.set_if_status(p, slot, true);

        if self.ldb_ports[p as usize].enabled {
            self.ldb_port_cq_enable(p);
        }

        if let SlotState::UnmapInProg { pending: Some(pm) } = entry.state {
            let entry = &mut self.ldb_ports[p as usize].qid_map[slot];
            entry.qid = pm.qid;
            entry.priority = pm.priority;
            self.ldb_port_map_qid(d, p, pm.qid, pm.priority)?;
        }
        Ok(())
    }

    /// Finish every unmap on the port if its CQ has no inflight events.
    ///
    /// Returns whether the port's removals were processed.
    pub(super) fn finish_unmap_port(
        &mut self,
        d: u32,
        p: u32,
    ) -> Result<bool, Error> {
        if self.ldb_ports[p as usize].num_pending_removals == 0 {
            return Ok(false);
        }
        if self.hw.ldb_cq_inflight_count(p) > 0 {
            return Ok(false);
        }
        for slot in 0..self.ldb_ports[p as usize].qid_map.len() {
            let state = self.ldb_ports[p as usize].qid_map[slot].state;
            if matches!(state, SlotState::UnmapInProg { .. }) {
                self.finish_unmap_port_slot(d, p, slot)?;
            }
        }
        Ok(true)
    }

    /// Finish every map on the port whose queue has no inflight events.
    pub(super) fn finish_map_port(
        &mut self,
        d: u32,
        p: u32,
    ) -> Result<(), Error> {
        for slot in 0..self.ldb_ports[p as usize].qid_map.len() {
            let entry = self.ldb_ports[p as usize].qid_map[slot];
            if entry.state != SlotState::MapInProg {
                continue;
            }
            let q = entry.qid;
            if self.hw.ldb_queue_inflight_count(q) != 0 {
                continue;
            }

            let enabled = self.ldb_ports[p as usize].enabled;
            if enabled {
                self.ldb_port_cq_disable(p);
            }
            self.disable_mapped_cqs(d, q);

            if self.hw.ldb_queue_inflight_count(q) != 0 {
                if enabled {
                    self.ldb_port_cq_enable(p);
                }
                self.enable_mapped_cqs(d, q);
                continue;
            }

            self.finish_map_qid_dynamic(d, p, q)?;
        }
        Ok(())
    }

    /// Advance the domain's pending unmaps, returning how many remain.
    pub(super) fn domain_finish_unmap_qid_procedures(
        &mut self,
        d: u32,
    ) -> Result<u32, Error> {
        let domain = &self.domains[d as usize];
        if !domain.configured || domain.num_pending_removals == 0 {
            return Ok(0);
        }
        for p in domain.used_ldb_port_ids() {
            self.finish_unmap_port(d, p)?;
        }
        Ok(self.domains[d as usize].num_pending_removals)
    }

    /// Advance the domain's pending maps, returning how many remain.
    pub(super) fn domain_finish_map_qid_procedures(
        &mut self,
        d: u32,
    ) -> Result<u32, Error> {
        let domain = &self.domains[d as usize];
        if !domain.configured || domain.num_pending_additions == 0 {
            return Ok(0);
        }
        for p in domain.used_ldb_port_ids() {
            self.finish_map_port(d, p)?;
        }
        Ok(self.domains[d as usize].num_pending_additions)
    }

    /// Complete whatever queue unmaps the hardware now permits.
    ///
    /// Returns the number of unmaps still outstanding across the device.
    pub fn finish_unmap_qid_procedures(&mut self) -> Result<u32, Error> {
        let mut remaining = 0;
        for d in 0..self.domains.len() as u32 {
            remaining += self.domain_finish_unmap_qid_procedures(d)?;
        }
        Ok(remaining)
    }

    /// Complete whatever queue maps the hardware now permits.
    ///
    /// Returns the number of maps still outstanding across the device.
    pub fn finish_map_qid_procedures(&mut self) -> Result<u32, Error> {
        let mut remaining = 0;
        for d in 0..self.domains.len() as u32 {
            remaining += self.domain_finish_map_qid_procedures(d)?;
        }
        Ok(remaining)
    }

    /// Unmaps outstanding on one of a domain's ports.
    pub fn pending_port_unmaps(
        &self,
        domain: Id,
        port_id: u32,
    ) -> Result<u32, Error> {
        let d = self
            .domain_from_id(domain)
            .ok_or(Status::InvalidDomainId)
            .map_err(|st| self.rejected("pending_port_unmaps", st))?;
        let p = self
            .domain_ldb_port(d, domain.sibling(port_id))
            .filter(|&p| self.ldb_ports[p as usize].configured)
            .ok_or(Status::InvalidPortId)
            .map_err(|st| self.rejected("pending_port_unmaps", st))?;
        Ok(self.ldb_ports[p as usize].num_pending_removals)
    }
}
