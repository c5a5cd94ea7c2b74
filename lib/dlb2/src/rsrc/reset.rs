// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling domain reset.
//!
//! Resetting a domain quiesces its hardware, drains every event still held
//! by its queues and consumer queues, completes any outstanding queue map
//! and unmap procedures, and finally returns each of its resources to the
//! function which owns the domain.  The ordering of the steps in
//! [Dlb2::reset_domain_phys] matters: maps and unmaps can only finish once
//! the CQs have been drained, and the queues can only be drained while the
//! CQs are enabled.

use super::{Dlb2, HistList, SlotState};
use crate::hw::regs::Reg;
use crate::hw::{Hcw, ProducerPort};
use crate::id::{Func, Id};
use crate::status::Error;
use crate::QIDS_PER_LDB_CQ;

/// Clamp a token count into a control word's lock id field.
fn lock_id_for(tokens: u32) -> u16 {
    u16::try_from(tokens.saturating_sub(1)).unwrap_or(u16::MAX)
}

impl Dlb2 {
    /// Tokens held by a load-balanced CQ, less its initial padding.
    fn ldb_cq_tokens(&self, p: u32) -> u32 {
        let init = self.ldb_ports[p as usize].init_tkn_cnt;
        self.hw.ldb_cq_token_count(p).saturating_sub(init)
    }

    fn dir_cq_tokens(&self, pq: u32) -> u32 {
        let init = self.dir_pqs[pq as usize].init_tkn_cnt;
        self.hw.dir_cq_token_count(pq).saturating_sub(init)
    }

    fn ldb_queue_is_empty(&self, q: u32) -> bool {
        self.hw.ldb_queue_depth(q) == 0
            && self.hw.ldb_queue_inflight_count(q) == 0
    }

    /// Reset a configured scheduling domain.
    ///
    /// The owner must have stopped enqueueing to the domain's producer ports
    /// beforehand.
    pub fn reset_domain(&mut self, domain: Id) -> Result<(), Error> {
        let d = self
            .configured_domain(domain)
            .map_err(|st| self.rejected("reset_domain", st))?;
        self.reset_domain_phys(d)?;
        slog::info!(self.log, "reset sched domain";
            "domain" => %domain, "phys_id" => d);
        Ok(())
    }

    pub(super) fn reset_domain_phys(&mut self, d: u32) -> Result<(), Error> {
        slog::debug!(self.log, "resetting sched domain"; "phys_id" => d);

        if let Func::Vf(vdev) = self.domains[d as usize].parent {
            self.disable_vpps(d, vdev);
        }
        self.disable_cq_interrupts(d);
        self.disable_write_perms(d);
        for p in self.domains[d as usize].used_ldb_port_ids() {
            self.hw.write(Reg::LdbCqSeqCheck(p), 0);
        }

        // Map and unmap completion wait on zero CQ and queue inflights.
        self.disable_ldb_cqs(d);
        self.drain_ldb_cqs(d, false);
        self.wait_for_ldb_cqs_to_empty(d)?;
        self.domain_finish_unmap_qid_procedures(d)?;
        self.domain_finish_map_qid_procedures(d)?;

        self.enable_ldb_cqs(d);
        self.drain_mapped_queues(d)?;
        self.drain_unmapped_queues(d)?;
        self.disable_ldb_cqs(d);

        self.drain_dir_queues(d)?;
        self.disable_dir_cqs(d);
        self.disable_producer_ports(d);

        self.verify_reset_success(d)?;
        self.reset_registers(d);
        self.reset_software_state(d)
    }

    fn disable_vpps(&self, d: u32, vdev: u8) {
        let dom = &self.domains[d as usize];
        for p in dom.used_ldb_port_ids() {
            let id = self.ldb_ports[p as usize].id;
            let vpp = id.virt_id.unwrap_or(id.phys_id);
            self.hw.write(Reg::VfLdbVppValid { vdev, vpp }, 0);
        }
        for pq in dom.used_dir_pqs.iter() {
            let id = self.dir_pqs[pq as usize].id;
            let vpp = id.virt_id.unwrap_or(id.phys_id);
            self.hw.write(Reg::VfDirVppValid { vdev, vpp }, 0);
        }
    }

    fn disable_cq_interrupts(&self, d: u32) {
        let dom = &self.domains[d as usize];
        for pq in dom.used_dir_pqs.iter() {
            self.hw.write(Reg::DirCqIntEnable(pq), 0);
        }
        for p in dom.used_ldb_port_ids() {
            self.hw.write(Reg::LdbCqIntEnable(p), 0);
        }
    }

    /// Traffic sent to the domain's queues is dropped from here on.
    fn disable_write_perms(&self, d: u32) {
        let dom = &self.domains[d as usize];
        for pq in dom.used_dir_pqs.iter() {
            self.hw.write(Reg::DirQidWritePerm(pq), 0);
        }
        for q in dom.used_ldb_queues.iter() {
            self.hw.write(Reg::LdbQidWritePerm(q), 0);
        }
    }

    fn disable_ldb_cqs(&mut self, d: u32) {
        for p in self.domains[d as usize].used_ldb_port_ids() {
            self.ldb_ports[p as usize].enabled = false;
            self.ldb_port_cq_disable(p);
        }
    }

    fn enable_ldb_cqs(&mut self, d: u32) {
        for p in self.domains[d as usize].used_ldb_port_ids() {
            self.ldb_ports[p as usize].enabled = true;
            self.ldb_port_cq_enable(p);
        }
    }

    fn disable_dir_cqs(&mut self, d: u32) {
        for pq in self.domains[d as usize].used_dir_pqs.to_vec() {
            self.dir_pqs[pq as usize].enabled = false;
            self.dir_port_cq_disable(pq);
        }
    }

    fn disable_producer_ports(&self, d: u32) {
        let dom = &self.domains[d as usize];
        for pq in dom.used_dir_pqs.iter() {
            self.hw.write(Reg::DirPpValid(pq), 0);
        }
        for p in dom.used_ldb_port_ids() {
            self.hw.write(Reg::LdbPpValid(p), 0);
        }
    }

    /// Return every token and complete every event held by a CQ.
    fn drain_ldb_cq(&self, p: u32) {
        let infl = self.hw.ldb_cq_inflight_count(p);
        let tokens = self.ldb_cq_tokens(p);
        if infl == 0 && tokens == 0 {
            return;
        }

        let pp = ProducerPort::Ldb(p);
        let mut hcw = Hcw {
            qe_comp: infl > 0,
            cq_token: tokens > 0,
            lock_id: lock_id_for(tokens),
        };
        self.hw.pp_write(pp, &hcw);

        hcw.cq_token = false;
        for _ in 1..infl {
            self.hw.pp_write(pp, &hcw);
        }
    }

    fn drain_ldb_cqs(&self, d: u32, toggle_port: bool) {
        let dom = &self.domains[d as usize];
        if !dom.started {
            return;
        }
        for p in dom.used_ldb_port_ids() {
            if toggle_port {
                self.ldb_port_cq_disable(p);
            }
            self.drain_ldb_cq(p);
            if toggle_port {
                self.ldb_port_cq_enable(p);
            }
        }
    }

    fn wait_for_ldb_cqs_to_empty(&self, d: u32) -> Result<(), Error> {
        let loops = self.limits.cq_comp_check_loops;
        for p in self.domains[d as usize].used_ldb_port_ids() {
            let drained =
                (0..loops).any(|_| self.hw.ldb_cq_inflight_count(p) == 0);
            if !drained {
                return Err(self.fault(format!(
                    "failed to flush ldb port {p}'s completions"
                )));
            }
        }
        Ok(())
    }

    fn mapped_queues_empty(&self, d: u32) -> bool {
        self.domains[d as usize].used_ldb_queues.iter().all(|q| {
            self.ldb_queues[q as usize].num_mappings == 0
                || self.ldb_queue_is_empty(q)
        })
    }

    fn drain_mapped_queues(&self, d: u32) -> Result<(), Error> {
        let dom = &self.domains[d as usize];
        if !dom.started {
            return Ok(());
        }
        if dom.num_pending_removals > 0 {
            return Err(self.fault(format!(
                "domain {d}: failed to unmap domain queues"
            )));
        }

        let loops = self.limits.qid_empty_check_loops;
        let emptied = (0..loops).any(|_| {
            self.drain_ldb_cqs(d, true);
            self.mapped_queues_empty(d)
        });
        if !emptied {
            return Err(
                self.fault(format!("domain {d}: failed to empty queues"))
            );
        }

        // Emptying the queues scheduled their last events to the CQs.
        self.drain_ldb_cqs(d, true);
        Ok(())
    }

    /// Drain a queue with no mappings by borrowing the domain's first port.
    fn drain_unmapped_queue(&mut self, d: u32, q: u32) -> Result<(), Error> {
        let ports = self.domains[d as usize].used_ldb_port_ids();
        let Some(&p) = ports.first() else {
            return Err(
                self.fault(format!("domain {d}: no configured ldb ports"))
            );
        };

        if self.ldb_ports[p as usize].num_mappings as usize == QIDS_PER_LDB_CQ {
            let port = &self.ldb_ports[p as usize];
            let Some(victim) =
                port.qid_map.iter().position(|s| s.state == SlotState::Mapped)
            else {
                return Err(self.fault(format!("port {p}: no slot to free")));
            };
            self.unmap_qid_static(p, victim)?;
        }

        self.map_qid_dynamic(d, p, q, 0)?;
        self.drain_mapped_queues(d)
    }

    fn drain_unmapped_queues(&mut self, d: u32) -> Result<(), Error> {
        if !self.domains[d as usize].started {
            return Ok(());
        }
        // The CQ drains in drain_mapped_queues left these queues with no
        // outstanding completions.
        for q in self.domains[d as usize].used_ldb_queues.to_vec() {
            if self.ldb_queues[q as usize].num_mappings != 0
                || self.ldb_queue_is_empty(q)
            {
                continue;
            }
            self.drain_unmapped_queue(d, q)?;
        }
        Ok(())
    }

    fn drain_dir_cqs(&self, d: u32) {
        for pq in self.domains[d as usize].used_dir_pqs.iter() {
            let pair = &self.dir_pqs[pq as usize];
            // Nothing can be queued to a port without both halves.
            if !pair.port_configured || !pair.queue_configured {
                continue;
            }
            self.dir_port_cq_disable(pq);
            let tokens = self.dir_cq_tokens(pq);
            if tokens != 0 {
                let hcw = Hcw {
                    qe_comp: false,
                    cq_token: true,
                    lock_id: lock_id_for(tokens),
                };
                self.hw.pp_write(ProducerPort::Dir(pq), &hcw);
            }
            self.dir_port_cq_enable(pq);
        }
    }

    fn dir_queues_empty(&self, d: u32) -> bool {
        self.domains[d as usize]
            .used_dir_pqs
            .iter()
            .all(|pq| self.hw.dir_queue_depth(pq) == 0)
    }

    fn drain_dir_queues(&self, d: u32) -> Result<(), Error> {
        if !self.domains[d as usize].started {
            return Ok(());
        }
        let loops = self.limits.qid_empty_check_loops;
        let emptied = (0..loops).any(|_| {
            self.drain_dir_cqs(d);
            self.dir_queues_empty(d)
        });
        if !emptied {
            return Err(self.fault(format!(
                "domain {d}: failed to empty dir queues"
            )));
        }
        self.drain_dir_cqs(d);
        Ok(())
    }

    fn verify_reset_success(&self, d: u32) -> Result<(), Error> {
        let dom = &self.domains[d as usize];
        let failed = |what: &str, id: u32| {
            self.fault(format!("failed to empty {what} {id}"))
        };
        for q in dom.used_ldb_queues.iter() {
            if !self.ldb_queue_is_empty(q) {
                return Err(failed("ldb queue", q));
            }
        }
        for p in dom.used_ldb_port_ids() {
            if self.hw.ldb_cq_inflight_count(p) != 0
                || self.ldb_cq_tokens(p) != 0
            {
                return Err(failed("ldb port", p));
            }
        }
        for pq in dom.used_dir_pqs.iter() {
            if self.hw.dir_queue_depth(pq) != 0 {
                return Err(failed("dir queue", pq));
            }
            if self.dir_cq_tokens(pq) != 0 {
                return Err(failed("dir port", pq));
            }
        }
        Ok(())
    }

    fn reset_registers(&self, d: u32) {
        let dom = &self.domains[d as usize];
        for p in dom.used_ldb_port_ids() {
            for reg in [
                Reg::LdbCqAddr(p),
                Reg::LdbCqDepth(p),
                Reg::LdbCqTokenInit(p),
                Reg::LdbCqHistBase(p),
                Reg::LdbCqHistLimit(p),
                Reg::LdbCqInflightOk(p),
                Reg::LdbCqHasWork(p),
            ] {
                self.hw.write(reg, 0);
            }
            for slot in 0..QIDS_PER_LDB_CQ as u8 {
                self.hw.write(Reg::LdbCqSlotMap { port: p, slot }, 0);
            }
        }
        for pq in dom.used_dir_pqs.iter() {
            self.hw.write(Reg::DirCqAddr(pq), 0);
            self.hw.write(Reg::DirCqDepth(pq), 0);
            self.hw.write(Reg::DirCqTokenInit(pq), 0);
        }
        for q in dom.used_ldb_queues.iter() {
            for reg in [
                Reg::LdbQidInflightLimit(q),
                Reg::LdbQidAqedLimit(q),
                Reg::LdbQidLockIdComp(q),
                Reg::LdbQidSnConfig(q),
                Reg::LdbQidCqIdx(q),
            ] {
                self.hw.write(reg, 0);
            }
        }
        self.hw.write(Reg::DomainLdbCredits(d), 0);
        self.hw.write(Reg::DomainDirCredits(d), 0);
    }

    /// Hand every resource of the domain back to its owning function.
    fn reset_software_state(&mut self, d: u32) -> Result<(), Error> {
        let parent = self.domains[d as usize].parent;
        let dom = &mut self.domains[d as usize];

        let queues: Vec<u32> = dom
            .used_ldb_queues
            .iter()
            .chain(dom.avail_ldb_queues.iter())
            .collect();
        let ports: Vec<u32> = dom.all_ldb_port_ids().collect();
        let pairs: Vec<u32> =
            dom.used_dir_pqs.iter().chain(dom.avail_dir_pqs.iter()).collect();
        let hist = std::mem::take(&mut dom.hist);
        let ldb_credits = std::mem::take(&mut dom.num_ldb_credits);
        let dir_credits = std::mem::take(&mut dom.num_dir_credits);
        let aqed = std::mem::take(&mut dom.num_avail_aqed)
            + std::mem::take(&mut dom.num_used_aqed);
        dom.used_ldb_queues = Default::default();
        dom.avail_ldb_queues = Default::default();
        dom.used_ldb_ports = Default::default();
        dom.avail_ldb_ports = Default::default();
        dom.used_dir_pqs = Default::default();
        dom.avail_dir_pqs = Default::default();
        dom.num_pending_additions = 0;
        dom.num_pending_removals = 0;
        dom.configured = false;
        dom.started = false;

        for &q in &queues {
            let queue = &mut self.ldb_queues[q as usize];
            if let Some((group, slot)) = queue.sn.take() {
                if let Some(sn) = self.sn_groups.get_mut(group as usize) {
                    sn.free_slot(slot);
                }
            }
            queue.domain = None;
            queue.configured = false;
            queue.num_mappings = 0;
            queue.num_pending_additions = 0;
            queue.num_qid_inflights = 0;
            queue.aqed_limit = 0;
        }
        for &p in &ports {
            let port = &mut self.ldb_ports[p as usize];
            port.domain = None;
            port.configured = false;
            port.enabled = false;
            port.num_mappings = 0;
            port.num_pending_removals = 0;
            port.qid_map = Default::default();
            port.init_tkn_cnt = 0;
        }
        for &pq in &pairs {
            let pair = &mut self.dir_pqs[pq as usize];
            pair.domain = None;
            pair.port_configured = false;
            pair.queue_configured = false;
            pair.enabled = false;
            pair.init_tkn_cnt = 0;
        }

        let port_classes: Vec<(u32, usize)> = ports
            .iter()
            .map(|&p| (p, self.ldb_ports[p as usize].cos))
            .collect();
        let rsrcs = self.rsrcs_mut(parent)?;
        for q in queues {
            rsrcs.avail_ldb_queues.push(q);
        }
        for (p, cos) in port_classes {
            rsrcs.avail_ldb_ports[cos].push(p);
        }
        for pq in pairs {
            rsrcs.avail_dir_pqs.push(pq);
        }
        let HistList { base, total, .. } = hist;
        if total > 0 {
            rsrcs
                .avail_hist_list_entries
                .set_range(base as usize, total as usize)?;
        }
        rsrcs.num_avail_ldb_credits += ldb_credits;
        rsrcs.num_avail_dir_credits += dir_credits;
        rsrcs.num_avail_aqed += aqed;

        if !rsrcs.used_domains.remove(d) {
            return Err(self.fault(format!("{parent} does not own domain {d}")));
        }
        self.rsrcs_mut(parent)?.avail_domains.push(d);
        Ok(())
    }

    /// Return the software state of every domain to its owner.
    ///
    /// Used after a function-level reset, when the hardware has already been
    /// reset and draining is neither possible nor needed.
    pub fn resource_reset(&mut self) -> Result<(), Error> {
        let vfs: Vec<Func> = self.vfs.iter().map(|r| r.func).collect();
        for func in vfs.into_iter().chain(std::iter::once(Func::Pf)) {
            for d in self.rsrcs(func)?.used_domains.to_vec() {
                self.reset_software_state(d)?;
            }
        }
        slog::info!(self.log, "resource state reset");
        Ok(())
    }

    /// Reset every scheduling domain in use by a VF.
    pub fn reset_vdev(&mut self, vdev: u8) -> Result<(), Error> {
        let func = Func::Vf(vdev);
        for d in self.rsrcs(func)?.used_domains.to_vec() {
            self.reset_domain_phys(d)?;
        }
        slog::info!(self.log, "reset vdev domains"; "vdev" => vdev);
        Ok(())
    }
}
