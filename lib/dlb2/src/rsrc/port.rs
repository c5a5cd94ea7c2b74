// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{CreateDirPortArgs, CreateLdbPortArgs, Dlb2, QidSlot};
use crate::hw::regs::Reg;
use crate::id::Id;
use crate::status::{Error, Status};
use crate::{MAX_CQ_DEPTH, NUM_COS, QIDS_PER_LDB_CQ};

/// CQ base addresses must be cache-line aligned.
const CQ_BASE_ALIGN: u64 = 64;

/// Token count below which the hardware pads a CQ.
const MIN_CQ_TOKENS: u32 = 8;

fn verify_cq(cq_base: u64, cq_depth: u32) -> Result<(), Status> {
    if cq_base % CQ_BASE_ALIGN != 0 {
        return Err(Status::InvalidCqVirtAddr);
    }
    if !cq_depth.is_power_of_two() || cq_depth > MAX_CQ_DEPTH {
        return Err(Status::InvalidCqDepth);
    }
    Ok(())
}

fn init_token_count(cq_depth: u32) -> u32 {
    MIN_CQ_TOKENS.saturating_sub(cq_depth)
}

impl Dlb2 {
    /// Enable a load-balanced CQ, unless it still owes queue removals.
    pub(super) fn ldb_port_cq_enable(&self, p: u32) {
        if self.ldb_ports[p as usize].num_pending_removals > 0 {
            return;
        }
        self.hw.set_ldb_cq(p, true);
    }

    pub(super) fn ldb_port_cq_disable(&self, p: u32) {
        self.hw.set_ldb_cq(p, false);
    }

    pub(super) fn dir_port_cq_enable(&self, pq: u32) {
        self.hw.set_dir_cq(pq, true);
    }

    pub(super) fn dir_port_cq_disable(&self, pq: u32) {
        self.hw.set_dir_cq(pq, false);
    }

    fn verify_create_ldb_port(
        &self,
        domain: Id,
        args: &CreateLdbPortArgs,
        cq_base: u64,
    ) -> Result<(u32, usize), Status> {
        let d = self.unstarted_domain(domain)?;
        let dom = &self.domains[d as usize];

        let cos = usize::from(args.cos_id);
        if cos >= NUM_COS {
            return Err(Status::InvalidCosId);
        }
        let cos = if args.cos_strict {
            (!dom.avail_ldb_ports[cos].is_empty()).then_some(cos)
        } else {
            (0..NUM_COS)
                .map(|i| (cos + i) % NUM_COS)
                .find(|&c| !dom.avail_ldb_ports[c].is_empty())
        };
        let cos = cos.ok_or(Status::LdbPortsUnavailable)?;

        verify_cq(cq_base, args.cq_depth)?;

        if args.cq_history_list_size == 0 {
            return Err(Status::InvalidHistListDepth);
        }
        if args.cq_history_list_size > dom.hist.avail {
            return Err(Status::HistListEntriesUnavailable);
        }
        Ok((d, cos))
    }

    /// Create a load-balanced port in an unstarted domain.
    ///
    /// `cq_base` is the bus address of the port's consumer queue.  The port is
    /// taken from `args.cos_id`, or when not strict from the next class with
    /// a port to spare, and its CQ is left enabled.
    pub fn create_ldb_port(
        &mut self,
        domain: Id,
        args: &CreateLdbPortArgs,
        cq_base: u64,
    ) -> Result<u32, Error> {
        slog::debug!(self.log, "create ldb port";
            "domain" => %domain, "args" => ?args, "cq_base" => cq_base);

        let (d, cos) = self
            .verify_create_ldb_port(domain, args, cq_base)
            .map_err(|st| self.rejected("create_ldb_port", st))?;

        let Some(p) = self.domains[d as usize].avail_ldb_ports[cos].front()
        else {
            return Err(self.fault(format!("domain {d}: no cos {cos} port")));
        };
        if self.ldb_ports[p as usize].configured {
            return Err(self.fault(format!("avail port {p} is configured")));
        }

        let hist = &mut self.domains[d as usize].hist;
        let hist_base = hist.base + hist.offset;
        hist.offset += args.cq_history_list_size;
        hist.avail -= args.cq_history_list_size;

        let port = &mut self.ldb_ports[p as usize];
        port.hist_list_entry_base = hist_base;
        port.hist_list_entry_limit = hist_base + args.cq_history_list_size - 1;
        port.cq_depth = args.cq_depth;
        port.init_tkn_cnt = init_token_count(args.cq_depth);
        port.qid_map = [QidSlot::default(); QIDS_PER_LDB_CQ];
        port.num_mappings = 0;
        port.num_pending_removals = 0;

        self.hw.write(Reg::LdbCqAddr(p), cq_base);
        self.hw.write(Reg::LdbCqDepth(p), args.cq_depth.into());
        self.hw.write(Reg::LdbCqTokenInit(p), port.init_tkn_cnt.into());
        self.hw.write(Reg::LdbCqHistBase(p), hist_base.into());
        self.hw.write(
            Reg::LdbCqHistLimit(p),
            port.hist_list_entry_limit.into(),
        );
        for slot in 0..QIDS_PER_LDB_CQ as u8 {
            self.hw.write(Reg::LdbCqSlotMap { port: p, slot }, 0);
        }
        self.hw.write(Reg::LdbCqSeqCheck(p), 1);
        self.hw.write(Reg::LdbPpValid(p), 1);

        self.ldb_port_cq_enable(p);
        let port = &mut self.ldb_ports[p as usize];
        port.enabled = true;
        port.configured = true;

        let dom = &mut self.domains[d as usize];
        dom.avail_ldb_ports[cos].remove(p);
        dom.used_ldb_ports[cos].push(p);

        Ok(self.ldb_ports[p as usize].id.external(domain.func()))
    }

    fn verify_create_dir_port(
        &self,
        domain: Id,
        args: &CreateDirPortArgs,
        cq_base: u64,
    ) -> Result<(u32, Option<u32>), Status> {
        let d = self.unstarted_domain(domain)?;

        // A port created after its queue joins the queue's pair.
        let paired = match args.queue_id {
            Some(qid) => {
                let pq = self
                    .domain_used_dir_pq(d, domain.sibling(qid))
                    .filter(|&pq| self.dir_pqs[pq as usize].queue_configured)
                    .ok_or(Status::InvalidDirQueueId)?;
                Some(pq)
            }
            None => {
                if self.domains[d as usize].avail_dir_pqs.is_empty() {
                    return Err(Status::DirPortsUnavailable);
                }
                None
            }
        };

        verify_cq(cq_base, args.cq_depth)?;
        Ok((d, paired))
    }

    /// Create a directed port, pairing it with `args.queue_id` if given.
    pub fn create_dir_port(
        &mut self,
        domain: Id,
        args: &CreateDirPortArgs,
        cq_base: u64,
    ) -> Result<u32, Error> {
        slog::debug!(self.log, "create dir port";
            "domain" => %domain, "args" => ?args, "cq_base" => cq_base);

        let (d, paired) = self
            .verify_create_dir_port(domain, args, cq_base)
            .map_err(|st| self.rejected("create_dir_port", st))?;

        let pq = match paired {
            Some(pq) => pq,
            None => {
                let Some(pq) = self.domains[d as usize].avail_dir_pqs.front()
                else {
                    return Err(self.fault(format!("domain {d}: no dir pair")));
                };
                pq
            }
        };

        let pair = &mut self.dir_pqs[pq as usize];
        pair.cq_depth = args.cq_depth;
        pair.init_tkn_cnt = init_token_count(args.cq_depth);

        self.hw.write(Reg::DirCqAddr(pq), cq_base);
        self.hw.write(Reg::DirCqDepth(pq), args.cq_depth.into());
        self.hw.write(Reg::DirCqTokenInit(pq), pair.init_tkn_cnt.into());
        self.hw.write(Reg::DirPpValid(pq), 1);

        self.dir_port_cq_enable(pq);
        let pair = &mut self.dir_pqs[pq as usize];
        pair.enabled = true;
        pair.port_configured = true;

        if paired.is_none() {
            let dom = &mut self.domains[d as usize];
            dom.avail_dir_pqs.remove(pq);
            dom.used_dir_pqs.push(pq);
        }

        Ok(self.dir_pqs[pq as usize].id.external(domain.func()))
    }

    fn verify_ldb_port_op(
        &self,
        domain: Id,
        port_id: u32,
    ) -> Result<u32, Status> {
        let d = self.configured_domain(domain)?;
        self.domain_ldb_port(d, domain.sibling(port_id))
            .filter(|&p| self.ldb_ports[p as usize].configured)
            .ok_or(Status::InvalidPortId)
    }

    fn verify_dir_port_op(
        &self,
        domain: Id,
        port_id: u32,
    ) -> Result<u32, Status> {
        let d = self.configured_domain(domain)?;
        self.domain_used_dir_pq(d, domain.sibling(port_id))
            .filter(|&pq| self.dir_pqs[pq as usize].port_configured)
            .ok_or(Status::InvalidPortId)
    }

    /// Resume scheduling to a load-balanced port's CQ.
    pub fn enable_ldb_port(
        &mut self,
        domain: Id,
        port_id: u32,
    ) -> Result<(), Error> {
        let p = self
            .verify_ldb_port_op(domain, port_id)
            .map_err(|st| self.rejected("enable_ldb_port", st))?;
        if !self.ldb_ports[p as usize].enabled {
            self.ldb_port_cq_enable(p);
            self.ldb_ports[p as usize].enabled = true;
        }
        Ok(())
    }

    /// Stop scheduling to a load-balanced port's CQ.
    pub fn disable_ldb_port(
        &mut self,
        domain: Id,
        port_id: u32,
    ) -> Result<(), Error> {
        let p = self
            .verify_ldb_port_op(domain, port_id)
            .map_err(|st| self.rejected("disable_ldb_port", st))?;
        if self.ldb_ports[p as usize].enabled {
            self.ldb_port_cq_disable(p);
            self.ldb_ports[p as usize].enabled = false;
        }
        Ok(())
    }

    pub fn enable_dir_port(
        &mut self,
        domain: Id,
        port_id: u32,
    ) -> Result<(), Error> {
        let pq = self
            .verify_dir_port_op(domain, port_id)
            .map_err(|st| self.rejected("enable_dir_port", st))?;
        if !self.dir_pqs[pq as usize].enabled {
            self.dir_port_cq_enable(pq);
            self.dir_pqs[pq as usize].enabled = true;
        }
        Ok(())
    }

    pub fn disable_dir_port(
        &mut self,
        domain: Id,
        port_id: u32,
    ) -> Result<(), Error> {
        let pq = self
            .verify_dir_port_op(domain, port_id)
            .map_err(|st| self.rejected("disable_dir_port", st))?;
        if self.dir_pqs[pq as usize].enabled {
            self.dir_port_cq_disable(pq);
            self.dir_pqs[pq as usize].enabled = false;
        }
        Ok(())
    }
}
