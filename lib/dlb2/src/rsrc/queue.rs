// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{CreateDirQueueArgs, CreateLdbQueueArgs, Dlb2};
use crate::hw::regs::{sn_config, Reg};
use crate::id::Id;
use crate::status::{Error, Status};
use crate::MAX_QID_INFLIGHTS;

/// Hardware encoding of an atomic queue's lock-id compression level.
///
/// Levels 0 and 65536 both mean "no compression".
fn lock_id_comp_code(level: u32) -> Option<u64> {
    let code = match level {
        0 | 65536 => 0,
        64 => 1,
        128 => 2,
        256 => 3,
        512 => 4,
        1024 => 5,
        2048 => 6,
        4096 => 7,
        _ => return None,
    };
    Some(code)
}

impl Dlb2 {
    fn verify_create_ldb_queue(
        &self,
        domain: Id,
        args: &CreateLdbQueueArgs,
    ) -> Result<(u32, Option<u32>), Status> {
        let d = self.unstarted_domain(domain)?;
        let dom = &self.domains[d as usize];

        if dom.avail_ldb_queues.is_empty() {
            return Err(Status::LdbQueuesUnavailable);
        }

        let group = match args.num_sequence_numbers {
            0 => None,
            n => Some(
                self.sn_group_for(n)
                    .ok_or(Status::SequenceNumbersUnavailable)?,
            ),
        };

        if args.num_qid_inflights > MAX_QID_INFLIGHTS {
            return Err(Status::InvalidQidInflightAllocation);
        }
        // An ordered queue can't have more inflights than sequence numbers.
        if args.num_sequence_numbers > 0
            && args.num_qid_inflights > args.num_sequence_numbers
        {
            return Err(Status::InvalidQidInflightAllocation);
        }

        if dom.num_avail_aqed < args.num_atomic_inflights {
            return Err(Status::AtomicInflightsUnavailable);
        }
        if args.num_atomic_inflights > 0
            && lock_id_comp_code(args.lock_id_comp_level).is_none()
        {
            return Err(Status::InvalidLockIdCompLevel);
        }
        Ok((d, group))
    }

    /// Create a load-balanced queue in an unstarted domain.
    ///
    /// The queue accepts no enqueues until the domain is started.
    pub fn create_ldb_queue(
        &mut self,
        domain: Id,
        args: &CreateLdbQueueArgs,
    ) -> Result<u32, Error> {
        slog::debug!(self.log, "create ldb queue";
            "domain" => %domain, "args" => ?args);

        let (d, group) = self
            .verify_create_ldb_queue(domain, args)
            .map_err(|st| self.rejected("create_ldb_queue", st))?;

        let Some(q) = self.domains[d as usize].avail_ldb_queues.front() else {
            return Err(self.fault(format!("domain {d}: no ldb queue")));
        };

        let sn = match group {
            Some(g) => {
                let Some(slot) = self.sn_groups[g as usize].alloc_slot() else {
                    return Err(self.fault(format!("sn group {g} is full")));
                };
                Some((g, slot))
            }
            None => None,
        };

        let dom = &mut self.domains[d as usize];
        dom.num_avail_aqed -= args.num_atomic_inflights;
        dom.num_used_aqed += args.num_atomic_inflights;

        let comp = lock_id_comp_code(args.lock_id_comp_level).unwrap_or(0);
        let sn_cfg = sn.map(|(g, s)| sn_config::encode(g, s)).unwrap_or(0);
        self.hw.write(
            Reg::LdbQidInflightLimit(q),
            args.num_qid_inflights.into(),
        );
        self.hw.write(
            Reg::LdbQidAqedLimit(q),
            args.num_atomic_inflights.into(),
        );
        self.hw.write(Reg::LdbQidLockIdComp(q), comp);
        self.hw.write(Reg::LdbQidSnConfig(q), sn_cfg);
        self.hw.write(Reg::LdbQidCqIdx(q), 0);
        self.hw.write(Reg::LdbQidWritePerm(q), 0);

        let queue = &mut self.ldb_queues[q as usize];
        queue.num_qid_inflights = args.num_qid_inflights;
        queue.aqed_limit = args.num_atomic_inflights;
        queue.sn = sn;
        queue.num_mappings = 0;
        queue.num_pending_additions = 0;
        queue.configured = true;

        let dom = &mut self.domains[d as usize];
        dom.avail_ldb_queues.remove(q);
        dom.used_ldb_queues.push(q);

        Ok(self.ldb_queues[q as usize].id.external(domain.func()))
    }

    fn verify_create_dir_queue(
        &self,
        domain: Id,
        args: &CreateDirQueueArgs,
    ) -> Result<(u32, Option<u32>), Status> {
        let d = self.unstarted_domain(domain)?;

        // A queue created after its port joins the port's pair.
        match args.port_id {
            Some(port_id) => {
                let pq = self
                    .domain_used_dir_pq(d, domain.sibling(port_id))
                    .filter(|&pq| self.dir_pqs[pq as usize].port_configured)
                    .ok_or(Status::InvalidPortId)?;
                Ok((d, Some(pq)))
            }
            None if self.domains[d as usize].avail_dir_pqs.is_empty() => {
                Err(Status::DirQueuesUnavailable)
            }
            None => Ok((d, None)),
        }
    }

    /// Create a directed queue, pairing it with `args.port_id` if given.
    pub fn create_dir_queue(
        &mut self,
        domain: Id,
        args: &CreateDirQueueArgs,
    ) -> Result<u32, Error> {
        slog::debug!(self.log, "create dir queue";
            "domain" => %domain, "args" => ?args);

        let (d, paired) = self
            .verify_create_dir_queue(domain, args)
            .map_err(|st| self.rejected("create_dir_queue", st))?;

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

        self.hw.write(Reg::DirQidWritePerm(pq), 0);
        self.dir_pqs[pq as usize].queue_configured = true;

        if paired.is_none() {
            let dom = &mut self.domains[d as usize];
            dom.avail_dir_pqs.remove(pq);
            dom.used_dir_pqs.push(pq);
        }

        Ok(self.dir_pqs[pq as usize].id.external(domain.func()))
    }
}
