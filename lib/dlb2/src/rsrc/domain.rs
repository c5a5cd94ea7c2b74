// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling domain creation and start.

use super::{CreateSchedDomainArgs, Dlb2, FunctionResources, HistList};
use crate::hw::regs::Reg;
use crate::id::{Func, Id};
use crate::status::{Error, Status};
use crate::NUM_COS;

impl FunctionResources {
    /// Check every requested count against what this function holds.
    ///
    /// Runs before any resource moves, so a rejected request leaves the
    /// function untouched.
    fn verify_sched_domain(
        &self,
        args: &CreateSchedDomainArgs,
    ) -> Result<(), Status> {
        if self.avail_domains.is_empty() {
            return Err(Status::DomainUnavailable);
        }
        if self.avail_ldb_queues.count() < args.num_ldb_queues {
            return Err(Status::LdbQueuesUnavailable);
        }

        let req_ldb_ports = args.total_ldb_ports();
        if self.num_avail_ldb_ports() < req_ldb_ports {
            return Err(Status::LdbPortsUnavailable);
        }
        if args.cos_strict {
            for (avail, &req) in
                self.avail_ldb_ports.iter().zip(&args.num_cos_ldb_ports)
            {
                if avail.count() < req {
                    return Err(Status::LdbPortsUnavailable);
                }
            }
        }
        if args.num_ldb_queues > 0 && req_ldb_ports == 0 {
            return Err(Status::LdbPortRequiredForLdbQueues);
        }

        if self.avail_dir_pqs.count() < args.num_dir_ports {
            return Err(Status::DirPortsUnavailable);
        }
        if self.num_avail_ldb_credits < args.num_ldb_credits {
            return Err(Status::LdbCreditsUnavailable);
        }
        if self.num_avail_dir_credits < args.num_dir_credits {
            return Err(Status::DirCreditsUnavailable);
        }
        if self.num_avail_aqed < args.num_atomic_inflights {
            return Err(Status::AtomicInflightsUnavailable);
        }
        // The domain's entries must be one contiguous run.
        let longest = self.avail_hist_list_entries.longest_set_range();
        if (longest as u64) < u64::from(args.num_hist_list_entries) {
            return Err(Status::HistListEntriesUnavailable);
        }
        Ok(())
    }
}

impl Dlb2 {
    /// Create a scheduling domain from resources held by `func`.
    ///
    /// Returns the domain's id in `func`'s id space.
    pub fn create_sched_domain(
        &mut self,
        func: Func,
        args: &CreateSchedDomainArgs,
    ) -> Result<u32, Error> {
        slog::debug!(self.log, "create sched domain";
            "func" => %func, "args" => ?args);

        let rsrcs = self.rsrcs(func)?;
        if let Err(st) = rsrcs.verify_sched_domain(args) {
            return Err(self.rejected("create_sched_domain", st));
        }

        let Some(d) = self.rsrcs_mut(func)?.avail_domains.pop_front() else {
            return Err(self.fault(format!("{func} has no domain")));
        };
        self.domains[d as usize].parent = func;

        self.attach_ldb_queues(func, d, args.num_ldb_queues)?;
        self.attach_ldb_ports(func, d, args)?;
        self.attach_dir_pqs(func, d, args.num_dir_ports)?;
        self.attach_credits(func, d, args)?;
        self.attach_hist_list_entries(func, d, args.num_hist_list_entries)?;

        let dom = &self.domains[d as usize];
        self.hw.write(Reg::DomainLdbCredits(d), dom.num_ldb_credits.into());
        self.hw.write(Reg::DomainDirCredits(d), dom.num_dir_credits.into());

        let dom = &mut self.domains[d as usize];
        dom.configured = true;
        dom.started = false;
        self.rsrcs_mut(func)?.used_domains.push(d);

        let id = self.domain_external_id(d);
        slog::info!(self.log, "created sched domain";
            "func" => %func, "domain" => id, "phys_id" => d);
        Ok(id)
    }

    fn attach_ldb_queues(
        &mut self,
        func: Func,
        d: u32,
        num: u32,
    ) -> Result<(), Error> {
        for _ in 0..num {
            let Some(q) = self.rsrcs_mut(func)?.avail_ldb_queues.pop_front()
            else {
                return Err(self.fault(format!("{func}: ldb queues exhausted")));
            };
            self.ldb_queues[q as usize].domain = Some(d);
            self.domains[d as usize].avail_ldb_queues.push(q);
        }
        Ok(())
    }

    fn attach_ldb_ports(
        &mut self,
        func: Func,
        d: u32,
        args: &CreateSchedDomainArgs,
    ) -> Result<(), Error> {
        for cos in 0..NUM_COS {
            for _ in 0..args.num_cos_ldb_ports[cos] {
                // Non-strict requests fall back to the following classes.
                let tries = if args.cos_strict { 1 } else { NUM_COS };
                let classes = (0..tries).map(|j| (cos + j) % NUM_COS);
                self.attach_ldb_port(func, d, classes)?;
            }
        }
        for _ in 0..args.num_ldb_ports {
            self.attach_ldb_port(func, d, 0..NUM_COS)?;
        }
        Ok(())
    }

    /// Attach one port from the first of `classes` with a port to spare.
    fn attach_ldb_port(
        &mut self,
        func: Func,
        d: u32,
        classes: impl Iterator<Item = usize>,
    ) -> Result<(), Error> {
        for cos in classes {
            if let Some(p) = self.next_ldb_port(func, d, cos) {
                let rsrcs = self.rsrcs_mut(func)?;
                rsrcs.avail_ldb_ports[cos].remove(p);
                let port = &mut self.ldb_ports[p as usize];
                port.domain = Some(d);
                self.domains[d as usize].avail_ldb_ports[cos].push(p);
                return Ok(());
            }
        }
        Err(self.fault(format!("{func}: ldb ports exhausted")))
    }

    /// Choose a port from `func`'s class `cos` for domain `d`.
    ///
    /// Ports whose neighbours belong to other domains are preferred, then
    /// ports next to free ones, so that adjacent ports tend not to end up
    /// sharing a domain.
    fn next_ldb_port(&self, func: Func, d: u32, cos: usize) -> Option<u32> {
        let list = &self.rsrcs(func).ok()?.avail_ldb_ports[cos];
        let num_ports = self.ldb_ports.len() as u32;
        let other_domain = |p: u32| match self.ldb_ports[p as usize].domain {
            Some(owner) => owner != d,
            None => false,
        };
        let unowned = |p: u32| self.ldb_ports[p as usize].domain.is_none();
        let neighbours = |p: u32| {
            let next = (p + 1) % num_ports;
            let prev = (p + num_ports - 1) % num_ports;
            (prev, next)
        };

        list.iter()
            .find(|&p| {
                let (prev, next) = neighbours(p);
                other_domain(prev) && other_domain(next)
            })
            .or_else(|| {
                list.iter().find(|&p| {
                    let (prev, next) = neighbours(p);
                    (other_domain(prev) && unowned(next))
                        || (unowned(prev) && other_domain(next))
                })
            })
            .or_else(|| {
                list.iter().find(|&p| {
                    let (prev, next) = neighbours(p);
                    unowned(prev) && unowned(next)
                })
            })
            .or_else(|| list.front())
    }

    fn attach_dir_pqs(
        &mut self,
        func: Func,
        d: u32,
        num: u32,
    ) -> Result<(), Error> {
        for _ in 0..num {
            let Some(pq) = self.rsrcs_mut(func)?.avail_dir_pqs.pop_front()
            else {
                return Err(self.fault(format!("{func}: dir ports exhausted")));
            };
            self.dir_pqs[pq as usize].domain = Some(d);
            self.domains[d as usize].avail_dir_pqs.push(pq);
        }
        Ok(())
    }

    fn attach_credits(
        &mut self,
        func: Func,
        d: u32,
        args: &CreateSchedDomainArgs,
    ) -> Result<(), Error> {
        let rsrcs = self.rsrcs_mut(func)?;
        let (Some(ldb), Some(dir), Some(aqed)) = (
            rsrcs.num_avail_ldb_credits.checked_sub(args.num_ldb_credits),
            rsrcs.num_avail_dir_credits.checked_sub(args.num_dir_credits),
            rsrcs.num_avail_aqed.checked_sub(args.num_atomic_inflights),
        ) else {
            return Err(self.fault(format!("{func}: credits exhausted")));
        };
        rsrcs.num_avail_ldb_credits = ldb;
        rsrcs.num_avail_dir_credits = dir;
        rsrcs.num_avail_aqed = aqed;

        let dom = &mut self.domains[d as usize];
        dom.num_ldb_credits += args.num_ldb_credits;
        dom.num_dir_credits += args.num_dir_credits;
        dom.num_avail_aqed += args.num_atomic_inflights;
        Ok(())
    }

    fn attach_hist_list_entries(
        &mut self,
        func: Func,
        d: u32,
        num: u32,
    ) -> Result<(), Error> {
        if num == 0 {
            return Ok(());
        }
        let bitmap = &mut self.rsrcs_mut(func)?.avail_hist_list_entries;
        let Some(base) = bitmap.find_set_range(num as usize) else {
            return Err(self.fault(format!("{func}: no run of {num} entries")));
        };
        bitmap.clear_range(base, num as usize)?;

        self.domains[d as usize].hist =
            HistList { base: base as u32, offset: 0, total: num, avail: num };
        Ok(())
    }

    /// Open a configured domain's queues to traffic.
    ///
    /// Starting is one-way: the domain can only be returned to its owner by a
    /// reset.
    pub fn start_domain(&mut self, domain: Id) -> Result<(), Error> {
        let d = self
            .unstarted_domain(domain)
            .map_err(|st| self.rejected("start_domain", st))?;

        let dom = &self.domains[d as usize];
        for q in dom.used_ldb_queues.iter() {
            self.hw.write(Reg::LdbQidWritePerm(q), 1);
        }
        for pq in dom.used_dir_pqs.iter() {
            self.hw.write(Reg::DirQidWritePerm(pq), 1);
        }
        self.domains[d as usize].started = true;

        slog::info!(self.log, "started sched domain";
            "domain" => %domain, "phys_id" => d);
        Ok(())
    }
}
