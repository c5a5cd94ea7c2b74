// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{Dlb2, NumResources};
use crate::hw::regs::Reg;
use crate::id::{Func, Id};
use crate::status::{Error, Status};
use crate::NUM_COS;

impl Dlb2 {
    /// Resources `func` holds that are not attached to any domain.
    pub fn get_num_resources(&self, func: Func) -> Result<NumResources, Error> {
        let rsrcs = self.rsrcs(func)?;
        let hist = &rsrcs.avail_hist_list_entries;
        let mut num_cos_ldb_ports = [0; NUM_COS];
        for (n, list) in
            num_cos_ldb_ports.iter_mut().zip(&rsrcs.avail_ldb_ports)
        {
            *n = list.count();
        }
        Ok(NumResources {
            num_sched_domains: rsrcs.avail_domains.count(),
            num_ldb_queues: rsrcs.avail_ldb_queues.count(),
            num_ldb_ports: rsrcs.num_avail_ldb_ports(),
            num_cos_ldb_ports,
            num_dir_ports: rsrcs.avail_dir_pqs.count(),
            num_atomic_inflights: rsrcs.num_avail_aqed,
            num_hist_list_entries: hist.count() as u32,
            max_contiguous_hist_list_entries: hist.longest_set_range() as u32,
            num_ldb_credits: rsrcs.num_avail_ldb_credits,
            num_dir_credits: rsrcs.num_avail_dir_credits,
        })
    }

    /// Resources attached to the domains `func` has created.
    ///
    /// Atomic inflights count only those claimed by the domains' queues.
    pub fn get_num_used_resources(
        &self,
        func: Func,
    ) -> Result<NumResources, Error> {
        let rsrcs = self.rsrcs(func)?;
        let mut num = NumResources::default();
        for d in rsrcs.used_domains.iter() {
            let dom = &self.domains[d as usize];
            num.num_sched_domains += 1;
            num.num_atomic_inflights += dom.num_used_aqed;
            num.num_ldb_queues +=
                dom.used_ldb_queues.count() + dom.avail_ldb_queues.count();
            for cos in 0..NUM_COS {
                let n = dom.used_ldb_ports[cos].count()
                    + dom.avail_ldb_ports[cos].count();
                num.num_cos_ldb_ports[cos] += n;
                num.num_ldb_ports += n;
            }
            num.num_dir_ports +=
                dom.used_dir_pqs.count() + dom.avail_dir_pqs.count();
            num.num_ldb_credits += dom.num_ldb_credits;
            num.num_dir_credits += dom.num_dir_credits;
            num.num_hist_list_entries += dom.hist.total;
        }
        Ok(num)
    }

    /// Events waiting in one of a domain's load-balanced queues.
    pub fn get_ldb_queue_depth(
        &self,
        domain: Id,
        qid: u32,
    ) -> Result<u32, Error> {
        let q = self
            .domain_from_id(domain)
            .ok_or(Status::InvalidDomainId)
            .and_then(|d| {
                self.domain_used_ldb_queue(d, domain.sibling(qid))
                    .ok_or(Status::InvalidQid)
            })
            .map_err(|st| self.rejected("get_ldb_queue_depth", st))?;
        Ok(self.hw.ldb_queue_depth(q))
    }

    pub fn get_dir_queue_depth(
        &self,
        domain: Id,
        qid: u32,
    ) -> Result<u32, Error> {
        let pq = self
            .domain_from_id(domain)
            .ok_or(Status::InvalidDomainId)
            .and_then(|d| {
                self.domain_used_dir_pq(d, domain.sibling(qid))
                    .ok_or(Status::InvalidQid)
            })
            .map_err(|st| self.rejected("get_dir_queue_depth", st))?;
        Ok(self.hw.dir_queue_depth(pq))
    }

    /// Is the load-balanced port attached to the configured domain?
    pub fn ldb_port_owned_by_domain(
        &self,
        domain: Id,
        port_id: u32,
    ) -> Result<bool, Error> {
        let d = self
            .configured_domain(domain)
            .map_err(|st| self.rejected("ldb_port_owned_by_domain", st))?;
        Ok(self.domain_ldb_port(d, domain.sibling(port_id)).is_some())
    }

    pub fn dir_port_owned_by_domain(
        &self,
        domain: Id,
        port_id: u32,
    ) -> Result<bool, Error> {
        let d = self
            .configured_domain(domain)
            .map_err(|st| self.rejected("dir_port_owned_by_domain", st))?;
        Ok(self.domain_dir_pq(d, domain.sibling(port_id)).is_some())
    }

    /// Percentage of scheduling bandwidth reserved for a class of service.
    pub fn get_cos_bandwidth(&self, cos: u8) -> Result<u8, Error> {
        self.cos_reservation.get(usize::from(cos)).copied().ok_or_else(|| {
            self.rejected("get_cos_bandwidth", Status::InvalidCosId)
        })
    }

    /// Reserve a percentage of scheduling bandwidth for a class of service.
    ///
    /// Reservations across all classes may not exceed 100%.
    pub fn set_cos_bandwidth(
        &mut self,
        cos: u8,
        bandwidth: u8,
    ) -> Result<(), Error> {
        let idx = usize::from(cos);
        if idx >= NUM_COS {
            return Err(
                self.rejected("set_cos_bandwidth", Status::InvalidCosId)
            );
        }
        if bandwidth > 100 {
            return Err(Error::InvalidArgument("bandwidth exceeds 100%"));
        }
        let total: u32 = self
            .cos_reservation
            .iter()
            .enumerate()
            .map(|(i, &bw)| u32::from(if i == idx { bandwidth } else { bw }))
            .sum();
        if total > 100 {
            return Err(Error::InvalidArgument("total bandwidth exceeds 100%"));
        }

        // The hardware takes reservations in 1/256ths.
        let range = u64::from(bandwidth) * 256 / 100;
        self.hw.write(Reg::CosBandwidth(cos), range);
        self.hw.write(Reg::CfgShadowCtrl, 1);
        self.cos_reservation[idx] = bandwidth;

        slog::info!(self.log, "cos bandwidth reserved";
            "cos" => cos, "percent" => bandwidth);
        Ok(())
    }
}
