// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual function resource assignment.
//!
//! The PF assigns each VF a share of its available resources.  An update
//! sets the VF's share of one kind to an absolute count: the VF's current
//! share is returned to the PF and the new count taken from the front of the
//! PF's pool.  Once a VF is locked its assignment is frozen and its resources
//! answer to VF-relative ids.

use super::{Dlb2, FunctionResources, IdList};
use crate::id::{Func, ResId};
use crate::mbox::{Mailbox, MboxError, MboxStatus, VfNotification, VfRequest};
use crate::status::{Error, Locked, Status};
use crate::NUM_COS;

use std::sync::Arc;

/// A kind of resource tracked as a list of ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pool {
    Domains,
    LdbQueues,
    LdbPorts(usize),
    DirPorts,
}

impl Pool {
    fn list(self, rsrcs: &mut FunctionResources) -> &mut IdList {
        match self {
            Pool::Domains => &mut rsrcs.avail_domains,
            Pool::LdbQueues => &mut rsrcs.avail_ldb_queues,
            Pool::LdbPorts(cos) => &mut rsrcs.avail_ldb_ports[cos],
            Pool::DirPorts => &mut rsrcs.avail_dir_pqs,
        }
    }

    fn unavailable(self) -> Status {
        match self {
            Pool::Domains => Status::DomainUnavailable,
            Pool::LdbQueues => Status::LdbQueuesUnavailable,
            Pool::LdbPorts(_) => Status::LdbPortsUnavailable,
            Pool::DirPorts => Status::DirPortsUnavailable,
        }
    }
}

/// A kind of resource tracked as a plain count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
enum Counter {
    LdbCredits,
    DirCredits,
    AtomicInflights,
}

impl Counter {
    fn count(self, rsrcs: &mut FunctionResources) -> &mut u32 {
        match self {
            Counter::LdbCredits => &mut rsrcs.num_avail_ldb_credits,
            Counter::DirCredits => &mut rsrcs.num_avail_dir_credits,
            Counter::AtomicInflights => &mut rsrcs.num_avail_aqed,
        }
    }

    fn unavailable(self) -> Status {
        match self {
            Counter::LdbCredits => Status::LdbCreditsUnavailable,
            Counter::DirCredits => Status::DirCreditsUnavailable,
            Counter::AtomicInflights => Status::AtomicInflightsUnavailable,
        }
    }
}

impl Dlb2 {
    fn vdev_index(&self, vdev: u8) -> Result<usize, Error> {
        let v = usize::from(vdev);
        if v >= self.vfs.len() {
            return Err(Error::InvalidArgument("no such vdev"));
        }
        Ok(v)
    }

    /// A VF whose assignment may still change.
    fn unlocked_vdev(&self, vdev: u8) -> Result<usize, Error> {
        let v = self.vdev_index(vdev)?;
        if self.vfs[v].locked {
            return Err(Error::Permission(Locked::Vf(vdev)));
        }
        Ok(v)
    }

    fn res_id_mut(&mut self, pool: Pool, id: u32) -> &mut ResId {
        match pool {
            Pool::Domains => &mut self.domains[id as usize].id,
            Pool::LdbQueues => &mut self.ldb_queues[id as usize].id,
            Pool::LdbPorts(_) => &mut self.ldb_ports[id as usize].id,
            Pool::DirPorts => &mut self.dir_pqs[id as usize].id,
        }
    }

    fn update_vdev_pool(
        &mut self,
        vdev: u8,
        pool: Pool,
        num: u32,
    ) -> Result<(), Error> {
        let v = self.unlocked_vdev(vdev)?;
        let orig = pool.list(&mut self.vfs[v]).count();
        let avail = pool.list(&mut self.pf).count();
        if u64::from(num) > u64::from(avail) + u64::from(orig) {
            return Err(self.rejected("update_vdev", pool.unavailable()));
        }

        // Returned resources no longer answer to the VF's ids.
        for id in pool.list(&mut self.vfs[v]).to_vec() {
            self.res_id_mut(pool, id).virt_id = None;
        }
        let (pf, vf) = (&mut self.pf, &mut self.vfs[v]);
        pool.list(vf).transfer(pool.list(pf), orig as usize);
        pool.list(pf).transfer(pool.list(vf), num as usize);

        if pool == Pool::Domains {
            for d in self.pf.avail_domains.iter() {
                self.domains[d as usize].parent = Func::Pf;
            }
            for d in self.vfs[v].avail_domains.iter() {
                self.domains[d as usize].parent = Func::Vf(vdev);
            }
        }

        slog::info!(self.log, "vdev assignment updated";
            "vdev" => vdev, "pool" => ?pool, "num" => num);
        Ok(())
    }

    fn update_vdev_counter(
        &mut self,
        vdev: u8,
        counter: Counter,
        num: u32,
    ) -> Result<(), Error> {
        let v = self.unlocked_vdev(vdev)?;
        let orig = *counter.count(&mut self.vfs[v]);
        let avail = *counter.count(&mut self.pf);
        let Some(pool) = avail.checked_add(orig).filter(|&n| n >= num) else {
            return Err(self.rejected("update_vdev", counter.unavailable()));
        };

        *counter.count(&mut self.pf) = pool - num;
        *counter.count(&mut self.vfs[v]) = num;

        let kind: &'static str = counter.into();
        slog::info!(self.log, "vdev assignment updated";
            "vdev" => vdev, "counter" => kind, "num" => num);
        Ok(())
    }

    /// Set the number of scheduling domains assigned to a VF.
    pub fn update_vdev_sched_domains(
        &mut self,
        vdev: u8,
        num: u32,
    ) -> Result<(), Error> {
        self.update_vdev_pool(vdev, Pool::Domains, num)
    }

    pub fn update_vdev_ldb_queues(
        &mut self,
        vdev: u8,
        num: u32,
    ) -> Result<(), Error> {
        self.update_vdev_pool(vdev, Pool::LdbQueues, num)
    }

    /// Set the number of load-balanced ports of class `cos` assigned to a
    /// VF.
    pub fn update_vdev_ldb_cos_ports(
        &mut self,
        vdev: u8,
        cos: u8,
        num: u32,
    ) -> Result<(), Error> {
        let cos = usize::from(cos);
        if cos >= NUM_COS {
            return Err(self.rejected("update_vdev", Status::InvalidCosId));
        }
        self.update_vdev_pool(vdev, Pool::LdbPorts(cos), num)
    }

    /// Set the number of load-balanced ports assigned to a VF, drawing from
    /// (or returning to) the classes of service in ascending order.
    pub fn update_vdev_ldb_ports(
        &mut self,
        vdev: u8,
        num: u32,
    ) -> Result<(), Error> {
        let v = self.unlocked_vdev(vdev)?;
        let orig = self.vfs[v].num_avail_ldb_ports();
        if num > orig {
            let add = num - orig;
            if self.pf.num_avail_ldb_ports() < add {
                return Err(
                    self.rejected("update_vdev", Status::LdbPortsUnavailable)
                );
            }
            self.spread_vdev_ldb_ports(vdev, v, add, true)
        } else if num < orig {
            self.spread_vdev_ldb_ports(vdev, v, orig - num, false)
        } else {
            Ok(())
        }
    }

    /// Add or remove `num` ports class by class, restoring the earlier
    /// classes if a later one fails.
    fn spread_vdev_ldb_ports(
        &mut self,
        vdev: u8,
        v: usize,
        mut num: u32,
        add: bool,
    ) -> Result<(), Error> {
        let mut done: Vec<(u8, u32)> = Vec::with_capacity(NUM_COS);
        for cos in 0..NUM_COS {
            if num == 0 {
                break;
            }
            let curr = self.vfs[v].avail_ldb_ports[cos].count();
            let target = if add {
                let avail = self.pf.avail_ldb_ports[cos].count();
                let n = num.min(avail);
                num -= n;
                curr + n
            } else {
                let n = num.min(curr);
                num -= n;
                curr - n
            };

            let cos = cos as u8;
            if let Err(e) = self.update_vdev_ldb_cos_ports(vdev, cos, target) {
                slog::error!(self.log, "failed to update vdev ldb ports";
                    "vdev" => vdev, "cos" => cos, "error" => %e);
                for &(cos, orig) in done.iter().rev() {
                    // Best effort; the first failure is what gets reported.
                    let _ = self.update_vdev_ldb_cos_ports(vdev, cos, orig);
                }
                return Err(e);
            }
            done.push((cos, curr));
        }
        Ok(())
    }

    pub fn update_vdev_dir_ports(
        &mut self,
        vdev: u8,
        num: u32,
    ) -> Result<(), Error> {
        self.update_vdev_pool(vdev, Pool::DirPorts, num)
    }

    pub fn update_vdev_ldb_credits(
        &mut self,
        vdev: u8,
        num: u32,
    ) -> Result<(), Error> {
        self.update_vdev_counter(vdev, Counter::LdbCredits, num)
    }

    pub fn update_vdev_dir_credits(
        &mut self,
        vdev: u8,
        num: u32,
    ) -> Result<(), Error> {
        self.update_vdev_counter(vdev, Counter::DirCredits, num)
    }

    pub fn update_vdev_atomic_inflights(
        &mut self,
        vdev: u8,
        num: u32,
    ) -> Result<(), Error> {
        self.update_vdev_counter(vdev, Counter::AtomicInflights, num)
    }

    /// Give a VF a contiguous run of `num` history-list entries.
    ///
    /// The VF's current entries are merged back into the PF's first, so the
    /// new run may reuse them and the VF's base may move.
    pub fn update_vdev_hist_list_entries(
        &mut self,
        vdev: u8,
        num: u32,
    ) -> Result<(), Error> {
        let v = self.unlocked_vdev(vdev)?;

        let mut merged = self.pf.avail_hist_list_entries.clone();
        merged.or_assign(&self.vfs[v].avail_hist_list_entries)?;
        let Some(base) = merged.find_set_range(num as usize) else {
            return Err(self.rejected(
                "update_vdev",
                Status::HistListEntriesUnavailable,
            ));
        };

        let vf = &mut self.vfs[v].avail_hist_list_entries;
        vf.zero();
        vf.set_range(base, num as usize)?;
        merged.clear_range(base, num as usize)?;
        self.pf.avail_hist_list_entries = merged;

        slog::info!(self.log, "vdev assignment updated";
            "vdev" => vdev, "hist_list_base" => base, "num" => num);
        Ok(())
    }

    /// Return every resource assigned to an unlocked VF to the PF.
    pub fn reset_vdev_resources(&mut self, vdev: u8) -> Result<(), Error> {
        self.unlocked_vdev(vdev)?;
        self.update_vdev_sched_domains(vdev, 0)?;
        self.update_vdev_ldb_queues(vdev, 0)?;
        self.update_vdev_ldb_ports(vdev, 0)?;
        self.update_vdev_dir_ports(vdev, 0)?;
        self.update_vdev_ldb_credits(vdev, 0)?;
        self.update_vdev_dir_credits(vdev, 0)?;
        self.update_vdev_hist_list_entries(vdev, 0)?;
        self.update_vdev_atomic_inflights(vdev, 0)
    }

    /// Freeze a VF's assignment and number its resources from zero.
    ///
    /// Load-balanced ports are numbered across classes in class order.
    pub fn lock_vdev(&mut self, vdev: u8) -> Result<(), Error> {
        let v = self.vdev_index(vdev)?;
        let rsrcs = &self.vfs[v];
        let stamp = |ids: Vec<u32>| ids.into_iter().zip(0u32..);

        for (d, virt) in stamp(rsrcs.avail_domains.to_vec()) {
            self.domains[d as usize].id.virt_id = Some(virt);
        }
        for (q, virt) in stamp(rsrcs.avail_ldb_queues.to_vec()) {
            self.ldb_queues[q as usize].id.virt_id = Some(virt);
        }
        let ports: Vec<u32> =
            rsrcs.avail_ldb_ports.iter().flat_map(IdList::iter).collect();
        for (p, virt) in stamp(ports) {
            self.ldb_ports[p as usize].id.virt_id = Some(virt);
        }
        for (pq, virt) in stamp(rsrcs.avail_dir_pqs.to_vec()) {
            self.dir_pqs[pq as usize].id.virt_id = Some(virt);
        }

        self.vfs[v].locked = true;
        slog::info!(self.log, "vdev locked"; "vdev" => vdev);
        Ok(())
    }

    pub fn unlock_vdev(&mut self, vdev: u8) -> Result<(), Error> {
        let v = self.vdev_index(vdev)?;
        self.vfs[v].locked = false;
        slog::info!(self.log, "vdev unlocked"; "vdev" => vdev);
        Ok(())
    }

    pub fn vdev_is_locked(&self, vdev: u8) -> Result<bool, Error> {
        Ok(self.vfs[self.vdev_index(vdev)?].locked)
    }

    fn mailbox(&self, vdev: u8) -> Result<Arc<dyn Mailbox>, Error> {
        self.vdev_index(vdev)?;
        self.mbox.clone().ok_or(Error::InvalidArgument("no vf mailbox"))
    }

    /// Send a request and wait for the VF to acknowledge it.
    fn mbox_request(
        &self,
        mbox: &dyn Mailbox,
        vdev: u8,
        req: &VfRequest,
    ) -> Result<(), Error> {
        mbox.send(vdev, req)?;
        if !self.mbox_policy.wait(mbox, vdev) {
            slog::error!(self.log, "timed out waiting for vf mailbox response";
                "vdev" => vdev, "request" => ?req);
            return Err(Error::Timeout(vdev));
        }
        Ok(())
    }

    /// Tell a VF about an impending or completed reset.
    pub fn notify_vf(
        &self,
        vdev: u8,
        notification: VfNotification,
    ) -> Result<(), Error> {
        let mbox = self.mailbox(vdev)?;
        let req = VfRequest::Notification(notification);
        self.mbox_request(mbox.as_ref(), vdev, &req)
    }

    /// Ask a VF whether its driver is using the device.
    pub fn vdev_in_use(&self, vdev: u8) -> Result<bool, Error> {
        let mbox = self.mailbox(vdev)?;
        self.mbox_request(mbox.as_ref(), vdev, &VfRequest::InUse)?;
        let resp = mbox.read_response(vdev)?;
        if resp.status != MboxStatus::Success {
            slog::error!(self.log, "vf mailbox request failed";
                "vdev" => vdev, "status" => ?resp.status);
            return Err(MboxError::Status(vdev, resp.status).into());
        }
        Ok(resp.in_use)
    }

    /// Forward a domain alert to the VF which owns the domain.
    pub fn notify_vf_alarm(
        &self,
        vdev: u8,
        domain_id: u32,
        alert_id: u32,
        aux_alert_data: u32,
    ) -> Result<(), Error> {
        let mbox = self.mailbox(vdev)?;
        let req =
            VfRequest::DomainAlert { domain_id, alert_id, aux_alert_data };
        self.mbox_request(mbox.as_ref(), vdev, &req)
    }
}
