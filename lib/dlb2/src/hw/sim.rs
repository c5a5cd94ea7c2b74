// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-in for the device.
//!
//! [SimDevice] keeps a flat register file and models just enough of the
//! scheduler for the manager's drain and mapping logic to observe: enabled
//! consumer queues pull every pending event from the queues mapped to them,
//! and producer-port writes retire completions and tokens.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::regs::{slot_map, Reg};
use super::{Csr, Hcw, ProducerPort};
use crate::QIDS_PER_LDB_CQ;

#[derive(Default)]
pub struct SimDevice {
    regs: Mutex<BTreeMap<u64, u64>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a register without side effects.
    pub fn get(&self, reg: Reg) -> u64 {
        let regs = self.regs.lock().unwrap();
        regs.get(&reg.addr()).copied().unwrap_or(0)
    }

    /// Set a register without side effects, e.g. to stage hardware counters.
    pub fn set(&self, reg: Reg, val: u64) {
        let mut regs = self.regs.lock().unwrap();
        regs.insert(reg.addr(), val);
    }

    /// Queue ids currently mapped into a load-balanced CQ's slots.
    pub fn ldb_cq_mapped_qids(&self, port: u32) -> Vec<u32> {
        let regs = self.regs.lock().unwrap();
        Self::mapped_qids(&regs, port)
    }

    fn mapped_qids(regs: &BTreeMap<u64, u64>, port: u32) -> Vec<u32> {
        (0..QIDS_PER_LDB_CQ as u8)
            .filter_map(|slot| {
                let val = regs
                    .get(&Reg::LdbCqSlotMap { port, slot }.addr())
                    .copied()
                    .unwrap_or(0);
                slot_map::qid(val)
            })
            .collect()
    }

    fn load(regs: &BTreeMap<u64, u64>, reg: Reg) -> u64 {
        regs.get(&reg.addr()).copied().unwrap_or(0)
    }

    fn store(regs: &mut BTreeMap<u64, u64>, reg: Reg, val: u64) {
        regs.insert(reg.addr(), val);
    }

    /// Move every event waiting on queues mapped to `port` into its CQ.
    fn schedule_ldb(regs: &mut BTreeMap<u64, u64>, port: u32) {
        if Self::load(regs, Reg::LdbCqEnable(port)) == 0 {
            return;
        }
        for qid in Self::mapped_qids(regs, port) {
            let depth = Self::load(regs, Reg::LdbQidDepth(qid));
            if depth == 0 {
                continue;
            }
            Self::store(regs, Reg::LdbQidDepth(qid), 0);
            let tokens = Self::load(regs, Reg::LdbCqTokenCount(port));
            Self::store(regs, Reg::LdbCqTokenCount(port), tokens + depth);
            let infl = Self::load(regs, Reg::LdbCqInflightCount(port));
            Self::store(regs, Reg::LdbCqInflightCount(port), infl + depth);
        }
    }

    fn schedule_dir(regs: &mut BTreeMap<u64, u64>, port: u32) {
        if Self::load(regs, Reg::DirCqEnable(port)) == 0 {
            return;
        }
        let depth = Self::load(regs, Reg::DirQidDepth(port));
        if depth == 0 {
            return;
        }
        Self::store(regs, Reg::DirQidDepth(port), 0);
        let tokens = Self::load(regs, Reg::DirCqTokenCount(port));
        Self::store(regs, Reg::DirCqTokenCount(port), tokens + depth);
    }
}

impl Csr for SimDevice {
    fn read(&self, addr: u64) -> u64 {
        let regs = self.regs.lock().unwrap();
        regs.get(&addr).copied().unwrap_or(0)
    }

    fn write(&self, addr: u64, val: u64) {
        let mut regs = self.regs.lock().unwrap();
        regs.insert(addr, val);
        match Reg::from_addr(addr) {
            Some(Reg::LdbCqEnable(port)) if val != 0 => {
                Self::schedule_ldb(&mut regs, port)
            }
            Some(Reg::DirCqEnable(port)) if val != 0 => {
                Self::schedule_dir(&mut regs, port)
            }
            // Shallow CQs start out holding their padding tokens.
            Some(Reg::LdbCqTokenInit(port)) => {
                Self::store(&mut regs, Reg::LdbCqTokenCount(port), val)
            }
            Some(Reg::DirCqTokenInit(port)) => {
                Self::store(&mut regs, Reg::DirCqTokenCount(port), val)
            }
            _ => {}
        }
    }

    fn pp_write(&self, pp: ProducerPort, hcw: &Hcw) {
        let mut regs = self.regs.lock().unwrap();
        match pp {
            ProducerPort::Ldb(port) => {
                if hcw.qe_comp {
                    let reg = Reg::LdbCqInflightCount(port);
                    let infl = Self::load(&regs, reg);
                    Self::store(&mut regs, reg, infl.saturating_sub(1));
                }
                let reg = Reg::LdbCqTokenCount(port);
                let tokens = Self::load(&regs, reg);
                Self::store(
                    &mut regs,
                    reg,
                    tokens.saturating_sub(hcw.tokens().into()),
                );
                Self::schedule_ldb(&mut regs, port);
            }
            ProducerPort::Dir(port) => {
                let reg = Reg::DirCqTokenCount(port);
                let tokens = Self::load(&regs, reg);
                Self::store(
                    &mut regs,
                    reg,
                    tokens.saturating_sub(hcw.tokens().into()),
                );
                Self::schedule_dir(&mut regs, port);
            }
        }
    }
}
