// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to device registers and producer ports.

use std::sync::Arc;

pub mod regs;
pub mod sim;

use regs::Reg;

/// A producer port, through which software enqueues hardware control words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerPort {
    Ldb(u32),
    Dir(u32),
}

/// The subset of a hardware control word used when draining consumer queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hcw {
    /// Complete one outstanding scheduled event
    pub qe_comp: bool,
    /// Return `lock_id + 1` consumer queue tokens
    pub cq_token: bool,
    pub lock_id: u16,
}

impl Hcw {
    pub fn tokens(&self) -> u32 {
        if self.cq_token {
            u32::from(self.lock_id) + 1
        } else {
            0
        }
    }
}

/// Register interface supplied by the embedding system.
pub trait Csr: Send + Sync {
    fn read(&self, addr: u64) -> u64;
    fn write(&self, addr: u64, val: u64);

    /// Enqueue a control word through a producer port and fence it.
    fn pp_write(&self, pp: ProducerPort, hcw: &Hcw);
}

/// Typed accessors over a [Csr].
#[derive(Clone)]
pub(crate) struct Hw {
    csr: Arc<dyn Csr>,
}

impl Hw {
    pub fn new(csr: Arc<dyn Csr>) -> Self {
        Self { csr }
    }

    pub fn read(&self, reg: Reg) -> u64 {
        self.csr.read(reg.addr())
    }

    pub fn write(&self, reg: Reg, val: u64) {
        self.csr.write(reg.addr(), val)
    }

    /// Set or clear `mask` in a register, leaving other bits untouched.
    pub fn update_bits(&self, reg: Reg, mask: u64, set: bool) {
        let val = self.read(reg);
        let val = if set { val | mask } else { val & !mask };
        self.write(reg, val)
    }

    fn read32(&self, reg: Reg) -> u32 {
        (self.read(reg) & u64::from(u32::MAX)) as u32
    }

    pub fn ldb_queue_inflight_count(&self, qid: u32) -> u32 {
        self.read32(Reg::LdbQidInflightCount(qid))
    }

    pub fn ldb_queue_depth(&self, qid: u32) -> u32 {
        self.read32(Reg::LdbQidDepth(qid))
    }

    pub fn dir_queue_depth(&self, qid: u32) -> u32 {
        self.read32(Reg::DirQidDepth(qid))
    }

    pub fn ldb_cq_inflight_count(&self, port: u32) -> u32 {
        self.read32(Reg::LdbCqInflightCount(port))
    }

    pub fn ldb_cq_token_count(&self, port: u32) -> u32 {
        self.read32(Reg::LdbCqTokenCount(port))
    }

    pub fn dir_cq_token_count(&self, port: u32) -> u32 {
        self.read32(Reg::DirCqTokenCount(port))
    }

    pub fn set_ldb_cq(&self, port: u32, enable: bool) {
        self.write(Reg::LdbCqEnable(port), enable.into())
    }

    pub fn set_dir_cq(&self, port: u32, enable: bool) {
        self.write(Reg::DirCqEnable(port), enable.into())
    }

    pub fn pp_write(&self, pp: ProducerPort, hcw: &Hcw) {
        self.csr.pp_write(pp, hcw)
    }
}
