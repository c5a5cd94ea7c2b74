// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Symbolic register map.
//!
//! Each register family occupies its own block of the address space, indexed
//! by the object it configures in 8-byte strides.  Field layouts within a
//! register are limited to the few values the manager composes itself.

const BLOCK_SHIFT: u32 = 20;
const INDEX_MASK: u64 = (1 << BLOCK_SHIFT) - 1;
const STRIDE: u64 = 8;

/// Index stride separating consecutive ports' slot registers.
const SLOTS_PER_PORT: u64 = 8;
/// Index stride separating consecutive VFs' virtual producer ports.
const VPPS_PER_VDEV: u64 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr)]
#[repr(u64)]
enum Block {
    DomainLdbCredits = 1,
    DomainDirCredits,
    LdbQidInflightLimit,
    LdbQidInflightCount,
    LdbQidDepth,
    LdbQidAqedLimit,
    LdbQidLockIdComp,
    LdbQidSnConfig,
    LdbQidWritePerm,
    LdbQidCqIdx,
    LdbCqEnable,
    LdbCqAddr,
    LdbCqDepth,
    LdbCqTokenInit,
    LdbCqHistBase,
    LdbCqHistLimit,
    LdbCqInflightCount,
    LdbCqTokenCount,
    LdbCqIntEnable,
    LdbCqSeqCheck,
    LdbCqSlotMap,
    LdbCqInflightOk,
    LdbCqHasWork,
    LdbPpValid,
    DirQidWritePerm,
    DirQidDepth,
    DirCqEnable,
    DirCqAddr,
    DirCqDepth,
    DirCqTokenInit,
    DirCqTokenCount,
    DirCqIntEnable,
    DirPpValid,
    VfLdbVppValid,
    VfDirVppValid,
    SnGroupMode,
    CosBandwidth,
    CfgShadowCtrl,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    DomainLdbCredits(u32),
    DomainDirCredits(u32),

    LdbQidInflightLimit(u32),
    /// Events scheduled from the queue and not yet completed (read-only)
    LdbQidInflightCount(u32),
    /// Events enqueued to the queue awaiting scheduling (read-only)
    LdbQidDepth(u32),
    LdbQidAqedLimit(u32),
    LdbQidLockIdComp(u32),
    LdbQidSnConfig(u32),
    LdbQidWritePerm(u32),
    /// Bitmask of load-balanced ports the queue may schedule to
    LdbQidCqIdx(u32),

    LdbCqEnable(u32),
    LdbCqAddr(u32),
    LdbCqDepth(u32),
    LdbCqTokenInit(u32),
    LdbCqHistBase(u32),
    LdbCqHistLimit(u32),
    LdbCqInflightCount(u32),
    LdbCqTokenCount(u32),
    LdbCqIntEnable(u32),
    LdbCqSeqCheck(u32),
    LdbCqSlotMap { port: u32, slot: u8 },
    /// Bitmask of slots whose queue may have events inflight to the CQ
    LdbCqInflightOk(u32),
    /// Bitmask of slots the scheduler should consider for the CQ
    LdbCqHasWork(u32),
    LdbPpValid(u32),

    DirQidWritePerm(u32),
    DirQidDepth(u32),
    DirCqEnable(u32),
    DirCqAddr(u32),
    DirCqDepth(u32),
    DirCqTokenInit(u32),
    DirCqTokenCount(u32),
    DirCqIntEnable(u32),
    DirPpValid(u32),

    VfLdbVppValid { vdev: u8, vpp: u32 },
    VfDirVppValid { vdev: u8, vpp: u32 },

    SnGroupMode(u32),
    CosBandwidth(u8),
    CfgShadowCtrl,
}

impl Reg {
    fn split(self) -> (Block, u64) {
        use Reg::*;
        let slot = |port: u32, slot: u8| {
            u64::from(port) * SLOTS_PER_PORT + u64::from(slot)
        };
        let vpp = |vdev: u8, vpp: u32| {
            u64::from(vdev) * VPPS_PER_VDEV + u64::from(vpp)
        };
        match self {
            DomainLdbCredits(i) => (Block::DomainLdbCredits, i.into()),
            DomainDirCredits(i) => (Block::DomainDirCredits, i.into()),
            LdbQidInflightLimit(i) => (Block::LdbQidInflightLimit, i.into()),
            LdbQidInflightCount(i) => (Block::LdbQidInflightCount, i.into()),
            LdbQidDepth(i) => (Block::LdbQidDepth, i.into()),
            LdbQidAqedLimit(i) => (Block::LdbQidAqedLimit, i.into()),
            LdbQidLockIdComp(i) => (Block::LdbQidLockIdComp, i.into()),
            LdbQidSnConfig(i) => (Block::LdbQidSnConfig, i.into()),
            LdbQidWritePerm(i) => (Block::LdbQidWritePerm, i.into()),
            LdbQidCqIdx(i) => (Block::LdbQidCqIdx, i.into()),
            LdbCqEnable(i) => (Block::LdbCqEnable, i.into()),
            LdbCqAddr(i) => (Block::LdbCqAddr, i.into()),
            LdbCqDepth(i) => (Block::LdbCqDepth, i.into()),
            LdbCqTokenInit(i) => (Block::LdbCqTokenInit, i.into()),
            LdbCqHistBase(i) => (Block::LdbCqHistBase, i.into()),
            LdbCqHistLimit(i) => (Block::LdbCqHistLimit, i.into()),
            LdbCqInflightCount(i) => (Block::LdbCqInflightCount, i.into()),
            LdbCqTokenCount(i) => (Block::LdbCqTokenCount, i.into()),
            LdbCqIntEnable(i) => (Block::LdbCqIntEnable, i.into()),
            LdbCqSeqCheck(i) => (Block::LdbCqSeqCheck, i.into()),
            LdbCqSlotMap { port, slot: s } => {
                (Block::LdbCqSlotMap, slot(port, s))
            }
            LdbCqInflightOk(i) => (Block::LdbCqInflightOk, i.into()),
            LdbCqHasWork(i) => (Block::LdbCqHasWork, i.into()),
            LdbPpValid(i) => (Block::LdbPpValid, i.into()),
            DirQidWritePerm(i) => (Block::DirQidWritePerm, i.into()),
            DirQidDepth(i) => (Block::DirQidDepth, i.into()),
            DirCqEnable(i) => (Block::DirCqEnable, i.into()),
            DirCqAddr(i) => (Block::DirCqAddr, i.into()),
            DirCqDepth(i) => (Block::DirCqDepth, i.into()),
            DirCqTokenInit(i) => (Block::DirCqTokenInit, i.into()),
            DirCqTokenCount(i) => (Block::DirCqTokenCount, i.into()),
            DirCqIntEnable(i) => (Block::DirCqIntEnable, i.into()),
            DirPpValid(i) => (Block::DirPpValid, i.into()),
            VfLdbVppValid { vdev, vpp: v } => {
                (Block::VfLdbVppValid, vpp(vdev, v))
            }
            VfDirVppValid { vdev, vpp: v } => {
                (Block::VfDirVppValid, vpp(vdev, v))
            }
            SnGroupMode(i) => (Block::SnGroupMode, i.into()),
            CosBandwidth(i) => (Block::CosBandwidth, i.into()),
            CfgShadowCtrl => (Block::CfgShadowCtrl, 0),
        }
    }

    pub fn addr(self) -> u64 {
        let (block, index) = self.split();
        ((block as u64) << BLOCK_SHIFT) | (index * STRIDE)
    }

    /// Decode an address produced by [Reg::addr].
    pub fn from_addr(addr: u64) -> Option<Reg> {
        use Reg::*;
        if addr % STRIDE != 0 {
            return None;
        }
        let block = Block::from_repr(addr >> BLOCK_SHIFT)?;
        let index = (addr & INDEX_MASK) / STRIDE;
        let i = u32::try_from(index).ok()?;
        let reg = match block {
            Block::DomainLdbCredits => DomainLdbCredits(i),
            Block::DomainDirCredits => DomainDirCredits(i),
            Block::LdbQidInflightLimit => LdbQidInflightLimit(i),
            Block::LdbQidInflightCount => LdbQidInflightCount(i),
            Block::LdbQidDepth => LdbQidDepth(i),
            Block::LdbQidAqedLimit => LdbQidAqedLimit(i),
            Block::LdbQidLockIdComp => LdbQidLockIdComp(i),
            Block::LdbQidSnConfig => LdbQidSnConfig(i),
            Block::LdbQidWritePerm => LdbQidWritePerm(i),
            Block::LdbQidCqIdx => LdbQidCqIdx(i),
            Block::LdbCqEnable => LdbCqEnable(i),
            Block::LdbCqAddr => LdbCqAddr(i),
            Block::LdbCqDepth => LdbCqDepth(i),
            Block::LdbCqTokenInit => LdbCqTokenInit(i),
            Block::LdbCqHistBase => LdbCqHistBase(i),
            Block::LdbCqHistLimit => LdbCqHistLimit(i),
            Block::LdbCqInflightCount => LdbCqInflightCount(i),
            Block::LdbCqTokenCount => LdbCqTokenCount(i),
            Block::LdbCqIntEnable => LdbCqIntEnable(i),
            Block::LdbCqSeqCheck => LdbCqSeqCheck(i),
            Block::LdbCqSlotMap => LdbCqSlotMap {
                port: (index / SLOTS_PER_PORT) as u32,
                slot: (index % SLOTS_PER_PORT) as u8,
            },
            Block::LdbCqInflightOk => LdbCqInflightOk(i),
            Block::LdbCqHasWork => LdbCqHasWork(i),
            Block::LdbPpValid => LdbPpValid(i),
            Block::DirQidWritePerm => DirQidWritePerm(i),
            Block::DirQidDepth => DirQidDepth(i),
            Block::DirCqEnable => DirCqEnable(i),
            Block::DirCqAddr => DirCqAddr(i),
            Block::DirCqDepth => DirCqDepth(i),
            Block::DirCqTokenInit => DirCqTokenInit(i),
            Block::DirCqTokenCount => DirCqTokenCount(i),
            Block::DirCqIntEnable => DirCqIntEnable(i),
            Block::DirPpValid => DirPpValid(i),
            Block::VfLdbVppValid => VfLdbVppValid {
                vdev: u8::try_from(index / VPPS_PER_VDEV).ok()?,
                vpp: (index % VPPS_PER_VDEV) as u32,
            },
            Block::VfDirVppValid => VfDirVppValid {
                vdev: u8::try_from(index / VPPS_PER_VDEV).ok()?,
                vpp: (index % VPPS_PER_VDEV) as u32,
            },
            Block::SnGroupMode => SnGroupMode(i),
            Block::CosBandwidth => CosBandwidth(u8::try_from(i).ok()?),
            Block::CfgShadowCtrl => CfgShadowCtrl,
        };
        Some(reg)
    }
}

/// CQ slot map entries: queue id, priority and a valid bit.
pub mod slot_map {
    pub const VALID: u64 = 1 << 24;
    const QID_MASK: u64 = 0xffff;
    const PRIO_SHIFT: u32 = 16;

    pub fn encode(qid: u32, priority: u8) -> u64 {
        (u64::from(qid) & QID_MASK)
            | (u64::from(priority) << PRIO_SHIFT)
            | VALID
    }

    /// The queue id in a valid entry.
    pub fn qid(val: u64) -> Option<u32> {
        (val & VALID != 0).then_some((val & QID_MASK) as u32)
    }

    pub fn priority(val: u64) -> u8 {
        ((val >> PRIO_SHIFT) & 0x7) as u8
    }
}

/// Queue sequence-number configuration: group, slot and a valid bit.
pub mod sn_config {
    pub const VALID: u64 = 1 << 16;

    pub fn encode(group: u32, slot: u32) -> u64 {
        (u64::from(group) << 8) | u64::from(slot & 0xff) | VALID
    }
}
