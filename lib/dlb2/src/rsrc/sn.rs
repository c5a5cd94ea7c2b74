// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequence-number groups shared by ordered load-balanced queues.

use super::Dlb2;
use crate::hw::regs::Reg;
use crate::status::{Error, Locked};
use crate::SEQUENCE_NUMBERS_PER_GROUP;

/// Sequence numbers per queue which a group may be configured to hand out.
const SN_ALLOCATIONS: [u32; 5] = [64, 128, 256, 512, 1024];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnGroup {
    id: u32,
    sequence_numbers_per_queue: u32,
    /// Bit `n` set when slot `n` is held by a queue
    slot_use: u32,
}

impl SnGroup {
    pub(crate) fn new(id: u32) -> Self {
        Self { id, sequence_numbers_per_queue: SN_ALLOCATIONS[0], slot_use: 0 }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn sequence_numbers_per_queue(&self) -> u32 {
        self.sequence_numbers_per_queue
    }

    /// Number of queues the group can serve in its current mode.
    pub fn slots(&self) -> u32 {
        SEQUENCE_NUMBERS_PER_GROUP / self.sequence_numbers_per_queue
    }

    pub fn used_slots(&self) -> u32 {
        self.slot_use.count_ones()
    }

    pub fn is_full(&self) -> bool {
        self.used_slots() >= self.slots()
    }

    /// Mode register encoding of the current allocation.
    fn mode(&self) -> u64 {
        SN_ALLOCATIONS
            .iter()
            .position(|&n| n == self.sequence_numbers_per_queue)
            .unwrap_or(0) as u64
    }

    pub(crate) fn alloc_slot(&mut self) -> Option<u32> {
        let slot =
            (0..self.slots()).find(|s| self.slot_use & (1u32 << s) == 0)?;
        self.slot_use |= 1u32 << slot;
        Some(slot)
    }

    pub(crate) fn free_slot(&mut self, slot: u32) -> bool {
        let mask = 1u32.checked_shl(slot).unwrap_or(0);
        let held = self.slot_use & mask != 0;
        self.slot_use &= !mask;
        held
    }
}

impl Dlb2 {
    /// First group handing out `n` sequence numbers per queue with a free slot.
    pub(super) fn sn_group_for(&self, n: u32) -> Option<u32> {
        self.sn_groups
            .iter()
            .find(|g| g.sequence_numbers_per_queue == n && !g.is_full())
            .map(|g| g.id)
    }

    fn sn_group(&self, group: u32) -> Result<&SnGroup, Error> {
        self.sn_groups
            .get(group as usize)
            .ok_or(Error::InvalidArgument("no such sequence number group"))
    }

    pub fn get_group_sequence_numbers(&self, group: u32) -> Result<u32, Error> {
        Ok(self.sn_group(group)?.sequence_numbers_per_queue)
    }

    /// Queues currently holding a slot in the group.
    pub fn get_group_sequence_number_occupancy(
        &self,
        group: u32,
    ) -> Result<u32, Error> {
        Ok(self.sn_group(group)?.used_slots())
    }

    /// Change how many sequence numbers each of a group's queues receives.
    ///
    /// The mode is fixed once any queue holds a slot in the group.
    pub fn set_group_sequence_numbers(
        &mut self,
        group: u32,
        val: u32,
    ) -> Result<(), Error> {
        let sn = self.sn_group(group)?;
        if sn.slot_use != 0 {
            return Err(Error::Permission(Locked::SnGroup(group)));
        }
        if !SN_ALLOCATIONS.contains(&val) {
            return Err(Error::InvalidArgument(
                "unsupported sequence number allocation",
            ));
        }

        let sn = &mut self.sn_groups[group as usize];
        sn.sequence_numbers_per_queue = val;
        let mode = sn.mode();
        self.hw.write(Reg::SnGroupMode(group), mode);

        slog::info!(self.log, "sequence number group configured";
            "group" => group, "per_queue" => val);
        Ok(())
    }
}
