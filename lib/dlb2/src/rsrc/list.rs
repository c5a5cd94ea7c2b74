// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;

/// An ordered set of physical ids.
///
/// Ids are taken from the front and returned to the back, so an owner hands
/// out its resources in the order it received them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdList(VecDeque<u32>);

impl IdList {
    pub fn count(&self) -> u32 {
        self.0.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, id: u32) {
        debug_assert!(!self.contains(id));
        self.0.push_back(id);
    }

    pub fn front(&self) -> Option<u32> {
        self.0.front().copied()
    }

    pub fn pop_front(&mut self) -> Option<u32> {
        self.0.pop_front()
    }

    /// Remove `id`, returning whether it was present.
    pub fn remove(&mut self, id: u32) -> bool {
        match self.0.iter().position(|&x| x == id) {
            Some(pos) => {
                self.0.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// Snapshot of the members, for walks which mutate the owner.
    pub fn to_vec(&self) -> Vec<u32> {
        self.0.iter().copied().collect()
    }

    /// Move up to `num` ids from the front of this list to the back of `dst`.
    pub fn transfer(&mut self, dst: &mut IdList, num: usize) -> usize {
        let mut moved = 0;
        while moved < num {
            match self.0.pop_front() {
                Some(id) => dst.0.push_back(id),
                None => break,
            }
            moved += 1;
        }
        moved
    }
}

impl FromIterator<u32> for IdList {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
