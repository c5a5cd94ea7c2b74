// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A PCI function which owns device resources.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Func {
    Pf,
    Vf(u8),
}

impl Func {
    pub fn vdev(self) -> Option<u8> {
        match self {
            Func::Pf => None,
            Func::Vf(v) => Some(v),
        }
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Func::Pf => write!(f, "pf"),
            Func::Vf(v) => write!(f, "vf{v}"),
        }
    }
}

/// A resource identifier as supplied by a requester.
///
/// Requests from the PF address resources by physical id.  Requests relayed
/// on behalf of a VF use the VF-relative ids stamped when the VF was locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Id {
    Physical(u32),
    Virtual { vdev: u8, id: u32 },
}

impl Id {
    /// Address `raw` in the same id space as `func`.
    pub fn new(func: Func, raw: u32) -> Self {
        match func {
            Func::Pf => Id::Physical(raw),
            Func::Vf(vdev) => Id::Virtual { vdev, id: raw },
        }
    }

    pub fn func(&self) -> Func {
        match self {
            Id::Physical(_) => Func::Pf,
            Id::Virtual { vdev, .. } => Func::Vf(*vdev),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            Id::Physical(id) | Id::Virtual { id, .. } => *id,
        }
    }

    /// Another id from the same requester's id space.
    pub fn sibling(&self, raw: u32) -> Self {
        Id::new(self.func(), raw)
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Id::Virtual { .. })
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Physical(id) => write!(f, "{id}"),
            Id::Virtual { vdev, id } => write!(f, "vf{vdev}:{id}"),
        }
    }
}

/// Identity carried by each hardware object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResId {
    pub phys_id: u32,
    /// VF-relative id, present only while a locked VF owns the object.
    pub virt_id: Option<u32>,
}

impl ResId {
    pub fn new(phys_id: u32) -> Self {
        Self { phys_id, virt_id: None }
    }

    /// Does this object answer to `id` when looked up by a requester?
    pub fn matches(&self, id: Id) -> bool {
        match id {
            Id::Physical(p) => self.phys_id == p,
            Id::Virtual { id, .. } => self.virt_id == Some(id),
        }
    }

    /// The id reported back to a requester from `func`.
    pub fn external(&self, func: Func) -> u32 {
        match func {
            Func::Pf => self.phys_id,
            Func::Vf(_) => self.virt_id.unwrap_or(self.phys_id),
        }
    }
}
