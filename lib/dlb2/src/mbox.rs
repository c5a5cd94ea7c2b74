// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PF-to-VF mailbox collaboration.
//!
//! The manager defines what is said to a VF; how a request reaches it is up to
//! the [Mailbox] implementation supplied by the embedding system.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum VfNotification {
    PreReset,
    PostReset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VfRequest {
    Notification(VfNotification),
    InUse,
    DomainAlert { domain_id: u32, alert_id: u32, aux_alert_data: u32 },
}

/// Status reported in a VF's response header.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr, strum::IntoStaticStr,
)]
#[repr(u32)]
pub enum MboxStatus {
    Success = 0,
    InvalidCmdType,
    VersionMismatch,
    ExpectedPhaseOne,
    ExpectedPhaseTwo,
    InvalidOwnerVf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VfResponse {
    pub status: MboxStatus,
    pub in_use: bool,
}

#[derive(Debug, Error)]
pub enum MboxError {
    #[error("no mailbox for vf{0}")]
    NoSuchVf(u8),

    #[error("vf{0} answered with {1:?}")]
    Status(u8, MboxStatus),

    #[error("vf{0} has no response pending")]
    NoResponse(u8),
}

/// Request/response transport to each VF.
pub trait Mailbox: Send + Sync {
    /// Write `req` into the VF's request buffer and signal the VF.
    fn send(&self, vdev: u8, req: &VfRequest) -> Result<(), MboxError>;

    /// Has the VF acknowledged the most recent request?
    fn is_complete(&self, vdev: u8) -> bool;

    fn read_response(&self, vdev: u8) -> Result<VfResponse, MboxError>;
}

/// Bounds on how long the PF waits for a VF to acknowledge a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MboxPolicy {
    pub retries: u32,
    pub poll_interval: Duration,
}

impl Default for MboxPolicy {
    fn default() -> Self {
        Self { retries: 1000, poll_interval: Duration::from_millis(1) }
    }
}

impl MboxPolicy {
    /// Poll for completion, returning false if the VF never responded.
    pub fn wait(&self, mbox: &dyn Mailbox, vdev: u8) -> bool {
        for _ in 0..self.retries {
            if mbox.is_complete(vdev) {
                return true;
            }
            std::thread::sleep(self.poll_interval);
        }
        false
    }
}

#[derive(Default)]
struct LoopbackVf {
    in_use: bool,
    mute: bool,
    pending: Option<VfRequest>,
    received: Vec<VfRequest>,
}

/// An in-process mailbox whose VFs acknowledge every request immediately.
///
/// VFs can be marked in use, or muted to exercise response timeouts.
#[derive(Default)]
pub struct Loopback {
    vfs: Mutex<BTreeMap<u8, LoopbackVf>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_in_use(&self, vdev: u8, in_use: bool) {
        self.vfs.lock().unwrap().entry(vdev).or_default().in_use = in_use;
    }

    pub fn set_mute(&self, vdev: u8, mute: bool) {
        self.vfs.lock().unwrap().entry(vdev).or_default().mute = mute;
    }

    /// Requests delivered to a VF so far, oldest first.
    pub fn received(&self, vdev: u8) -> Vec<VfRequest> {
        self.vfs
            .lock()
            .unwrap()
            .get(&vdev)
            .map(|vf| vf.received.clone())
            .unwrap_or_default()
    }
}

impl Mailbox for Loopback {
    fn send(&self, vdev: u8, req: &VfRequest) -> Result<(), MboxError> {
        let mut vfs = self.vfs.lock().unwrap();
        let vf = vfs.entry(vdev).or_default();
        vf.pending = Some(*req);
        if !vf.mute {
            vf.received.push(*req);
        }
        Ok(())
    }

    fn is_complete(&self, vdev: u8) -> bool {
        let vfs = self.vfs.lock().unwrap();
        vfs.get(&vdev).map(|vf| !vf.mute).unwrap_or(false)
    }

    fn read_response(&self, vdev: u8) -> Result<VfResponse, MboxError> {
        let mut vfs = self.vfs.lock().unwrap();
        let vf = vfs.get_mut(&vdev).ok_or(MboxError::NoSuchVf(vdev))?;
        match vf.pending.take() {
            Some(_) => Ok(VfResponse {
                status: MboxStatus::Success,
                in_use: vf.in_use,
            }),
            None => Err(MboxError::NoResponse(vdev)),
        }
    }
}
