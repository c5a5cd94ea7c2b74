// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use dlb2::mbox::MboxPolicy;
use dlb2::rsrc::CreateSchedDomainArgs;
use dlb2::{Func, Limits, NUM_COS};

/// Description of a device and the resources carved out of it at start-up.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub reset: Reset,

    #[serde(default)]
    pub mailbox: Mailbox,

    #[serde(default)]
    pub sn_groups: SnGroups,

    #[serde(default)]
    pub cos: Cos,

    /// Per-VF resource assignments, keyed by VF number.
    #[serde(default, rename = "vf")]
    pub vfs: BTreeMap<String, VfConfig>,

    /// Scheduling domains to create, keyed by name.
    #[serde(default, rename = "domain")]
    pub domains: BTreeMap<String, DomainConfig>,
}

impl Config {
    /// Hardware limits with any drain bounds from `[reset]` applied.
    pub fn device_limits(&self) -> Limits {
        let mut limits = self.limits.clone();
        if let Some(loops) = self.reset.cq_comp_check_loops {
            limits.cq_comp_check_loops = loops;
        }
        if let Some(loops) = self.reset.qid_empty_check_loops {
            limits.qid_empty_check_loops = loops;
        }
        limits
    }

    /// VF assignments in VF order.
    pub fn vf_assignments(&self) -> Result<Vec<(u8, &VfConfig)>, ParseError> {
        let mut vfs = self
            .vfs
            .iter()
            .map(|(key, vf)| {
                let vdev = key.parse::<u8>().map_err(|_| {
                    ParseError::Invalid(format!("bad vf number {key:?}"))
                })?;
                Ok((vdev, vf))
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        vfs.sort_by_key(|(vdev, _)| *vdev);
        Ok(vfs)
    }

    fn validate(&self) -> Result<(), ParseError> {
        for (vdev, vf) in self.vf_assignments()? {
            if vf.ldb_ports.is_some() && vf.cos_ldb_ports.is_some() {
                return Err(ParseError::Invalid(format!(
                    "vf {vdev}: ldb_ports and cos_ldb_ports are exclusive"
                )));
            }
        }
        for (name, dom) in &self.domains {
            dom.owner().map_err(|e| {
                ParseError::Invalid(format!("domain {name}: {e}"))
            })?;
        }
        if self.sn_groups.modes.len() > self.limits.num_sn_groups as usize {
            return Err(ParseError::Invalid(format!(
                "{} sequence number modes for {} groups",
                self.sn_groups.modes.len(),
                self.limits.num_sn_groups
            )));
        }
        Ok(())
    }
}

/// Bounds on the polling done while draining a domain for reset.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Reset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cq_comp_check_loops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qid_empty_check_loops: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Mailbox {
    pub retries: u32,
    pub poll_interval_ms: u64,
}

impl Default for Mailbox {
    fn default() -> Self {
        let policy = MboxPolicy::default();
        Self {
            retries: policy.retries,
            poll_interval_ms: policy.poll_interval.as_millis() as u64,
        }
    }
}

impl Mailbox {
    pub fn policy(&self) -> MboxPolicy {
        MboxPolicy {
            retries: self.retries,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct SnGroups {
    /// Sequence numbers per queue for each group, in group order
    #[serde(default)]
    pub modes: Vec<u32>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Cos {
    /// Percentage of scheduling bandwidth reserved for each class
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<[u8; NUM_COS]>,
}

/// Resources moved from the PF to a VF.  Omitted kinds are left alone.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct VfConfig {
    pub domains: Option<u32>,
    pub ldb_queues: Option<u32>,
    /// Load-balanced ports spread across the classes of service
    pub ldb_ports: Option<u32>,
    /// Load-balanced ports from each class of service
    pub cos_ldb_ports: Option<[u32; NUM_COS]>,
    pub dir_ports: Option<u32>,
    pub ldb_credits: Option<u32>,
    pub dir_credits: Option<u32>,
    pub atomic_inflights: Option<u32>,
    pub hist_list_entries: Option<u32>,
    /// Lock the VF once its resources are assigned
    pub lock: bool,
}

/// A scheduling domain and the function which creates it.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct DomainConfig {
    #[serde(default = "default_owner")]
    pub owner: String,

    #[serde(flatten)]
    pub args: CreateSchedDomainArgs,
}

fn default_owner() -> String {
    "pf".to_string()
}

impl DomainConfig {
    /// The owning function, named `pf` or `vfN`.
    pub fn owner(&self) -> Result<Func, String> {
        if self.owner == "pf" {
            return Ok(Func::Pf);
        }
        self.owner
            .strip_prefix("vf")
            .and_then(|n| n.parse::<u8>().ok())
            .map(Func::Vf)
            .ok_or_else(|| format!("unknown owner {:?}", self.owner))
    }
}

/// Errors which may be returned when parsing a device configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    cfg.validate()?;
    Ok(cfg)
}
