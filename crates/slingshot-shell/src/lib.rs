// SPDX-License-Identifier: Apache-2.0
//! Shell-side Slingshot plugin: populates `SLINGSHOT_*` job environment
//! variables either from an enclosing allocation's environment, from a VNI
//! reservation matched against each Cassini device's CXI services, or not
//! at all, clearing the environment so a reused shell never leaks a
//! previous job's VNIs.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use slingshot_device::CassiniDevice;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from shell environment population.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShellError {
    /// `Mode::Inherit` was requested but no inherited VNI string was given.
    #[error("inherit mode requires an inherited vni string")]
    MissingInherited,
    /// `Mode::Reserved` was requested but no VNIs were supplied.
    #[error("reserved mode requires at least one vni")]
    EmptyReservation,
}

/// Traffic classes a CXI service may be granted, each a distinct bitmap
/// bit. This mapping is fixed by what Cray MPICH expects in
/// `SLINGSHOT_TCS` and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    /// Dedicated-access traffic.
    DedicatedAccess,
    /// Low-latency traffic.
    LowLatency,
    /// Bulk data transfer.
    BulkData,
    /// Best-effort traffic.
    BestEffort,
}

/// Every traffic class a CXI service could be granted.
const ALL_TRAFFIC_CLASSES: [TrafficClass; 4] = [
    TrafficClass::DedicatedAccess,
    TrafficClass::LowLatency,
    TrafficClass::BulkData,
    TrafficClass::BestEffort,
];

/// All traffic classes allowed, used when a device has no matching
/// service and so imposes no restriction.
const TCMASK_DEFAULT: u32 = 0xf;

impl TrafficClass {
    /// The bit this traffic class occupies in the service bitmap.
    #[must_use]
    pub fn bit(self) -> u32 {
        match self {
            Self::DedicatedAccess => 0x1,
            Self::LowLatency => 0x2,
            Self::BulkData => 0x4,
            Self::BestEffort => 0x8,
        }
    }
}

/// Combine traffic classes into a single bitmap.
#[must_use]
pub fn traffic_class_bitmap(classes: &[TrafficClass]) -> u32 {
    classes.iter().fold(0, |acc, c| acc | c.bit())
}

/// Decode a traffic-class bitmap back into the set of classes it grants.
#[must_use]
pub fn traffic_classes_from_bitmap(mask: u32) -> Vec<TrafficClass> {
    ALL_TRAFFIC_CLASSES
        .into_iter()
        .filter(|tc| mask & tc.bit() != 0)
        .collect()
}

/// `SLINGSHOT_*` values inherited from a broker or enclosing allocation's
/// environment. Only `vnis` is required; the rest pass through verbatim
/// when present.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InheritedEnv {
    /// `SLINGSHOT_VNIS` value to inherit.
    pub vnis: String,
    /// `SLINGSHOT_DEVICES` value to inherit, if set upstream.
    pub devices: Option<String>,
    /// `SLINGSHOT_SVC_IDS` value to inherit, if set upstream.
    pub svc_ids: Option<String>,
    /// `SLINGSHOT_TCS` value to inherit, if set upstream.
    pub tcs: Option<String>,
}

/// How the shell plugin should populate this job's Slingshot environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Pass through the environment inherited from an enclosing allocation
    /// (a job launched inside another job's resources reuses its parent's
    /// VNIs). Works at any instance level, including under a foreign
    /// resource manager.
    Inherit(InheritedEnv),
    /// Use VNIs reserved specifically for this job; CXI services matching
    /// those VNIs are located on each Cassini device.
    Reserved(Vec<u32>),
    /// No per-job VNIs: the job uses the device's default CXI service.
    Default,
}

/// Populate the `SLINGSHOT_*` environment variables for this job. The
/// caller is expected to have already cleared `SLINGSHOT_VNIS`,
/// `SLINGSHOT_DEVICES`, `SLINGSHOT_SVC_IDS`, and `SLINGSHOT_TCS` from the
/// shell before calling; only variables this mode actually determines are
/// returned.
pub fn populate_env<D: CassiniDevice>(
    mode: &Mode,
    devices: &[D],
) -> Result<BTreeMap<String, String>, ShellError> {
    match mode {
        Mode::Inherit(inherited) => inherit_env(inherited),
        Mode::Reserved(vnis) => reserved_env(vnis, devices),
        Mode::Default => {
            tracing::debug!("slingshot shell plugin: default mode, no per-job vnis");
            Ok(BTreeMap::new())
        }
    }
}

fn inherit_env(inherited: &InheritedEnv) -> Result<BTreeMap<String, String>, ShellError> {
    if inherited.vnis.is_empty() {
        return Err(ShellError::MissingInherited);
    }
    let mut env = BTreeMap::new();
    env.insert("SLINGSHOT_VNIS".to_string(), inherited.vnis.clone());
    if let Some(v) = &inherited.devices {
        env.insert("SLINGSHOT_DEVICES".to_string(), v.clone());
    }
    if let Some(v) = &inherited.svc_ids {
        env.insert("SLINGSHOT_SVC_IDS".to_string(), v.clone());
    }
    if let Some(v) = &inherited.tcs {
        env.insert("SLINGSHOT_TCS".to_string(), v.clone());
    }
    tracing::debug!("using inherited job environment");
    Ok(env)
}

fn reserved_env<D: CassiniDevice>(
    vnis: &[u32],
    devices: &[D],
) -> Result<BTreeMap<String, String>, ShellError> {
    if vnis.is_empty() {
        return Err(ShellError::EmptyReservation);
    }

    let mut device_names = Vec::new();
    let mut svc_ids = Vec::new();
    let mut tcmask = TCMASK_DEFAULT;
    for device in devices {
        device_names.push(device.name().to_string());
        match match_cxi_service(device, vnis) {
            Some((svc_id, mask)) => {
                svc_ids.push(svc_id.to_string());
                tcmask &= mask;
            }
            None => {
                tracing::warn!(device = device.name(), "CXI service for reserved VNIs not found");
                svc_ids.push("-1".to_string());
            }
        }
    }
    if devices.is_empty() {
        tracing::warn!("no slingshot devices were found");
    }

    let mut env = BTreeMap::new();
    env.insert("SLINGSHOT_VNIS".to_string(), join_commas(vnis));
    if !device_names.is_empty() {
        env.insert("SLINGSHOT_DEVICES".to_string(), device_names.join(","));
        env.insert("SLINGSHOT_SVC_IDS".to_string(), svc_ids.join(","));
    }
    env.insert("SLINGSHOT_TCS".to_string(), format!("{tcmask:#x}"));
    tracing::debug!("setting environment for VNI reservation");
    Ok(env)
}

/// Find the first enabled, non-system CXI service on `device` whose VNI
/// list matches `vnis` exactly (same members, same order), returning its
/// id and the traffic-class bitmap it grants.
fn match_cxi_service<D: CassiniDevice>(device: &D, vnis: &[u32]) -> Option<(u32, u32)> {
    device
        .list_services()
        .into_iter()
        .find(|svc| !svc.system && svc.vnis == vnis)
        .and_then(|svc| svc.svc_id.map(|id| (id, svc.traffic_classes)))
}

fn join_commas(vnis: &[u32]) -> String {
    vnis.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
