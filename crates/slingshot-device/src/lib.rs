// SPDX-License-Identifier: Apache-2.0
//! Abstraction over the privileged Cassini NIC device API: CXI service
//! lifecycle management (used by the `slingshot` CLI's prolog/epilog/clean,
//! and by the shell plugin to match a job's VNI reservation to a CXI
//! service per device) and high-speed network NIC enumeration.
//!
//! Neither trait talks to libcxi directly; a production binary supplies a
//! real implementation, while tests and the examples in this workspace use
//! [`FakeCassini`].

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the device layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// No service matched the given id or descriptor.
    #[error("no matching cxi service")]
    NotFound,
    /// The device rejected the operation because a resource is in use.
    #[error("device busy")]
    Busy,
    /// The underlying device API returned an error.
    #[error("device error: {0}")]
    Other(String),
}

/// Resource limits granted to a CXI service, scaled by job core count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLimits {
    /// Transmit command queues.
    pub txqs: ResourceLimit,
    /// Target command queues.
    pub tgqs: ResourceLimit,
    /// Event queues.
    pub eqs: ResourceLimit,
    /// Counters.
    pub cts: ResourceLimit,
    /// Trigger list entries.
    pub tles: ResourceLimit,
    /// Portals table entries.
    pub ptes: ResourceLimit,
    /// List entries.
    pub les: ResourceLimit,
    /// Address contexts.
    pub acs: ResourceLimit,
}

/// A `(max, reserved)` pair for one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    /// Hard device-wide maximum.
    pub max: u32,
    /// Amount reserved for this service.
    pub reserved: u32,
}

/// Per-core resource scaling table, grounded on the Cassini CXI service
/// limits used for prolog-time service creation: each resource class has a
/// fixed device maximum and a per-core reservation, except trigger list
/// entries (`tles`), whose maximum itself scales with core count rather
/// than being a fixed device cap.
#[must_use]
pub fn resource_limits_for_cores(ncores: u32) -> ServiceLimits {
    let cap = |max: u32, per_core: u32| ResourceLimit {
        max,
        reserved: (per_core * ncores).min(max),
    };
    ServiceLimits {
        txqs: cap(2048, 2),
        tgqs: cap(1024, 1),
        eqs: cap(2047, 2),
        cts: cap(2047, 1),
        tles: ResourceLimit {
            max: ncores,
            reserved: ncores,
        },
        ptes: cap(2048, 6),
        les: cap(16384, 16),
        acs: cap(1022, 2),
    }
}

/// A CXI service: a VNI group plus a traffic-class bitmap and resource
/// limits, bound to one Cassini device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service id, assigned by the device on creation.
    pub svc_id: Option<u32>,
    /// VNIs this service is allowed to use, in reservation order.
    pub vnis: Vec<u32>,
    /// Bitmap of allowed traffic classes.
    pub traffic_classes: u32,
    /// Resource limits for this service.
    pub limits: ServiceLimits,
    /// True for the device's built-in system service, never created or
    /// destroyed by job prolog/epilog.
    pub system: bool,
    /// The single uid this service is restricted to, if any. A
    /// prolog-created service is always restricted to its job's owner.
    pub uid: Option<u32>,
}

/// True if `desc` is a non-system service restricted to `uid` with VNIs
/// that exactly match `vnis`, in the same order. Used by `slingshot
/// epilog` to find only the services this job's own prolog created,
/// never a service belonging to another job that happens to share a VNI.
#[must_use]
pub fn match_reservation(desc: &ServiceDescriptor, uid: u32, vnis: &[u32]) -> bool {
    !desc.system && desc.uid == Some(uid) && desc.vnis == vnis
}

/// True if `desc` is a non-system service using any VNI in `pool`,
/// regardless of owner. Used by `slingshot clean` to sweep up leftover
/// services from any job, not just one with a known reservation.
#[must_use]
pub fn match_vnipool(desc: &ServiceDescriptor, pool: &std::collections::HashSet<u32>) -> bool {
    !desc.system && desc.vnis.iter().any(|v| pool.contains(v))
}

/// A single Cassini device's CXI service lifecycle.
pub trait CassiniDevice {
    /// The device name, e.g. `"cxi0"`.
    fn name(&self) -> &str;
    /// Create a new CXI service, returning its assigned id.
    fn create_service(&mut self, desc: &ServiceDescriptor) -> Result<u32, DeviceError>;
    /// Destroy the service with the given id.
    fn destroy_service(&mut self, svc_id: u32) -> Result<(), DeviceError>;
    /// List all non-system services currently configured on this device.
    fn list_services(&self) -> Vec<ServiceDescriptor>;
}

/// A high-speed network NIC, as reported to the shell plugin for job
/// environment population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsnNic {
    /// Device name, e.g. `"cxi0"`.
    pub device_name: String,
    /// NIC hardware address.
    pub address: String,
    /// NUMA node the NIC is attached to.
    pub numa_node: i16,
}

/// Enumerates the HSN NICs present on the local node.
pub trait NicEnumerator {
    /// Return all NICs visible on this node, in discovery order.
    fn nics(&self) -> Vec<HsnNic>;
}

/// An in-memory device set used by tests and as the deterministic stand-in
/// for the real Cassini device API.
#[derive(Debug, Default)]
pub struct FakeCassini {
    name: String,
    next_id: u32,
    services: Vec<ServiceDescriptor>,
    nics: Vec<HsnNic>,
}

impl FakeCassini {
    /// Create a fake device named `name` exposing `nics`.
    #[must_use]
    pub fn new(name: impl Into<String>, nics: Vec<HsnNic>) -> Self {
        Self {
            name: name.into(),
            next_id: 100,
            services: Vec::new(),
            nics,
        }
    }

    /// Load a previously-created service list verbatim, preserving each
    /// service's existing id. Used to rebuild device state from a
    /// persisted snapshot between CLI invocations.
    pub fn load_services(&mut self, services: Vec<ServiceDescriptor>) {
        self.next_id = services
            .iter()
            .filter_map(|s| s.svc_id)
            .max()
            .map_or(self.next_id, |max| max + 1);
        self.services = services;
    }
}

impl CassiniDevice for FakeCassini {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_service(&mut self, desc: &ServiceDescriptor) -> Result<u32, DeviceError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut created = desc.clone();
        created.svc_id = Some(id);
        self.services.push(created);
        Ok(id)
    }

    fn destroy_service(&mut self, svc_id: u32) -> Result<(), DeviceError> {
        let before = self.services.len();
        self.services.retain(|s| s.svc_id != Some(svc_id));
        if self.services.len() == before {
            return Err(DeviceError::NotFound);
        }
        Ok(())
    }

    fn list_services(&self) -> Vec<ServiceDescriptor> {
        self.services.iter().filter(|s| !s.system).cloned().collect()
    }
}

impl NicEnumerator for FakeCassini {
    fn nics(&self) -> Vec<HsnNic> {
        self.nics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(vnis: Vec<u32>) -> ServiceDescriptor {
        ServiceDescriptor {
            svc_id: None,
            vnis,
            traffic_classes: 0x1,
            limits: resource_limits_for_cores(4),
            system: false,
            uid: None,
        }
    }

    #[test]
    fn create_and_destroy_round_trip() {
        let mut dev = FakeCassini::new("cxi0", vec![]);
        let id = dev.create_service(&descriptor(vec![2048])).unwrap();
        assert_eq!(dev.list_services().len(), 1);
        dev.destroy_service(id).unwrap();
        assert!(dev.list_services().is_empty());
    }

    #[test]
    fn destroying_unknown_service_errors() {
        let mut dev = FakeCassini::new("cxi0", vec![]);
        assert_eq!(dev.destroy_service(999), Err(DeviceError::NotFound));
    }

    #[test]
    fn resource_limits_scale_with_cores_but_cap_at_max() {
        let small = resource_limits_for_cores(2);
        let huge = resource_limits_for_cores(10_000);
        assert!(small.txqs.reserved < huge.txqs.reserved);
        assert_eq!(huge.txqs.reserved, huge.txqs.max);
    }

    #[test]
    fn system_services_are_excluded_from_listing() {
        let mut dev = FakeCassini::new("cxi0", vec![]);
        let mut sys = descriptor(vec![1]);
        sys.system = true;
        dev.create_service(&sys).unwrap();
        assert!(dev.list_services().is_empty());
    }

    #[test]
    fn match_reservation_requires_owner_and_exact_vni_order() {
        let mut desc = descriptor(vec![2048, 2049]);
        desc.uid = Some(42);
        assert!(match_reservation(&desc, 42, &[2048, 2049]));
        assert!(!match_reservation(&desc, 7, &[2048, 2049]));
        assert!(!match_reservation(&desc, 42, &[2049, 2048]));
    }

    #[test]
    fn match_reservation_rejects_system_services() {
        let mut desc = descriptor(vec![2048]);
        desc.uid = Some(42);
        desc.system = true;
        assert!(!match_reservation(&desc, 42, &[2048]));
    }

    #[test]
    fn match_vnipool_ignores_owner_and_accepts_any_overlap() {
        let mut desc = descriptor(vec![2048, 3000]);
        desc.uid = Some(42);
        let pool = std::collections::HashSet::from([3000, 4000]);
        assert!(match_vnipool(&desc, &pool));
        let disjoint = std::collections::HashSet::from([9999]);
        assert!(!match_vnipool(&desc, &disjoint));
    }
}
