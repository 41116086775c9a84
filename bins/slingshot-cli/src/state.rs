// SPDX-License-Identifier: Apache-2.0
//! Persisted snapshot of pool and device state between CLI invocations.
//!
//! The CLI is invoked once per prolog/epilog/clean/list/jobinfo call, so it
//! has no long-lived process to hold a [`VniPool`] or device set in memory;
//! this module rebuilds both from a small JSON snapshot kept under the
//! platform config directory via `slingshot-config`/`slingshot-config-fs`.

use serde::{Deserialize, Serialize};
use slingshot_config::config::{ConfigService, ConfigStore};
use slingshot_device::{FakeCassini, ServiceDescriptor};
use slingshot_vnipool::VniPool;
use std::collections::BTreeMap;

const STATE_KEY: &str = "state";

/// On-disk snapshot of pool configuration, per-job reservations, and the
/// services created on each known device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Configured VNI pool spec, e.g. `"1024-65535"`.
    pub pool_spec: String,
    /// Job id to reserved VNI list.
    pub reservations: BTreeMap<u64, Vec<u32>>,
    /// Device name to its current (non-system) services.
    pub services: BTreeMap<String, Vec<ServiceDescriptor>>,
}

impl Snapshot {
    /// Load the snapshot, or a default (unconfigured) one if none exists.
    pub fn load<S: ConfigStore>(svc: &ConfigService<S>) -> anyhow::Result<Self> {
        Ok(svc.load(STATE_KEY)?.unwrap_or_default())
    }

    /// Persist this snapshot.
    pub fn save<S: ConfigStore>(&self, svc: &ConfigService<S>) -> anyhow::Result<()> {
        svc.save(STATE_KEY, self)?;
        Ok(())
    }

    /// Rebuild an in-memory [`VniPool`] from this snapshot.
    pub fn build_pool(&self) -> anyhow::Result<VniPool> {
        let mut pool = VniPool::new();
        let spec = if self.pool_spec.is_empty() {
            slingshot_vnipool::VNI_POOL_DEFAULT
        } else {
            self.pool_spec.as_str()
        };
        pool.configure(spec)?;
        for (job_id, vnis) in &self.reservations {
            pool.restore(&job_id.to_string(), vnis.clone())?;
        }
        Ok(pool)
    }

    /// Rebuild the known device set from this snapshot.
    pub fn build_devices(&self) -> Vec<FakeCassini> {
        self.services
            .iter()
            .map(|(name, services)| {
                let mut device = FakeCassini::new(name.clone(), vec![]);
                device.load_services(services.clone());
                device
            })
            .collect()
    }
}
