// SPDX-License-Identifier: Apache-2.0
//! Pool of Cassini NIC Virtual Network Identifiers (VNIs), reserved per job.
//!
//! A [`VniPool`] tracks the configured universe of allocatable VNIs and hands
//! out disjoint reservations to jobs. VNIs `1` and `10` are reserved for the
//! default CXI service and are never allocatable, regardless of how the pool
//! is configured.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use std::collections::HashMap;
use slingshot_idset::{IdSet, IdSetError};
use thiserror::Error;

/// The full universe of VNIs that may ever be allocated: every value in
/// `0..=65535` except `1` and `10`, which the default CXI service owns.
pub const VNI_VALID_SET: &str = "0,2-9,11-65535";

/// The default pool spec used when no configuration is supplied.
pub const VNI_POOL_DEFAULT: &str = "1024-65535";

/// Maximum number of VNIs a single job may reserve, matching the CXI
/// service's own per-service VNI capacity.
pub const MAX_VNIS_PER_JOB: usize = 4;

/// Errors produced by [`VniPool`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VniPoolError {
    /// The configuration spec failed to decode.
    #[error("invalid vni pool spec: {0}")]
    Invalid(#[from] IdSetError),
    /// The configuration spec decoded fine but contains VNIs outside
    /// [`VNI_VALID_SET`] (e.g. the reserved VNIs `1` or `10`).
    #[error("{0} contains invalid VNIs, must be a subset of {VNI_VALID_SET}")]
    OutOfRange(String),
    /// A reservation request asked for more than [`MAX_VNIS_PER_JOB`].
    #[error("cannot reserve {0} vnis: at most {MAX_VNIS_PER_JOB} per job")]
    InvalidCount(usize),
    /// Not enough free VNIs remained to satisfy a reservation.
    #[error("failed to reserve {requested} vni{} ({available} available)", if *requested == 1 { "" } else { "s" })]
    Exhausted {
        /// Number of VNIs that were requested.
        requested: usize,
        /// Number of VNIs free in the pool at the time of the failed request.
        available: usize,
    },
    /// The job already holds a reservation.
    #[error("job {0} already has a vni reservation")]
    AlreadyReserved(String),
    /// No reservation exists for the job.
    #[error("no vni reservation for job {0}")]
    NotFound(String),
}

/// A job's current VNI reservation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Reservation {
    /// VNIs granted to the job, in allocation order.
    pub vnis: Vec<u32>,
}

impl Reservation {
    /// Render the reservation as a compact idset string.
    #[must_use]
    pub fn encode(&self) -> String {
        IdSet::from_ids(self.vnis.iter().copied()).encode()
    }
}

/// Snapshot of pool occupancy, as returned by [`VniPool::query`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolStatus {
    /// Currently configured universe, encoded.
    pub configured: String,
    /// VNIs still available for reservation, encoded.
    pub available: String,
    /// Number of jobs currently holding a reservation.
    pub nreserved_jobs: usize,
}

/// A pool of Cassini VNIs reserved per job.
#[derive(Debug, Default)]
pub struct VniPool {
    available: IdSet,
    configured: IdSet,
    reservations: HashMap<String, Reservation>,
}

impl VniPool {
    /// Create an empty pool (no VNIs available until [`configure`](Self::configure) is called).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)configure the pool from a spec string, e.g. `"1024-65535"`.
    ///
    /// The effective universe is always intersected with [`VNI_VALID_SET`].
    /// Existing reservations are preserved; VNIs they hold are removed from
    /// the newly computed available set so they cannot be double-allocated.
    /// The new state is computed off to the side and only swapped in once
    /// fully valid, so a failed configure leaves the pool untouched.
    pub fn configure(&mut self, spec: &str) -> Result<(), VniPoolError> {
        let valid = IdSet::decode(VNI_VALID_SET).map_err(VniPoolError::Invalid)?;
        let requested = IdSet::decode(spec).map_err(VniPoolError::Invalid)?;
        if !requested.is_subset(&valid) {
            return Err(VniPoolError::OutOfRange(spec.to_string()));
        }
        if requested == self.configured {
            tracing::debug!(spec, "vnipool configure is a no-op, universe unchanged");
            return Ok(());
        }
        let mut available = requested.clone();
        for reservation in self.reservations.values() {
            for &vni in &reservation.vnis {
                available.remove(vni);
            }
        }
        let mut configured = requested;
        std::mem::swap(&mut self.configured, &mut configured);
        std::mem::swap(&mut self.available, &mut available);
        tracing::info!(spec, configured = %self.configured, "vnipool configured");
        Ok(())
    }

    /// Reserve `count` VNIs for `job_id`. Errors if `count` exceeds
    /// [`MAX_VNIS_PER_JOB`], the job already holds a reservation, or the
    /// pool cannot satisfy the request.
    pub fn reserve(&mut self, job_id: &str, count: usize) -> Result<Reservation, VniPoolError> {
        if count == 0 {
            return Ok(Reservation { vnis: Vec::new() });
        }
        if count > MAX_VNIS_PER_JOB {
            return Err(VniPoolError::InvalidCount(count));
        }
        if self.reservations.contains_key(job_id) {
            return Err(VniPoolError::AlreadyReserved(job_id.to_string()));
        }
        let mut vnis = Vec::with_capacity(count);
        for _ in 0..count {
            match self.available.alloc() {
                Ok(vni) => vnis.push(vni),
                Err(_) => {
                    // Roll back whatever we already pulled before failing.
                    let available = self.available.len() + vnis.len();
                    for vni in vnis {
                        let _ = self.available.free(vni);
                    }
                    return Err(VniPoolError::Exhausted {
                        requested: count,
                        available,
                    });
                }
            }
        }
        let reservation = Reservation { vnis };
        tracing::info!(job_id, vnis = %reservation.encode(), "vnis reserved");
        self.reservations.insert(job_id.to_string(), reservation.clone());
        Ok(reservation)
    }

    /// Restore a previously-made reservation for `job_id` after rebuilding
    /// the pool from persisted state, removing its VNIs from the available
    /// set without going through round-robin allocation.
    pub fn restore(&mut self, job_id: &str, vnis: Vec<u32>) -> Result<(), VniPoolError> {
        for &vni in &vnis {
            self.available.remove(vni);
        }
        self.reservations
            .insert(job_id.to_string(), Reservation { vnis });
        Ok(())
    }

    /// Release `job_id`'s reservation, returning its VNIs to the pool.
    ///
    /// Returns [`VniPoolError::NotFound`] when the job holds no reservation;
    /// callers on epilog/cleanup paths that may run with nothing to release
    /// are expected to treat that specific error as a no-op.
    pub fn release(&mut self, job_id: &str) -> Result<(), VniPoolError> {
        let Some(reservation) = self.reservations.remove(job_id) else {
            return Err(VniPoolError::NotFound(job_id.to_string()));
        };
        for vni in reservation.vnis {
            // A released VNI may fall outside the currently configured
            // universe if the pool was reconfigured mid-job; only return it
            // if still valid.
            if self.configured.contains(vni) {
                let _ = self.available.free(vni);
            }
        }
        tracing::info!(job_id, "vni reservation released");
        Ok(())
    }

    /// Look up `job_id`'s current reservation, if any.
    #[must_use]
    pub fn lookup(&self, job_id: &str) -> Option<&Reservation> {
        self.reservations.get(job_id)
    }

    /// Look up `job_id`'s reservation, erroring if none exists.
    pub fn lookup_required(&self, job_id: &str) -> Result<&Reservation, VniPoolError> {
        self.lookup(job_id)
            .ok_or_else(|| VniPoolError::NotFound(job_id.to_string()))
    }

    /// Snapshot current pool occupancy.
    #[must_use]
    pub fn query(&self) -> PoolStatus {
        PoolStatus {
            configured: self.configured.encode(),
            available: self.available.encode(),
            nreserved_jobs: self.reservations.len(),
        }
    }
}
