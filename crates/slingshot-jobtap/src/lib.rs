// SPDX-License-Identifier: Apache-2.0
//! Per-job Slingshot state machine for the job manager's `cray-slingshot`
//! jobtap plugin: reserves VNIs at `job.state.run`, releases them at
//! `job.state.cleanup`, and answers `plugin.query` introspection calls.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use serde::{Deserialize, Serialize};
use slingshot_vnipool::{PoolStatus, Reservation, VniPool, VniPoolError, VNI_POOL_DEFAULT};
use std::collections::HashMap;
use thiserror::Error;

/// Flux job identifier.
pub type JobId = u64;

/// Upper bound on `vnis-per-job`, matching the CXI service's own
/// per-service VNI capacity.
pub const MAX_VNIS_PER_JOB: i64 = 4;

fn default_vnis_per_job() -> usize {
    1
}

fn default_vni_reserve_fatal() -> bool {
    true
}

/// Errors raised by the jobtap state machine.
#[derive(Debug, Error)]
pub enum JobtapError {
    /// The underlying VNI pool rejected the operation.
    #[error("vni pool error: {0}")]
    Pool(#[from] VniPoolError),
    /// `job.state.run` was invoked twice for the same job without an
    /// intervening cleanup.
    #[error("job {0} already has slingshot state")]
    AlreadyRunning(JobId),
    /// `conf.update` supplied a value outside its accepted range.
    #[error("{0}")]
    InvalidConfig(String),
}

/// Broker-supplied configuration for the `cray-slingshot` TOML table.
/// Loading and parsing the surrounding TOML document is the embedding
/// program's job; this struct is the `[cray-slingshot]` table's shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlingshotConfig {
    /// VNI pool spec, e.g. `"1024-65535"`. Missing or absent means "use the
    /// default pool", not a configuration error.
    #[serde(default)]
    pub vni_pool: Option<String>,
    /// Number of VNIs reserved per job when the job does not request a
    /// specific count via the `vnicount` shell option.
    #[serde(default = "default_vnis_per_job")]
    pub vnis_per_job: usize,
    /// Whether a reservation failure raises a fatal job exception (`true`)
    /// or is merely recorded as an empty reservation with a reason.
    #[serde(default = "default_vni_reserve_fatal")]
    pub vni_reserve_fatal: bool,
}

impl Default for SlingshotConfig {
    fn default() -> Self {
        Self {
            vni_pool: None,
            vnis_per_job: default_vnis_per_job(),
            vni_reserve_fatal: default_vni_reserve_fatal(),
        }
    }
}

/// The `-o cray-slingshot[.vnicount]` shell option as submitted with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellOption {
    /// No `cray-slingshot` shell option was given; fall back to
    /// `vnis-per-job`.
    Unset,
    /// `-o cray-slingshot=off`: no VNIs are reserved for this job.
    Off,
    /// `-o cray-slingshot.vnicount=N`.
    VniCount(i64),
}

/// Sink for this plugin's side effects on the job: posting the
/// `cray-slingshot` event and raising a fatal exception. Implemented by the
/// embedding job manager, which owns the actual event log and job state.
pub trait JobtapSink {
    /// Post the `cray-slingshot` event with the given JSON context for
    /// `job_id`.
    fn post_event(&mut self, job_id: JobId, context: serde_json::Value) -> Result<(), String>;
    /// Raise a fatal exception on `job_id`, attributed to this plugin.
    fn raise_exception(&mut self, job_id: JobId, message: &str);
}

/// A job's current Slingshot reservation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// No VNIs were reserved; the job runs without Slingshot isolation.
    /// Carries the reason the reservation was empty, if any was recorded.
    Empty(Option<String>),
    /// VNIs were reserved for this job.
    Reserved(Reservation),
    /// The job's reservation has been released.
    Released,
}

/// Snapshot of this plugin's configuration and pool occupancy, as answered
/// by `plugin.query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatus {
    /// Configured `vnis-per-job` default.
    pub vnis_per_job: usize,
    /// Configured `vni-reserve-fatal` setting.
    pub vni_reserve_fatal: bool,
    /// Current pool occupancy.
    pub vnipool: PoolStatus,
}

/// The jobtap plugin's in-memory state: the shared VNI pool plus each
/// running job's reservation bookkeeping.
///
/// The per-job map is diagnostic bookkeeping layered on top of the pool,
/// which remains the single source of truth for what is actually reserved.
#[derive(Debug)]
pub struct SlingshotPlugin {
    pool: VniPool,
    vnis_per_job: usize,
    vni_reserve_fatal: bool,
    jobs: HashMap<JobId, JobState>,
}

impl Default for SlingshotPlugin {
    fn default() -> Self {
        Self {
            pool: VniPool::new(),
            vnis_per_job: default_vnis_per_job(),
            vni_reserve_fatal: default_vni_reserve_fatal(),
            jobs: HashMap::new(),
        }
    }
}

impl SlingshotPlugin {
    /// A plugin with no pool configured yet, using the compiled-in defaults
    /// for `vnis-per-job` (1) and `vni-reserve-fatal` (true).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `conf.update`: (re)configure the VNI pool and per-job
    /// defaults from the broker config. A missing pool spec falls back to
    /// [`VNI_POOL_DEFAULT`] rather than failing. `vnis_per_job` outside
    /// `0..=4` is rejected without touching existing state.
    pub fn conf_update(&mut self, config: &SlingshotConfig) -> Result<(), JobtapError> {
        if i64::try_from(config.vnis_per_job).unwrap_or(i64::MAX) > MAX_VNIS_PER_JOB {
            return Err(JobtapError::InvalidConfig(format!(
                "cray-slingshot.vnis-per-job value out of range (0-{MAX_VNIS_PER_JOB})"
            )));
        }
        let spec = config.vni_pool.as_deref().unwrap_or(VNI_POOL_DEFAULT);
        self.pool.configure(spec)?;
        self.vnis_per_job = config.vnis_per_job;
        self.vni_reserve_fatal = config.vni_reserve_fatal;
        tracing::info!(spec, "slingshot conf.update applied");
        Ok(())
    }

    /// Handle `job.state.run`: resolve how many VNIs (if any) to reserve
    /// for `job_id` from its shell option, reserve them, and post the
    /// `cray-slingshot` job event describing the outcome.
    ///
    /// A fatal outcome (reservation failure with `vni-reserve-fatal` set,
    /// or a failure to post the event) is reported to `sink` as a raised
    /// job exception rather than an `Err` return, matching the embedding
    /// job manager's callback convention: the handler itself still
    /// succeeds.
    pub fn job_state_run(
        &mut self,
        job_id: JobId,
        option: ShellOption,
        sink: &mut dyn JobtapSink,
    ) -> Result<(), JobtapError> {
        if self.jobs.contains_key(&job_id) {
            return Err(JobtapError::AlreadyRunning(job_id));
        }

        if option == ShellOption::Off {
            self.finish_empty(job_id, Some("disabled by user request".to_string()), sink);
            return Ok(());
        }

        let requested = match option {
            ShellOption::VniCount(n) => n,
            ShellOption::Off | ShellOption::Unset => -1,
        };
        // Any negative count, not just the `-1` sentinel, means "unspecified".
        let vnicount = if requested < 0 {
            i64::try_from(self.vnis_per_job).unwrap_or(0)
        } else {
            requested
        };

        if vnicount == 0 {
            self.finish_empty(job_id, Some("none requested".to_string()), sink);
            return Ok(());
        }

        let count = usize::try_from(vnicount).unwrap_or(0);
        match self.pool.reserve(&job_id.to_string(), count) {
            Ok(reservation) => {
                let context = serde_json::json!({ "vnis": reservation.vnis });
                if let Err(e) = sink.post_event(job_id, context) {
                    let _ = self.pool.release(&job_id.to_string());
                    sink.raise_exception(job_id, &e);
                    return Ok(());
                }
                tracing::info!(job_id, vnis = %reservation.encode(), "job.state.run reserved vnis");
                self.jobs.insert(job_id, JobState::Reserved(reservation));
                Ok(())
            }
            Err(e) if self.vni_reserve_fatal => {
                sink.raise_exception(job_id, &e.to_string());
                Ok(())
            }
            Err(e) => {
                self.finish_empty(job_id, Some(e.to_string()), sink);
                Ok(())
            }
        }
    }

    /// Post the empty-reservation event and record [`JobState::Empty`], or
    /// raise an exception if posting itself fails.
    fn finish_empty(&mut self, job_id: JobId, reason: Option<String>, sink: &mut dyn JobtapSink) {
        let mut context = serde_json::json!({ "vnis": Vec::<u32>::new() });
        if let Some(reason) = &reason {
            context["empty-reason"] = serde_json::Value::String(reason.clone());
        }
        if let Err(e) = sink.post_event(job_id, context) {
            sink.raise_exception(job_id, &e);
            return;
        }
        self.jobs.insert(job_id, JobState::Empty(reason));
    }

    /// Handle `job.state.cleanup`: release `job_id`'s reservation, if any.
    /// A job with no recorded reservation (e.g. it ran with
    /// [`JobState::Empty`]) is not an error.
    pub fn job_state_cleanup(&mut self, job_id: JobId) -> Result<(), JobtapError> {
        match self.pool.release(&job_id.to_string()) {
            Ok(()) | Err(VniPoolError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.jobs.insert(job_id, JobState::Released);
        tracing::info!(job_id, "job.state.cleanup released vnis");
        Ok(())
    }

    /// Handle `plugin.query`: report this plugin's configuration and
    /// current pool occupancy.
    #[must_use]
    pub fn query(&self) -> PluginStatus {
        PluginStatus {
            vnis_per_job: self.vnis_per_job,
            vni_reserve_fatal: self.vni_reserve_fatal,
            vnipool: self.pool.query(),
        }
    }

    /// Look up a single job's recorded Slingshot state, for diagnostics.
    #[must_use]
    pub fn job_state(&self, job_id: JobId) -> Option<&JobState> {
        self.jobs.get(&job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<(JobId, serde_json::Value)>,
        exceptions: Vec<(JobId, String)>,
        fail_post: bool,
    }

    impl JobtapSink for RecordingSink {
        fn post_event(&mut self, job_id: JobId, context: serde_json::Value) -> Result<(), String> {
            if self.fail_post {
                return Err("broker unavailable".to_string());
            }
            self.events.push((job_id, context));
            Ok(())
        }

        fn raise_exception(&mut self, job_id: JobId, message: &str) {
            self.exceptions.push((job_id, message.to_string()));
        }
    }

    fn running_plugin() -> SlingshotPlugin {
        let mut plugin = SlingshotPlugin::new();
        plugin
            .conf_update(&SlingshotConfig {
                vni_pool: Some("1024-1031".to_string()),
                ..SlingshotConfig::default()
            })
            .unwrap();
        plugin
    }

    #[test]
    fn conf_update_falls_back_to_default_pool() {
        let mut plugin = SlingshotPlugin::new();
        plugin.conf_update(&SlingshotConfig::default()).unwrap();
        assert_eq!(plugin.query().vnipool.configured, VNI_POOL_DEFAULT);
    }

    #[test]
    fn conf_update_rejects_out_of_range_vnis_per_job() {
        let mut plugin = SlingshotPlugin::new();
        let err = plugin.conf_update(&SlingshotConfig {
            vnis_per_job: 5,
            ..SlingshotConfig::default()
        });
        assert!(matches!(err, Err(JobtapError::InvalidConfig(_))));
    }

    #[test]
    fn full_job_lifecycle() {
        let mut plugin = running_plugin();
        let mut sink = RecordingSink::default();
        plugin.job_state_run(1, ShellOption::VniCount(2), &mut sink).unwrap();
        match plugin.job_state(1) {
            Some(JobState::Reserved(r)) => assert_eq!(r.vnis.len(), 2),
            other => panic!("expected Reserved, got {other:?}"),
        }
        assert_eq!(sink.events.len(), 1);
        plugin.job_state_cleanup(1).unwrap();
        assert_eq!(plugin.job_state(1), Some(&JobState::Released));
    }

    #[test]
    fn unset_option_uses_configured_default_count() {
        let mut plugin = running_plugin();
        let mut sink = RecordingSink::default();
        plugin.job_state_run(2, ShellOption::Unset, &mut sink).unwrap();
        match plugin.job_state(2) {
            Some(JobState::Reserved(r)) => assert_eq!(r.vnis.len(), 1),
            other => panic!("expected Reserved, got {other:?}"),
        }
    }

    #[test]
    fn negative_vnicount_is_treated_as_unspecified() {
        let mut plugin = running_plugin();
        let mut sink = RecordingSink::default();
        plugin
            .job_state_run(9, ShellOption::VniCount(-5), &mut sink)
            .unwrap();
        match plugin.job_state(9) {
            Some(JobState::Reserved(r)) => assert_eq!(r.vnis.len(), 1),
            other => panic!("expected Reserved with the configured default count, got {other:?}"),
        }
    }

    #[test]
    fn zero_vnicount_is_recorded_as_empty_with_reason() {
        let mut plugin = running_plugin();
        let mut sink = RecordingSink::default();
        plugin.job_state_run(3, ShellOption::VniCount(0), &mut sink).unwrap();
        assert_eq!(
            plugin.job_state(3),
            Some(&JobState::Empty(Some("none requested".to_string())))
        );
    }

    #[test]
    fn off_option_is_recorded_as_empty_and_never_touches_the_pool() {
        let mut plugin = running_plugin();
        let mut sink = RecordingSink::default();
        plugin.job_state_run(4, ShellOption::Off, &mut sink).unwrap();
        assert_eq!(
            plugin.job_state(4),
            Some(&JobState::Empty(Some("disabled by user request".to_string())))
        );
        assert_eq!(plugin.query().vnipool.nreserved_jobs, 0);
    }

    #[test]
    fn non_fatal_exhaustion_is_recorded_as_empty_with_the_pool_error() {
        let mut plugin = SlingshotPlugin::new();
        plugin
            .conf_update(&SlingshotConfig {
                vni_pool: Some("100-100".to_string()),
                vni_reserve_fatal: false,
                ..SlingshotConfig::default()
            })
            .unwrap();
        let mut sink = RecordingSink::default();
        plugin.job_state_run(5, ShellOption::VniCount(4), &mut sink).unwrap();
        assert!(matches!(plugin.job_state(5), Some(JobState::Empty(Some(_)))));
        assert!(sink.exceptions.is_empty());
    }

    #[test]
    fn fatal_exhaustion_raises_an_exception_instead_of_reserving() {
        let mut plugin = SlingshotPlugin::new();
        plugin
            .conf_update(&SlingshotConfig {
                vni_pool: Some("100-100".to_string()),
                vni_reserve_fatal: true,
                ..SlingshotConfig::default()
            })
            .unwrap();
        let mut sink = RecordingSink::default();
        plugin.job_state_run(6, ShellOption::VniCount(4), &mut sink).unwrap();
        assert_eq!(sink.exceptions.len(), 1);
        assert_eq!(plugin.job_state(6), None);
    }

    #[test]
    fn failed_event_post_releases_the_reservation_and_raises_an_exception() {
        let mut plugin = running_plugin();
        let mut sink = RecordingSink {
            fail_post: true,
            ..RecordingSink::default()
        };
        plugin.job_state_run(7, ShellOption::VniCount(1), &mut sink).unwrap();
        assert_eq!(sink.exceptions.len(), 1);
        assert_eq!(plugin.query().vnipool.nreserved_jobs, 0);
    }

    #[test]
    fn double_run_without_cleanup_errors() {
        let mut plugin = running_plugin();
        let mut sink = RecordingSink::default();
        plugin.job_state_run(8, ShellOption::VniCount(1), &mut sink).unwrap();
        assert!(matches!(
            plugin.job_state_run(8, ShellOption::VniCount(1), &mut sink),
            Err(JobtapError::AlreadyRunning(8))
        ));
    }

    #[test]
    fn cleanup_with_no_prior_state_is_not_an_error() {
        let mut plugin = running_plugin();
        assert!(plugin.job_state_cleanup(42).is_ok());
    }
}
