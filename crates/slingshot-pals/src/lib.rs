// SPDX-License-Identifier: Apache-2.0
//! Shell-side PALS plugin: writes the apinfo file into the job's tmpdir,
//! sets the job-wide `PALS_*`/`PMI_*` environment, and (per task) sets
//! `PALS_RANKID` and optionally strips the PMI runtime's own directory out
//! of `LD_LIBRARY_PATH` so it doesn't shadow the application's MPI.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use serde::{Deserialize, Serialize};
use slingshot_apinfo::Document;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from PALS plugin operations.
#[derive(Debug, Error)]
pub enum PalsError {
    /// Apinfo encoding or file I/O failed.
    #[error("apinfo error: {0}")]
    Apinfo(#[from] slingshot_apinfo::ApinfoError),
}

/// Filename the apinfo file is written under, inside the job's tmpdir.
pub const APINFO_FILENAME: &str = "libpals_apinfo";

/// Every `PALS_*`/`PMI_*` variable this plugin ever sets, unset in one pass
/// when the plugin is not enabled for a job (via the `pmi` shell option),
/// so a stale value can't leak in from an enclosing environment.
pub const PALS_ENV_VARS: &[&str] = &[
    "PALS_NODEID",
    "PALS_RANKID",
    "PALS_APINFO",
    "PALS_APID",
    "PALS_SPOOL_DIR",
    "PALS_FD",
    "PALS_DEPTH",
    "PALS_LOCAL_RANKID",
    "PALS_LOCAL_SIZE",
    "PMI_JOBID",
    "PMI_CONTROL_PORT",
    "PMI_SHARED_SECRET",
    "PMI_LOCAL_RANK",
    "PMI_LOCAL_SIZE",
];

/// Path the apinfo file should be written to for this job.
#[must_use]
pub fn apinfo_path(job_tmpdir: &Path) -> PathBuf {
    job_tmpdir.join(APINFO_FILENAME)
}

/// Write `doc` to this job's apinfo file.
pub fn write_apinfo(doc: &Document, job_tmpdir: &Path) -> Result<(), PalsError> {
    doc.write(&apinfo_path(job_tmpdir)).map_err(PalsError::from)
}

/// A job-wide PMI control port pair and activation secret, as published on
/// the job eventlog by the `cray_pals_port_distributor` jobtap plugin. The
/// same two ports are used on every node in the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDistribution {
    /// The two PMI control ports, shared by every node in the job.
    pub ports: (u16, u16),
    /// Shared random activation secret.
    pub random_integer: u64,
}

/// How the PMI control port pair and secret were obtained for this job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmiBootstrapMode {
    /// Fixed ports and secret supplied directly via the `cray-pals.pmi-bootstrap`
    /// shell option.
    Explicit {
        /// The two PMI control ports.
        ports: (u16, u16),
        /// Activation secret.
        secret: u64,
    },
    /// No `PMI_CONTROL_PORT`/`PMI_SHARED_SECRET` are set: the job is
    /// single-node, `cray-pals.pmi-bootstrap=off` was requested, or the
    /// port-distributor jobtap plugin is not loaded (its `start` event was
    /// observed with no `cray_port_distribution` event first).
    Off,
    /// Resolved from a `cray_port_distribution` eventlog entry, already
    /// fetched by the caller.
    FromEventlog(PortDistribution),
}

/// Environment changes to apply: variables to set, and variables to unset
/// outright (as opposed to setting them to an empty string). Shared by
/// [`build_env`] and [`task_env`] so both model the same "set vs. unset"
/// distinction rather than only ever adding keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PalsEnv {
    /// Variables to set or overwrite.
    pub set: BTreeMap<String, String>,
    /// Variables to remove entirely.
    pub unset: Vec<String>,
}

/// Environment changes to apply to one spawned task.
pub type TaskEnv = PalsEnv;

/// Build the job-wide `PALS_*`/`PMI_*` environment variables, set once per
/// shell at job start (as opposed to [`task_env`], which is set once per
/// spawned task).
///
/// `PMI_CONTROL_PORT` and `PMI_SHARED_SECRET` are always unset up front so
/// an inherited value from an enclosing environment can never leak through
/// when this job has no PMI bootstrap of its own; they move to `set` when
/// `bootstrap` resolves to one.
#[must_use]
pub fn build_env(
    node_id: u32,
    job_id: u64,
    job_tmpdir: &Path,
    bootstrap: &PmiBootstrapMode,
) -> PalsEnv {
    let mut env = PalsEnv::default();
    env.set.insert("PALS_NODEID".to_string(), node_id.to_string());
    env.set.insert("PALS_APID".to_string(), job_id.to_string());
    env.set.insert(
        "PALS_SPOOL_DIR".to_string(),
        job_tmpdir.display().to_string(),
    );
    env.set.insert(
        "PALS_APINFO".to_string(),
        apinfo_path(job_tmpdir).display().to_string(),
    );

    let resolved = match bootstrap {
        PmiBootstrapMode::Off => None,
        PmiBootstrapMode::Explicit { ports, secret } => Some((*ports, *secret)),
        PmiBootstrapMode::FromEventlog(dist) => Some((dist.ports, dist.random_integer)),
    };
    match resolved {
        Some(((p0, p1), secret)) => {
            env.set
                .insert("PMI_CONTROL_PORT".to_string(), format!("{p0},{p1}"));
            env.set
                .insert("PMI_SHARED_SECRET".to_string(), secret.to_string());
        }
        None => {
            env.unset.push("PMI_CONTROL_PORT".to_string());
            env.unset.push("PMI_SHARED_SECRET".to_string());
        }
    }
    env
}

/// Build the per-task environment changes: `PALS_RANKID`, and — unless
/// `no_edit_env` is set — `pmi_library_dir` stripped out of the task's
/// inherited `LD_LIBRARY_PATH` so the PMI runtime's own library directory
/// doesn't shadow the application's MPI implementation.
#[must_use]
pub fn task_env(
    task_rank: u32,
    no_edit_env: bool,
    ld_library_path: Option<&str>,
    pmi_library_dir: Option<&str>,
) -> TaskEnv {
    let mut env = TaskEnv::default();
    env.set.insert("PALS_RANKID".to_string(), task_rank.to_string());

    if no_edit_env {
        return env;
    }
    let (Some(dir), Some(existing)) = (pmi_library_dir, ld_library_path) else {
        return env;
    };
    let before: Vec<&str> = existing.split(':').collect();
    let after: Vec<&str> = before.iter().copied().filter(|entry| *entry != dir).collect();
    if after.len() == before.len() {
        return env;
    }
    if after.is_empty() {
        env.unset.push("LD_LIBRARY_PATH".to_string());
    } else {
        env.set.insert("LD_LIBRARY_PATH".to_string(), after.join(":"));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use slingshot_apinfo::Document as ApinfoDocument;
    use std::collections::BTreeMap as Map;

    #[test]
    fn writes_apinfo_into_job_tmpdir() {
        let dir = std::env::temp_dir().join("slingshot-pals-test");
        std::fs::create_dir_all(&dir).unwrap();
        let mut doc = ApinfoDocument::create(5).unwrap();
        doc.set_hostlist(&["nid001".to_string()]);
        doc.set_taskmap(&Map::from([(0u32, vec![0u64])]), 1);
        write_apinfo(&doc, &dir).unwrap();
        assert!(apinfo_path(&dir).exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn job_env_sets_spool_dir_and_apinfo_path() {
        let tmpdir = Path::new("/tmp/flux-job-42");
        let env = build_env(0, 42, tmpdir, &PmiBootstrapMode::Off);
        assert_eq!(env.set.get("PALS_APID").map(String::as_str), Some("42"));
        assert_eq!(
            env.set.get("PALS_SPOOL_DIR").map(String::as_str),
            Some("/tmp/flux-job-42")
        );
        assert_eq!(
            env.set.get("PALS_APINFO").map(String::as_str),
            Some("/tmp/flux-job-42/libpals_apinfo")
        );
        assert!(!env.set.contains_key("PMI_CONTROL_PORT"));
        assert!(env.unset.contains(&"PMI_CONTROL_PORT".to_string()));
        assert!(env.unset.contains(&"PMI_SHARED_SECRET".to_string()));
    }

    #[test]
    fn explicit_bootstrap_sets_both_job_wide_ports() {
        let env = build_env(
            0,
            1,
            Path::new("/tmp"),
            &PmiBootstrapMode::Explicit {
                ports: (9000, 9001),
                secret: 1234,
            },
        );
        assert_eq!(
            env.set.get("PMI_CONTROL_PORT").map(String::as_str),
            Some("9000,9001")
        );
        assert_eq!(
            env.set.get("PMI_SHARED_SECRET").map(String::as_str),
            Some("1234")
        );
        assert!(env.unset.is_empty());
    }

    #[test]
    fn eventlog_bootstrap_uses_the_same_two_ports_on_every_node() {
        let dist = PortDistribution {
            ports: (9000, 9001),
            random_integer: 42,
        };
        let env0 = build_env(0, 1, Path::new("/tmp"), &PmiBootstrapMode::FromEventlog(dist));
        let env1 = build_env(1, 1, Path::new("/tmp"), &PmiBootstrapMode::FromEventlog(dist));
        assert_eq!(
            env0.set.get("PMI_CONTROL_PORT"),
            env1.set.get("PMI_CONTROL_PORT")
        );
    }

    #[test]
    fn task_env_always_sets_rankid() {
        let env = task_env(3, true, None, None);
        assert_eq!(env.set.get("PALS_RANKID").map(String::as_str), Some("3"));
        assert!(env.unset.is_empty());
    }

    #[test]
    fn task_env_strips_pmi_library_dir_from_ld_library_path() {
        let env = task_env(
            0,
            false,
            Some("/opt/cray/pmi/lib:/usr/local/lib"),
            Some("/opt/cray/pmi/lib"),
        );
        assert_eq!(
            env.set.get("LD_LIBRARY_PATH").map(String::as_str),
            Some("/usr/local/lib")
        );
    }

    #[test]
    fn task_env_unsets_ld_library_path_when_it_becomes_empty() {
        let env = task_env(0, false, Some("/opt/cray/pmi/lib"), Some("/opt/cray/pmi/lib"));
        assert!(!env.set.contains_key("LD_LIBRARY_PATH"));
        assert_eq!(env.unset, vec!["LD_LIBRARY_PATH".to_string()]);
    }

    #[test]
    fn no_edit_env_leaves_ld_library_path_untouched() {
        let env = task_env(0, true, Some("/opt/cray/pmi/lib"), Some("/opt/cray/pmi/lib"));
        assert!(env.set.get("LD_LIBRARY_PATH").is_none());
        assert!(env.unset.is_empty());
    }

    #[test]
    fn task_env_is_a_no_op_when_the_dir_is_not_present() {
        let env = task_env(0, false, Some("/usr/local/lib"), Some("/opt/cray/pmi/lib"));
        assert!(env.set.get("LD_LIBRARY_PATH").is_none());
        assert!(env.unset.is_empty());
    }
}
