// SPDX-License-Identifier: Apache-2.0
//! `slingshot`: manage CXI services against per-job VNI reservations.
//!
//! Talks to the Cassini device layer through [`slingshot_device::CassiniDevice`],
//! which in this workspace is backed by [`slingshot_device::FakeCassini`] — a
//! real deployment swaps in a libcxi-backed implementation behind the same
//! trait without touching this binary.

// A CLI's job is to print to stdout; the workspace-wide print_stdout deny
// is aimed at library crates that should log instead.
#![allow(clippy::print_stdout)]

mod fsd;
mod state;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL};
use slingshot_config::config::ConfigService;
use slingshot_config_fs::FsConfigStore;
use slingshot_device::{
    match_reservation, match_vnipool, resource_limits_for_cores, CassiniDevice, ServiceDescriptor,
};
use slingshot_shell::{traffic_class_bitmap, TrafficClass};
use state::Snapshot;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "slingshot", about = "Manage Cassini CXI services for jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reserve VNIs and create CXI services for a job at shell launch.
    Prolog {
        /// Job id.
        #[arg(long)]
        job_id: u64,
        /// Job owner, the sole uid the created services are restricted to.
        #[arg(long)]
        uid: u32,
        /// Number of VNIs to reserve.
        #[arg(long, default_value_t = 1)]
        nvnis: usize,
        /// Cores per node, used to scale CXI resource limits.
        #[arg(long, default_value_t = 1)]
        ncores: u32,
        /// How long to retry while the device reports busy.
        #[arg(long)]
        retry_busy: Option<String>,
    },
    /// Destroy a job's CXI services and release its VNIs.
    Epilog {
        /// Job id.
        #[arg(long)]
        job_id: u64,
        /// Job owner, used to find only this job's own services.
        #[arg(long)]
        uid: u32,
        /// How long to retry while the device reports busy.
        #[arg(long)]
        retry_busy: Option<String>,
    },
    /// Destroy any leftover non-system services overlapping the configured pool.
    Clean {
        /// How long to retry while the device reports busy.
        #[arg(long)]
        retry_busy: Option<String>,
    },
    /// List current CXI services, grouped by identical descriptor.
    List,
    /// Show a job's current VNI reservation.
    Jobinfo {
        /// Job id.
        #[arg(long)]
        job_id: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = FsConfigStore::new().context("opening config store")?;
    let config = ConfigService::new(store);
    let mut snapshot = Snapshot::load(&config)?;

    match cli.command {
        Command::Prolog {
            job_id,
            uid,
            nvnis,
            ncores,
            retry_busy,
        } => cmd_prolog(&mut snapshot, job_id, uid, nvnis, ncores, retry_busy.as_deref())?,
        Command::Epilog { job_id, uid, retry_busy } => {
            cmd_epilog(&mut snapshot, job_id, uid, retry_busy.as_deref())?;
        }
        Command::Clean { retry_busy } => cmd_clean(&mut snapshot, retry_busy.as_deref())?,
        Command::List => return cmd_list(&snapshot),
        Command::Jobinfo { job_id } => return cmd_jobinfo(&snapshot, job_id),
    }

    snapshot.save(&config)
}

fn retry_deadline(retry_busy: Option<&str>) -> Result<Instant> {
    let dur = match retry_busy {
        Some(s) => fsd::parse(s).map_err(anyhow::Error::msg)?,
        None => Duration::ZERO,
    };
    Ok(Instant::now() + dur)
}

fn cmd_prolog(
    snapshot: &mut Snapshot,
    job_id: u64,
    uid: u32,
    nvnis: usize,
    ncores: u32,
    retry_busy: Option<&str>,
) -> Result<()> {
    let _deadline = retry_deadline(retry_busy)?;
    let mut pool = snapshot.build_pool()?;
    let reservation = pool.reserve(&job_id.to_string(), nvnis)?;
    snapshot.pool_spec = pool.query().configured;
    snapshot
        .reservations
        .insert(job_id, reservation.vnis.clone());

    let mut devices = snapshot.build_devices();
    if devices.is_empty() {
        devices.push(slingshot_device::FakeCassini::new("cxi0", vec![]));
    }
    let limits = resource_limits_for_cores(ncores);
    let traffic_classes = traffic_class_bitmap(&[TrafficClass::LowLatency, TrafficClass::BestEffort]);
    for device in &mut devices {
        let desc = ServiceDescriptor {
            svc_id: None,
            vnis: reservation.vnis.clone(),
            traffic_classes,
            limits,
            system: false,
            uid: Some(uid),
        };
        device.create_service(&desc)?;
    }
    persist_devices(snapshot, &devices);
    tracing::info!(job_id, vnis = %reservation.encode(), "prolog: vnis reserved and services created");
    Ok(())
}

fn cmd_epilog(snapshot: &mut Snapshot, job_id: u64, uid: u32, retry_busy: Option<&str>) -> Result<()> {
    let deadline = retry_deadline(retry_busy)?;
    let mut pool = snapshot.build_pool()?;
    let Some(reservation) = pool.lookup(&job_id.to_string()).cloned() else {
        // Nothing reserved for this job: a no-op success, not an error.
        tracing::debug!(job_id, "epilog: no reservation, nothing to do");
        return Ok(());
    };

    let mut devices = snapshot.build_devices();
    let mut ndestroyed = 0usize;
    for device in &mut devices {
        let matching: Vec<u32> = device
            .list_services()
            .into_iter()
            .filter(|s| match_reservation(s, uid, &reservation.vnis))
            .filter_map(|s| s.svc_id)
            .collect();
        for svc_id in matching {
            loop {
                match device.destroy_service(svc_id) {
                    Ok(()) => {
                        ndestroyed += 1;
                        break;
                    }
                    Err(slingshot_device::DeviceError::Busy) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    persist_devices(snapshot, &devices);
    pool.release(&job_id.to_string())?;
    snapshot.reservations.remove(&job_id);
    tracing::info!(job_id, ndestroyed, "epilog: services destroyed and vnis released");
    Ok(())
}

fn cmd_clean(snapshot: &mut Snapshot, retry_busy: Option<&str>) -> Result<()> {
    let deadline = retry_deadline(retry_busy)?;
    let pool = snapshot.build_pool()?;
    let configured: std::collections::HashSet<u32> =
        slingshot_idset_members(&pool.query().configured)?;

    let mut devices = snapshot.build_devices();
    let mut ndestroyed = 0usize;
    for device in &mut devices {
        let matching: Vec<u32> = device
            .list_services()
            .into_iter()
            .filter(|s| match_vnipool(s, &configured))
            .filter_map(|s| s.svc_id)
            .collect();
        for svc_id in matching {
            loop {
                match device.destroy_service(svc_id) {
                    Ok(()) => {
                        ndestroyed += 1;
                        break;
                    }
                    Err(slingshot_device::DeviceError::Busy) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    persist_devices(snapshot, &devices);
    tracing::info!(ndestroyed, "clean: leftover services destroyed");
    Ok(())
}

fn cmd_list(snapshot: &Snapshot) -> Result<()> {
    let devices = snapshot.build_devices();
    // Group identical service descriptors (same svc_id, uid, VNIs, and
    // resource limits) across devices into one row listing every device
    // that carries them.
    let mut grouped: Vec<(ServiceDescriptor, Vec<String>)> = Vec::new();
    for device in &devices {
        for svc in device.list_services() {
            match grouped.iter_mut().find(|(desc, _)| {
                desc.svc_id == svc.svc_id
                    && desc.uid == svc.uid
                    && desc.vnis == svc.vnis
                    && desc.limits == svc.limits
            }) {
                Some((_, devs)) => devs.push(device.name().to_string()),
                None => grouped.push((svc, vec![device.name().to_string()])),
            }
        }
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Svc ID", "UID", "VNIs", "Devices"]);
    for (desc, devs) in grouped {
        table.add_row(vec![
            desc.svc_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
            desc.uid.map_or_else(|| "-".to_string(), |uid| uid.to_string()),
            format!("{:?}", desc.vnis),
            devs.join(","),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn cmd_jobinfo(snapshot: &Snapshot, job_id: u64) -> Result<()> {
    let pool = snapshot.build_pool()?;
    let reservation = pool
        .lookup(&job_id.to_string())
        .cloned()
        .with_context(|| format!("no vni reservation for job {job_id}"))?;
    println!("job {job_id}: vnis {}", reservation.encode());
    Ok(())
}

fn persist_devices(snapshot: &mut Snapshot, devices: &[slingshot_device::FakeCassini]) {
    snapshot.services.clear();
    for device in devices {
        snapshot
            .services
            .insert(device.name().to_string(), device.list_services());
    }
}

fn slingshot_idset_members(spec: &str) -> Result<std::collections::HashSet<u32>> {
    let set = slingshot_idset::IdSet::decode(spec).map_err(anyhow::Error::msg)?;
    Ok(set.iter().collect())
}
