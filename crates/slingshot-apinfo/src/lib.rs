// SPDX-License-Identifier: Apache-2.0
//! Codec for the versioned PALS `apinfo` binary file, written by the
//! shell's PALS plugin at job start so that PMI and MPI runtimes can
//! discover node, NIC, task-map, and (from version 5) CXI service
//! information without a broker RPC.
//!
//! Version dispatch happens once, in [`Document`]; [`v1`] and [`v5`] hold
//! the record shapes and layout routines for each on-disk format.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

pub mod layout;
pub mod v1;
pub mod v5;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors from apinfo encoding, decoding, or validation.
#[derive(Debug, Error)]
pub enum ApinfoError {
    /// A record or section failed a consistency check.
    #[error("invalid apinfo document: {0}")]
    Invalid(String),
    /// The buffer ended before a section finished decoding.
    #[error("truncated apinfo buffer")]
    Truncated,
    /// The version tag in the header is not one this codec understands.
    #[error("unsupported apinfo version {0}")]
    UnsupportedVersion(i32),
    /// Filesystem I/O failed while reading or writing the file.
    #[error("apinfo io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed or in-progress apinfo document, dispatched by version.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// Version 1: nodes, NICs, and a task map.
    V1(v1::Document),
    /// Version 5: adds CXI comm profiles.
    V5(v5::Document),
}

impl Document {
    /// Start a new document of the requested format version.
    pub fn create(version: i32) -> Result<Self, ApinfoError> {
        match version {
            v1::VERSION => Ok(Self::V1(v1::Document::new())),
            v5::VERSION => Ok(Self::V5(v5::Document::new())),
            other => Err(ApinfoError::UnsupportedVersion(other)),
        }
    }

    /// Populate node hostnames, in rank order.
    pub fn set_hostlist(&mut self, hosts: &[String]) {
        match self {
            Self::V1(d) => d.set_hostlist(hosts),
            Self::V5(d) => d.set_hostlist(hosts),
        }
    }

    /// Populate the task map from a node index to ordered global task id
    /// list, with `cpus_per_pe` applied uniformly across the single
    /// resulting command group.
    pub fn set_taskmap(&mut self, map: &BTreeMap<u32, Vec<u64>>, cpus_per_pe: u32) {
        match self {
            Self::V1(d) => d.set_taskmap(map, cpus_per_pe),
            Self::V5(d) => d.set_taskmap(map, cpus_per_pe),
        }
    }

    /// Validate internal consistency before writing.
    pub fn check(&self) -> Result<(), ApinfoError> {
        match self {
            Self::V1(d) => d.check(),
            Self::V5(d) => d.check(),
        }
    }

    /// Serialize to this version's native binary layout.
    pub fn write_bytes(&self) -> Result<Vec<u8>, ApinfoError> {
        match self {
            Self::V1(d) => d.write_bytes(),
            Self::V5(d) => d.write_bytes(),
        }
    }

    /// Write the document to `path`, replacing any existing file.
    pub fn write(&self, path: &Path) -> Result<(), ApinfoError> {
        let bytes = self.write_bytes()?;
        fs::write(path, bytes)?;
        tracing::info!(path = %path.display(), "wrote apinfo file");
        Ok(())
    }

    /// Read and parse a document from `path`, detecting its version from
    /// the header.
    pub fn put(path: &Path) -> Result<Self, ApinfoError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Parse a document from an in-memory buffer, detecting its version
    /// from the header's leading `i32`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ApinfoError> {
        if buf.len() < 4 {
            return Err(ApinfoError::Truncated);
        }
        let version = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        match version {
            v1::VERSION => Ok(Self::V1(v1::Document::from_bytes(buf)?)),
            v5::VERSION => Ok(Self::V5(v5::Document::from_bytes(buf)?)),
            other => Err(ApinfoError::UnsupportedVersion(other)),
        }
    }

    /// Number of nodes in the document.
    #[must_use]
    pub fn nnodes(&self) -> usize {
        match self {
            Self::V1(d) => d.nodes.len(),
            Self::V5(d) => d.nodes.len(),
        }
    }

    /// Hostname of node `idx`, if present.
    #[must_use]
    pub fn hostname(&self, idx: usize) -> Option<&str> {
        match self {
            Self::V1(d) => d.nodes.get(idx).map(|n| n.hostname.as_str()),
            Self::V5(d) => d.nodes.get(idx).map(|n| n.hostname.as_str()),
        }
    }

    /// Number of tasks (PEs) in the document.
    #[must_use]
    pub fn npes(&self) -> usize {
        match self {
            Self::V1(d) => d.pes.len(),
            Self::V5(d) => d.pes.len(),
        }
    }

    /// All node hostnames, in node-index order.
    #[must_use]
    pub fn get_hostlist(&self) -> Vec<&str> {
        match self {
            Self::V1(d) => d.nodes.iter().map(|n| n.hostname.as_str()).collect(),
            Self::V5(d) => d.nodes.iter().map(|n| n.hostname.as_str()).collect(),
        }
    }

    /// Reconstruct the node index to ordered global task id map that
    /// produced this document's PE section.
    #[must_use]
    pub fn get_taskmap(&self) -> BTreeMap<u32, Vec<u64>> {
        match self {
            Self::V1(d) => taskmap_from_pes(d.pes.iter().map(|pe| (pe.localidx, pe.nodeidx))),
            Self::V5(d) => taskmap_from_pes(d.pes.iter().map(|pe| (pe.localidx, pe.nodeidx))),
        }
    }
}

fn taskmap_from_pes(pes: impl Iterator<Item = (i32, i32)>) -> BTreeMap<u32, Vec<u64>> {
    let mut map: BTreeMap<u32, Vec<(i32, u64)>> = BTreeMap::new();
    for (task_id, (localidx, nodeidx)) in pes.enumerate() {
        let nodeidx = u32::try_from(nodeidx).unwrap_or(0);
        map.entry(nodeidx).or_default().push((localidx, task_id as u64));
    }
    map.into_iter()
        .map(|(node, mut tasks)| {
            tasks.sort_by_key(|&(localidx, _)| localidx);
            (node, tasks.into_iter().map(|(_, id)| id).collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_dispatches_to_v1() {
        let mut doc = Document::create(1).unwrap();
        doc.set_hostlist(&["a".to_string(), "b".to_string()]);
        doc.set_taskmap(&BTreeMap::from([(0, vec![0, 1]), (1, vec![2, 3])]), 1);
        doc.check().unwrap();
        let bytes = doc.write_bytes().unwrap();
        let parsed = Document::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.nnodes(), 2);
        assert_eq!(parsed.npes(), 4);
        assert!(matches!(parsed, Document::V1(_)));
    }

    #[test]
    fn facade_dispatches_to_v5() {
        let mut doc = Document::create(5).unwrap();
        doc.set_hostlist(&["nid001".to_string()]);
        doc.set_taskmap(&BTreeMap::from([(0, vec![0])]), 1);
        doc.check().unwrap();
        let bytes = doc.write_bytes().unwrap();
        let parsed = Document::from_bytes(&bytes).unwrap();
        assert!(matches!(parsed, Document::V5(_)));
    }

    #[test]
    fn get_hostlist_and_get_taskmap_round_trip_through_the_facade() {
        let mut doc = Document::create(1).unwrap();
        doc.set_hostlist(&["a".to_string(), "b".to_string()]);
        let map = BTreeMap::from([(0u32, vec![0u64, 1]), (1u32, vec![2u64])]);
        doc.set_taskmap(&map, 1);
        assert_eq!(doc.get_hostlist(), vec!["a", "b"]);
        assert_eq!(doc.get_taskmap(), map);
    }

    #[test]
    fn rejects_unknown_version_on_create() {
        assert!(matches!(
            Document::create(99),
            Err(ApinfoError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn write_and_put_round_trip_through_a_file() {
        let mut doc = Document::create(5).unwrap();
        doc.set_hostlist(&["nid001".to_string()]);
        doc.set_taskmap(&BTreeMap::from([(0, vec![0])]), 1);
        let path = std::env::temp_dir().join("slingshot-apinfo-test.bin");
        doc.write(&path).unwrap();
        let read_back = Document::put(&path).unwrap();
        assert_eq!(read_back.hostname(0), Some("nid001"));
        let _ = std::fs::remove_file(path);
    }
}
