// SPDX-License-Identifier: Apache-2.0
//! apinfo file format version 1: node hostnames, NIC addresses, and a task
//! map, with no CXI comm-profile section.

use crate::layout::{Reader, Writer};
use crate::ApinfoError;
use std::collections::BTreeMap;

/// Version tag written into the header.
pub const VERSION: i32 = 1;

const HOSTNAME_WIDTH: usize = 40;
const ADDRESS_WIDTH: usize = 40;
const DEVICE_NAME_WIDTH: usize = 16;

/// NIC address family, matching `pals_address_type_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    /// IPv4 address.
    Ipv4,
    /// IPv6 address.
    Ipv6,
    /// MAC address.
    Mac,
}

impl AddressType {
    fn to_i32(self) -> i32 {
        match self {
            Self::Ipv4 => 0,
            Self::Ipv6 => 1,
            Self::Mac => 2,
        }
    }

    fn from_i32(v: i32) -> Result<Self, ApinfoError> {
        match v {
            0 => Ok(Self::Ipv4),
            1 => Ok(Self::Ipv6),
            2 => Ok(Self::Mac),
            other => Err(ApinfoError::Invalid(format!("bad address type {other}"))),
        }
    }
}

/// One compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Node id.
    pub nid: i32,
    /// Hostname, at most 39 bytes plus NUL.
    pub hostname: String,
}

/// One high-speed NIC bound to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nic {
    /// Index of the node this NIC belongs to.
    pub nodeidx: i32,
    /// Address family.
    pub address_type: AddressType,
    /// Address string.
    pub address: String,
    /// NUMA node.
    pub numa_node: i16,
    /// Device name, e.g. `"cxi0"`.
    pub device_name: String,
}

/// One MPMD command group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cmd {
    /// Number of tasks in this command.
    pub npes: i32,
    /// Tasks per node.
    pub pes_per_node: i32,
    /// CPUs per task.
    pub cpus_per_pe: i32,
}

/// One task (PE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pe {
    /// Node-local task index.
    pub localidx: i32,
    /// Command group index.
    pub cmdidx: i32,
    /// Node index the task runs on.
    pub nodeidx: i32,
}

/// A version-1 apinfo document under construction or parsed from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    /// Command groups.
    pub cmds: Vec<Cmd>,
    /// Tasks.
    pub pes: Vec<Pe>,
    /// Nodes.
    pub nodes: Vec<Node>,
    /// NICs.
    pub nics: Vec<Nic>,
}

impl Document {
    /// A new, empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate node records from a hostlist, in rank order.
    pub fn set_hostlist(&mut self, hosts: &[String]) {
        self.nodes = hosts
            .iter()
            .enumerate()
            .map(|(i, h)| Node {
                nid: i32::try_from(i).unwrap_or(i32::MAX),
                hostname: h.clone(),
            })
            .collect();
    }

    /// Populate NIC records, one per node, from address/device pairs.
    pub fn set_nics(&mut self, nics: &[(AddressType, String, i16, String)]) {
        self.nics = nics
            .iter()
            .enumerate()
            .map(|(i, (address_type, address, numa_node, device_name))| Nic {
                nodeidx: i32::try_from(i).unwrap_or(i32::MAX),
                address_type: *address_type,
                address: address.clone(),
                numa_node: *numa_node,
                device_name: device_name.clone(),
            })
            .collect();
    }

    /// Populate the task map from a node id to global-task-id list. For
    /// each node, the position of a task id within its list becomes that
    /// task's node-local index. `npes` is the total task count across all
    /// nodes; `pes_per_node` is the largest per-node count observed.
    pub fn set_taskmap(&mut self, map: &BTreeMap<u32, Vec<u64>>, cpus_per_pe: u32) {
        let npes = map.values().map(Vec::len).sum::<usize>();
        let pes_per_node = map.values().map(Vec::len).max().unwrap_or(0);
        self.cmds = vec![Cmd {
            npes: i32::try_from(npes).unwrap_or(i32::MAX),
            pes_per_node: i32::try_from(pes_per_node).unwrap_or(i32::MAX),
            cpus_per_pe: i32::try_from(cpus_per_pe).unwrap_or(i32::MAX),
        }];
        let mut pes = vec![
            Pe {
                localidx: 0,
                cmdidx: 0,
                nodeidx: 0,
            };
            npes
        ];
        for (&nodeidx, task_ids) in map {
            for (localidx, &task_id) in task_ids.iter().enumerate() {
                if let Some(slot) = pes.get_mut(task_id as usize) {
                    *slot = Pe {
                        localidx: i32::try_from(localidx).unwrap_or(i32::MAX),
                        cmdidx: 0,
                        nodeidx: i32::try_from(nodeidx).unwrap_or(i32::MAX),
                    };
                }
            }
        }
        self.pes = pes;
    }

    /// Validate internal consistency before writing.
    pub fn check(&self) -> Result<(), ApinfoError> {
        if self.nodes.is_empty() {
            return Err(ApinfoError::Invalid("no nodes set".to_string()));
        }
        let total_pes_from_cmds: i64 = self.cmds.iter().map(|c| i64::from(c.npes)).sum();
        if total_pes_from_cmds != self.pes.len() as i64 {
            return Err(ApinfoError::Invalid(
                "task map pe count does not match command npes sum".to_string(),
            ));
        }
        let mut nodes_with_a_pe = vec![false; self.nodes.len()];
        for pe in &self.pes {
            if pe.nodeidx < 0 || pe.nodeidx as usize >= self.nodes.len() {
                return Err(ApinfoError::Invalid("pe references unknown node".to_string()));
            }
            nodes_with_a_pe[pe.nodeidx as usize] = true;
        }
        if nodes_with_a_pe.iter().any(|&used| !used) {
            return Err(ApinfoError::Invalid(
                "a node has no tasks assigned to it".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to the native v1 binary layout.
    pub fn write_bytes(&self) -> Result<Vec<u8>, ApinfoError> {
        self.check()?;
        // Header is fixed-size; compute section sizes first.
        let cmd_size = 3 * 4; // three i32 fields
        let pe_size = 3 * 4;
        let node_size = 4 + HOSTNAME_WIDTH;
        let nic_size = 4 + 4 + ADDRESS_WIDTH + 2 + DEVICE_NAME_WIDTH;

        let header_size = 14 * 8; // conservatively 8-aligned slots, see below
        let mut cursor = header_size;
        let cmd_offset = cursor;
        cursor += cmd_size * self.cmds.len();
        let pe_offset = cursor;
        cursor += pe_size * self.pes.len();
        let node_offset = cursor;
        cursor += node_size * self.nodes.len();
        let nic_offset = cursor;
        cursor += nic_size * self.nics.len();
        let total_size = cursor;

        let mut w = Writer::new();
        w.i32(VERSION);
        w.u64(total_size as u64);
        w.u64(cmd_size as u64);
        w.u64(cmd_offset as u64);
        w.i32(i32::try_from(self.cmds.len()).unwrap_or(0));
        w.u64(pe_size as u64);
        w.u64(pe_offset as u64);
        w.i32(i32::try_from(self.pes.len()).unwrap_or(0));
        w.u64(node_size as u64);
        w.u64(node_offset as u64);
        w.i32(i32::try_from(self.nodes.len()).unwrap_or(0));
        w.u64(nic_size as u64);
        w.u64(nic_offset as u64);
        w.i32(i32::try_from(self.nics.len()).unwrap_or(0));

        for c in &self.cmds {
            w.i32(c.npes).i32(c.pes_per_node).i32(c.cpus_per_pe);
        }
        for p in &self.pes {
            w.i32(p.localidx).i32(p.cmdidx).i32(p.nodeidx);
        }
        for n in &self.nodes {
            w.i32(n.nid).fixed_str(&n.hostname, HOSTNAME_WIDTH);
        }
        for nic in &self.nics {
            w.i32(nic.nodeidx)
                .i32(nic.address_type.to_i32())
                .fixed_str(&nic.address, ADDRESS_WIDTH)
                .i16(nic.numa_node)
                .fixed_str(&nic.device_name, DEVICE_NAME_WIDTH);
        }
        Ok(w.into_bytes())
    }

    /// Parse a v1 document from its native binary layout.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ApinfoError> {
        let mut r = Reader::new(buf);
        let version = r.i32()?;
        if version != VERSION {
            return Err(ApinfoError::UnsupportedVersion(version));
        }
        let _total_size = r.u64()?;
        let _cmd_size = r.u64()?;
        let cmd_offset = r.u64()? as usize;
        let ncmds = r.i32()?;
        let _pe_size = r.u64()?;
        let pe_offset = r.u64()? as usize;
        let npes = r.i32()?;
        let _node_size = r.u64()?;
        let node_offset = r.u64()? as usize;
        let nnodes = r.i32()?;
        let _nic_size = r.u64()?;
        let nic_offset = r.u64()? as usize;
        let nnics = r.i32()?;

        let mut cmds = Vec::new();
        let mut cr = Reader::at(buf, cmd_offset);
        for _ in 0..ncmds {
            cmds.push(Cmd {
                npes: cr.i32()?,
                pes_per_node: cr.i32()?,
                cpus_per_pe: cr.i32()?,
            });
        }

        let mut pes = Vec::new();
        let mut pr = Reader::at(buf, pe_offset);
        for _ in 0..npes {
            pes.push(Pe {
                localidx: pr.i32()?,
                cmdidx: pr.i32()?,
                nodeidx: pr.i32()?,
            });
        }

        let mut nodes = Vec::new();
        let mut nr = Reader::at(buf, node_offset);
        for _ in 0..nnodes {
            let nid = nr.i32()?;
            let hostname = nr.fixed_str(HOSTNAME_WIDTH)?;
            nodes.push(Node { nid, hostname });
        }

        let mut nics = Vec::new();
        let mut nir = Reader::at(buf, nic_offset);
        for _ in 0..nnics {
            let nodeidx = nir.i32()?;
            let address_type = AddressType::from_i32(nir.i32()?)?;
            let address = nir.fixed_str(ADDRESS_WIDTH)?;
            let numa_node = nir.i16()?;
            let device_name = nir.fixed_str(DEVICE_NAME_WIDTH)?;
            nics.push(Nic {
                nodeidx,
                address_type,
                address,
                numa_node,
                device_name,
            });
        }

        Ok(Self {
            cmds,
            pes,
            nodes,
            nics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut doc = Document::new();
        doc.set_hostlist(&["node0".to_string(), "node1".to_string()]);
        doc.set_nics(&[
            (AddressType::Mac, "00:11:22:33:44:55".to_string(), 0, "cxi0".to_string()),
            (AddressType::Mac, "00:11:22:33:44:56".to_string(), 1, "cxi0".to_string()),
        ]);
        doc.set_taskmap(&BTreeMap::from([(0, vec![0, 1]), (1, vec![2, 3])]), 1);
        doc.check().unwrap();

        let bytes = doc.write_bytes().unwrap();
        let parsed = Document::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn rejects_taskmap_that_leaves_a_node_empty() {
        let mut doc = Document::new();
        doc.set_hostlist(&["node0".to_string(), "node1".to_string()]);
        doc.set_taskmap(&BTreeMap::from([(0, vec![0, 1])]), 1);
        assert!(doc.check().is_err());
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(&5i32.to_le_bytes());
        assert!(matches!(
            Document::from_bytes(&bytes),
            Err(ApinfoError::UnsupportedVersion(5))
        ));
    }

    #[test]
    fn check_rejects_empty_nodes() {
        let doc = Document::new();
        assert!(doc.check().is_err());
    }
}
