//! Read-only netlist tables and the adjacency index derived from them.

use std::collections::HashSet;

use crate::{NodeId, TransistorId};

/// An NMOS pass transistor: conducts between `c1` and `c2` while `gate` is
/// high.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transistor {
    /// Node controlling conductivity.
    pub gate: NodeId,
    /// First channel terminal.
    pub c1: NodeId,
    /// Second channel terminal.
    pub c2: NodeId,
}

/// Netlist construction error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetlistError {
    /// A transistor references a node outside the segment table.
    #[error("transistor {transistor} references node {node} (netlist has {nodes} nodes)")]
    NodeOutOfRange {
        /// Offending transistor index (pre-deduplication).
        transistor: usize,
        /// Offending node index.
        node: NodeId,
        /// Number of nodes in the segment table.
        nodes: usize,
    },
    /// A power rail index is outside the segment table.
    #[error("power rail node {0} out of range ({1} nodes)")]
    RailOutOfRange(NodeId, usize),
    /// VSS and VCC must be distinct.
    #[error("VSS and VCC are both node {0}")]
    RailsCollide(NodeId),
}

/// The static description of a chip: per-node pull-up polarity, the
/// transistor triples, the two power rails, and the adjacency lists derived
/// from them at construction.
///
/// Everything here is immutable after `new`; all dynamic state (node values,
/// conductivity) lives in [`crate::Sim`].
#[derive(Debug, Clone)]
pub struct Netlist {
    pub(crate) pullup: Vec<bool>,
    pub(crate) transistors: Vec<Transistor>,
    pub(crate) vss: NodeId,
    pub(crate) vcc: NodeId,
    /// For each node, the transistors it gates.
    pub(crate) gated_by: Vec<Vec<TransistorId>>,
    /// For each node, the transistors touching it on c1 or c2.
    pub(crate) channels: Vec<Vec<TransistorId>>,
    /// For each node, the deduplicated c1/c2 endpoints of every transistor
    /// it gates; the set to re-examine when the node's value changes.
    pub(crate) dependants: Vec<Vec<NodeId>>,
}

impl Netlist {
    /// Build a netlist from a segment table (`pullup[n]` is true when node
    /// `n` carries a pull-up) and transistor triples `(gate, c1, c2)`.
    ///
    /// Duplicate triples are dropped; the original chip dumps contain a few.
    ///
    /// # Errors
    ///
    /// Returns an error when a transistor or power rail references a node
    /// outside the segment table, or when the rails collide.
    pub fn new(
        pullup: Vec<bool>,
        transdefs: &[(NodeId, NodeId, NodeId)],
        vss: NodeId,
        vcc: NodeId,
    ) -> Result<Self, NetlistError> {
        let nodes = pullup.len();
        for &rail in &[vss, vcc] {
            if rail >= nodes {
                return Err(NetlistError::RailOutOfRange(rail, nodes));
            }
        }
        if vss == vcc {
            return Err(NetlistError::RailsCollide(vss));
        }

        let mut transistors = Vec::with_capacity(transdefs.len());
        let mut seen = HashSet::with_capacity(transdefs.len());
        for (i, &(gate, c1, c2)) in transdefs.iter().enumerate() {
            for node in [gate, c1, c2] {
                if node >= nodes {
                    return Err(NetlistError::NodeOutOfRange {
                        transistor: i,
                        node,
                        nodes,
                    });
                }
            }
            if seen.insert((gate, c1, c2)) {
                transistors.push(Transistor { gate, c1, c2 });
            }
        }

        let mut gated_by = vec![Vec::new(); nodes];
        let mut channels = vec![Vec::new(); nodes];
        for (t, tr) in transistors.iter().enumerate() {
            gated_by[tr.gate].push(t);
            channels[tr.c1].push(t);
            channels[tr.c2].push(t);
        }

        let mut dependants = vec![Vec::new(); nodes];
        for (n, deps) in dependants.iter_mut().enumerate() {
            for &t in &gated_by[n] {
                for endpoint in [transistors[t].c1, transistors[t].c2] {
                    if !deps.contains(&endpoint) {
                        deps.push(endpoint);
                    }
                }
            }
        }

        Ok(Self {
            pullup,
            transistors,
            vss,
            vcc,
            gated_by,
            channels,
            dependants,
        })
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.pullup.len()
    }

    /// Number of transistors after deduplication.
    pub fn transistor_count(&self) -> usize {
        self.transistors.len()
    }

    /// Whether node `n` carries a static pull-up.
    pub fn is_pullup(&self, n: NodeId) -> bool {
        self.pullup[n]
    }

    /// The ground rail.
    pub fn vss(&self) -> NodeId {
        self.vss
    }

    /// The power rail.
    pub fn vcc(&self) -> NodeId {
        self.vcc
    }

    /// The transistor triple at index `t`.
    pub fn transistor(&self, t: TransistorId) -> Transistor {
        self.transistors[t]
    }

    /// Transistors gated by node `n`.
    pub fn gated_by(&self, n: NodeId) -> &[TransistorId] {
        &self.gated_by[n]
    }

    /// Transistors whose channel touches node `n`.
    pub fn channels(&self, n: NodeId) -> &[TransistorId] {
        &self.channels[n]
    }

    /// Nodes that may be affected when node `n` changes value.
    pub fn dependants(&self, n: NodeId) -> &[NodeId] {
        &self.dependants[n]
    }
}
