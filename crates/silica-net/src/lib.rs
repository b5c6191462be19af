//! Switch-level simulation of MOS transistor netlists.
//!
//! This crate models a chip as a set of circuit nodes connected by NMOS pass
//! transistors. A transistor conducts while its gate node is high; while it
//! conducts it shorts its two channel terminals together. Node values are
//! recomputed by flood-filling the set of nodes connected through conducting
//! transistors (a *group*), deciding the group's voltage from the strongest
//! contributor (power rail, then pull resistor, then stored charge), and
//! iterating until the network reaches a fixed point.
//!
//! The engine is netlist-agnostic: anything expressible as pull-up segments
//! plus gate/c1/c2 transistor triples can be simulated, from a single
//! inverter in a unit test to the ~3,500-transistor MOS 6502.
//!
//! # Example
//!
//! ```
//! use silica_net::{Netlist, Sim};
//!
//! // Nodes: 0 = VSS, 1 = VCC, 2 = input, 3 = output (pull-up).
//! // One transistor: gate = input, channel from output to VSS.
//! let netlist = Netlist::new(
//!     vec![false, false, false, true],
//!     &[(2, 3, 0)],
//!     0,
//!     1,
//! )
//! .unwrap();
//!
//! let mut sim = Sim::new(netlist);
//! sim.recalc_all();
//!
//! sim.set_node(2, true);
//! assert!(!sim.is_high(3)); // input high pulls the output low
//!
//! sim.set_node(2, false);
//! assert!(sim.is_high(3)); // pull-up wins once the transistor is off
//! ```

mod bitmap;
mod netlist;
mod sim;

pub use bitmap::Bitmap;
pub use netlist::{Netlist, NetlistError, Transistor};
pub use sim::Sim;

/// Dense index of a circuit node.
pub type NodeId = usize;

/// Dense index of a transistor.
pub type TransistorId = usize;
