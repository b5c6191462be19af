//! The signal-propagation engine: group flood-fill and fixed-point
//! recomputation of node values.

use crate::bitmap::Bitmap;
use crate::netlist::Netlist;
use crate::{NodeId, TransistorId};

/// Hard cap on fixed-point rounds per recomputation. A well-formed netlist
/// settles in a handful of rounds; hitting the cap means the netlist (or the
/// engine) is broken and the simulation cannot continue.
const MAX_ROUNDS: usize = 100;

/// Dynamic simulation state over a [`Netlist`].
///
/// Owns every mutable piece of the simulation: node pull/value bitmaps,
/// transistor conductivity, and the scratch buffers (group, work lists) that
/// are reused across recomputations. All buffers are allocated once in
/// [`Sim::new`] and cleared in place.
#[derive(Debug)]
pub struct Sim {
    netlist: Netlist,

    pullup: Bitmap,
    pulldown: Bitmap,
    value: Bitmap,
    on: Bitmap,

    // Group scratch: ordered list for iteration, bitmap for O(1) membership,
    // and the three flags accumulated while the group is built.
    group: Vec<NodeId>,
    group_bitmap: Bitmap,
    group_pullup: bool,
    group_pulldown: bool,
    group_high: bool,
    walk: Vec<NodeId>,

    // Ping-pong work lists: nodes to recompute this round / nodes whose
    // value changed this round.
    list_in: Vec<NodeId>,
    list_out: Vec<NodeId>,

    broken: Option<TransistorId>,
}

impl Sim {
    /// Create a simulation over `netlist` with every node low and every
    /// transistor off. Pull-ups are seeded from the segment table.
    pub fn new(netlist: Netlist) -> Self {
        let nodes = netlist.node_count();
        let transistors = netlist.transistor_count();

        let mut pullup = Bitmap::new(nodes);
        for n in 0..nodes {
            pullup.set(n, netlist.is_pullup(n));
        }

        Self {
            pullup,
            pulldown: Bitmap::new(nodes),
            value: Bitmap::new(nodes),
            on: Bitmap::new(transistors),
            group: Vec::with_capacity(nodes),
            group_bitmap: Bitmap::new(nodes),
            group_pullup: false,
            group_pulldown: false,
            group_high: false,
            walk: Vec::with_capacity(nodes),
            list_in: Vec::with_capacity(nodes),
            list_out: Vec::with_capacity(nodes),
            broken: None,
            netlist,
        }
    }

    /// The netlist being simulated.
    pub fn netlist(&self) -> &Netlist {
        &self.netlist
    }

    /// Current logical level of node `n`.
    #[inline]
    pub fn is_high(&self, n: NodeId) -> bool {
        self.value.get(n)
    }

    /// Current conductivity of transistor `t`.
    #[inline]
    pub fn is_on(&self, t: TransistorId) -> bool {
        self.on.get(t)
    }

    /// Externally drive node `n` high or low and propagate.
    ///
    /// Driving sets the node's pull-up and clears its pull-down (or the
    /// reverse), so the level persists until the node is driven again.
    pub fn set_node(&mut self, n: NodeId, high: bool) {
        self.pullup.set(n, high);
        self.pulldown.set(n, !high);
        self.recalc_node_list(&[n]);
    }

    /// Clear every node value and every transistor state without
    /// propagating. Used at the start of the reset sequence. A frozen
    /// transistor keeps its state.
    pub fn clear_state(&mut self) {
        let frozen = self.broken.map(|t| (t, self.on.get(t)));
        self.value.clear_all();
        self.on.clear_all();
        if let Some((t, state)) = frozen {
            self.on.set(t, state);
        }
    }

    /// Freeze (or unfreeze) one transistor: while set, writes to that
    /// transistor's conductivity are ignored. Fault-injection interface.
    pub fn set_broken_transistor(&mut self, t: Option<TransistorId>) {
        self.broken = t;
    }

    /// Recompute every node. Only needed once, at reset.
    pub fn recalc_all(&mut self) {
        let all: Vec<NodeId> = (0..self.netlist.node_count()).collect();
        self.recalc_node_list(&all);
    }

    /// Drive the network to a fixed point starting from externally altered
    /// `seeds`.
    ///
    /// Each round recomputes the group of every node on the work list; nodes
    /// whose value changed feed the next round through their dependants.
    /// Idempotent: seeding a node whose value did not change is harmless.
    ///
    /// # Panics
    ///
    /// Panics if the network fails to settle within an internal round cap;
    /// this indicates a malformed netlist, never guest-visible state.
    pub fn recalc_node_list(&mut self, seeds: &[NodeId]) {
        self.list_out.clear();
        for &n in seeds {
            self.recalc_node(n);
        }
        std::mem::swap(&mut self.list_in, &mut self.list_out);

        for _ in 0..MAX_ROUNDS {
            if self.list_in.is_empty() {
                return;
            }
            self.list_out.clear();
            for i in 0..self.list_in.len() {
                let n = self.list_in[i];
                for j in 0..self.netlist.dependants[n].len() {
                    let dep = self.netlist.dependants[n][j];
                    self.recalc_node(dep);
                }
            }
            std::mem::swap(&mut self.list_in, &mut self.list_out);
        }

        if !self.list_in.is_empty() {
            log::error!(
                "propagation did not settle after {MAX_ROUNDS} rounds ({} nodes pending)",
                self.list_in.len()
            );
            panic!("propagation did not settle after {MAX_ROUNDS} rounds");
        }
    }

    /// Recompute one group: flood-fill from `node`, decide the group value,
    /// write it back, toggle transistors whose gate changed, and collect the
    /// changed nodes for the next round.
    fn recalc_node(&mut self, node: NodeId) {
        self.build_group(node);
        let newv = self.group_value();

        for i in 0..self.group.len() {
            let n = self.group[i];
            if self.value.get(n) != newv {
                self.value.set(n, newv);
                for &t in &self.netlist.gated_by[n] {
                    // XOR keeps a frozen transistor frozen.
                    if self.broken != Some(t) {
                        self.on.toggle(t);
                    }
                }
                self.list_out.push(n);
            }
        }
    }

    /// Flood-fill the set of nodes connected to `seed` through conducting
    /// transistors. VSS and VCC join the group but are never walked
    /// through: they are sources, not conductors.
    fn build_group(&mut self, seed: NodeId) {
        self.group.clear();
        self.group_bitmap.clear_all();
        self.group_pullup = false;
        self.group_pulldown = false;
        self.group_high = false;

        self.walk.clear();
        self.walk.push(seed);
        while let Some(node) = self.walk.pop() {
            if self.group_bitmap.get(node) {
                continue;
            }
            self.group.push(node);
            self.group_bitmap.set(node, true);

            if self.pullup.get(node) {
                self.group_pullup = true;
            }
            if self.pulldown.get(node) {
                self.group_pulldown = true;
            }
            if self.value.get(node) {
                self.group_high = true;
            }

            if node == self.netlist.vss || node == self.netlist.vcc {
                continue;
            }

            for &t in &self.netlist.channels[node] {
                if self.on.get(t) {
                    let tr = self.netlist.transistors[t];
                    let other = if tr.c1 == node { tr.c2 } else { tr.c1 };
                    self.walk.push(other);
                }
            }
        }
    }

    /// The level the current group settles to, by physical dominance:
    /// ground rail, power rail, pull-down, pull-up, then stored charge.
    fn group_value(&self) -> bool {
        if self.group_bitmap.get(self.netlist.vss) {
            return false;
        }
        if self.group_bitmap.get(self.netlist.vcc) {
            return true;
        }
        if self.group_contains_pulldown() {
            return false;
        }
        if self.group_contains_pullup() {
            return true;
        }
        self.group_high
    }

    fn group_contains_pulldown(&self) -> bool {
        self.group_pulldown
    }

    fn group_contains_pullup(&self) -> bool {
        self.group_pullup
    }

    /// Find a transistor whose conductivity disagrees with its gate value.
    ///
    /// After quiescence this returns `None` for every transistor except a
    /// frozen one. Test support.
    pub fn find_inconsistency(&self) -> Option<TransistorId> {
        (0..self.netlist.transistor_count())
            .filter(|&t| self.broken != Some(t))
            .find(|&t| self.on.get(t) != self.value.get(self.netlist.transistors[t].gate))
    }

    /// Find a node whose group (nodes reachable through conducting
    /// transistors) does not share a single value. Test support.
    ///
    /// The rails are excluded from the comparison: their stored value bits
    /// are never meaningful.
    pub fn find_group_disagreement(&mut self) -> Option<NodeId> {
        for seed in 0..self.netlist.node_count() {
            self.build_group(seed);
            let mut expected: Option<bool> = None;
            for i in 0..self.group.len() {
                let n = self.group[i];
                if n == self.netlist.vss || n == self.netlist.vcc {
                    continue;
                }
                let v = self.value.get(n);
                match expected {
                    None => expected = Some(v),
                    Some(e) if e != v => return Some(n),
                    Some(_) => {}
                }
            }
        }
        None
    }
}
