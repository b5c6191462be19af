//! The chip driver: reset sequencing, half-cycle stepping, and the bus
//! interface between the simulated pins and host RAM.

use std::collections::VecDeque;
use std::fmt::Write as _;

use silica_net::{Netlist, NodeId, Sim};

use crate::nodes;

/// Size of the flat simulated memory.
pub const RAM_SIZE: usize = 0x1_0000;

/// Chip construction error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChipError {
    /// The netlist does not contain the 6502's named nodes.
    #[error("netlist has {0} nodes, fewer than the 6502 requires")]
    NetlistTooSmall(usize),
}

/// A MOS 6502 driven at the transistor level, together with its 64 KiB of
/// memory.
///
/// One [`step`](Chip::step) is half a clock cycle: the clock input is
/// inverted, the netlist restabilises, and on the half-cycle where the clock
/// has just risen the memory transaction for the current bus state is
/// performed.
#[derive(Debug)]
pub struct Chip {
    sim: Sim,
    ram: Box<[u8; RAM_SIZE]>,
    cycle: u64,
    /// Forced data-bus bytes for upcoming reads, keyed by address and
    /// consumed in order. Used by the trap monitor to turn a zero-page
    /// instruction fetch into a jump without touching RAM.
    forced_reads: VecDeque<(u16, u8)>,
}

impl Chip {
    /// Build a chip over the given netlist.
    ///
    /// # Errors
    ///
    /// Fails when the netlist is too small to contain the named 6502 nodes.
    pub fn new(netlist: Netlist) -> Result<Self, ChipError> {
        if netlist.node_count() <= nodes::max_named_node() {
            return Err(ChipError::NetlistTooSmall(netlist.node_count()));
        }
        Ok(Self {
            sim: Sim::new(netlist),
            ram: Box::new([0u8; RAM_SIZE]),
            cycle: 0,
            forced_reads: VecDeque::new(),
        })
    }

    /// Run the documented power-on sequence: clear all node and transistor
    /// state, drive the control inputs, restabilise, hold reset low for 16
    /// half-cycles, release it, and zero the cycle counter.
    ///
    /// RAM is left untouched, so the reset vector at $FFFC/$FFFD must be in
    /// place before calling this.
    pub fn reset(&mut self) {
        self.sim.clear_state();

        self.sim.set_node(nodes::RES, false);
        self.sim.set_node(nodes::CLK0, true);
        self.sim.set_node(nodes::RDY, true);
        self.sim.set_node(nodes::SO, false);
        self.sim.set_node(nodes::IRQ, true);
        self.sim.set_node(nodes::NMI, false);

        self.sim.recalc_all();

        for _ in 0..16 {
            self.step();
        }

        self.sim.set_node(nodes::RES, true);

        self.cycle = 0;
        self.forced_reads.clear();
    }

    /// Advance one half-cycle: invert the clock input, restabilise, and
    /// perform the memory transaction when the clock has just risen.
    pub fn step(&mut self) {
        let clk = self.sim.is_high(nodes::CLK0);
        self.sim.set_node(nodes::CLK0, !clk);

        if !clk {
            self.handle_memory();
        }

        self.cycle += 1;
    }

    fn handle_memory(&mut self) {
        let addr = self.address_bus();
        if self.sim.is_high(nodes::RW) {
            let byte = self
                .take_forced_read(addr)
                .unwrap_or(self.ram[addr as usize]);
            self.write_data_bus(byte);
        } else {
            self.ram[addr as usize] = self.data_bus();
        }
    }

    fn take_forced_read(&mut self, addr: u16) -> Option<u8> {
        match self.forced_reads.front() {
            Some(&(a, byte)) if a == addr => {
                self.forced_reads.pop_front();
                Some(byte)
            }
            _ => None,
        }
    }

    /// Replace the instruction currently being fetched with `JMP target`.
    ///
    /// Re-drives the data bus with the JMP opcode for the in-flight fetch
    /// and forces the two operand reads that follow. RAM is not modified,
    /// which is the point: the zero-page trap sites double as data.
    pub fn hijack_fetch(&mut self, target: u16) {
        let pc = self.address_bus();
        let [lo, hi] = target.to_le_bytes();
        self.forced_reads.clear();
        self.forced_reads.push_back((pc.wrapping_add(1), lo));
        self.forced_reads.push_back((pc.wrapping_add(2), hi));
        self.write_data_bus(0x4C);
    }

    /// Half-cycles elapsed since reset.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Whether the chip is presenting an instruction fetch this half-cycle:
    /// clock high, sync high, read/write high. Trap detection keys off
    /// this.
    pub fn in_fetch_cycle(&self) -> bool {
        self.clk() && self.sync() && self.rw()
    }

    // ----- pin inspection ---------------------------------------------

    /// Level of the clock input.
    pub fn clk(&self) -> bool {
        self.sim.is_high(nodes::CLK0)
    }

    /// Level of the read/write pin (high = read).
    pub fn rw(&self) -> bool {
        self.sim.is_high(nodes::RW)
    }

    /// Level of the sync pin (high = opcode fetch in progress).
    pub fn sync(&self) -> bool {
        self.sim.is_high(nodes::SYNC)
    }

    /// The 16 address pins as an unsigned integer.
    pub fn address_bus(&self) -> u16 {
        u16::from_le_bytes([
            self.read_octet(&nodes::ADDR_BUS_LO),
            self.read_octet(&nodes::ADDR_BUS_HI),
        ])
    }

    /// The 8 data pins as a byte.
    pub fn data_bus(&self) -> u8 {
        self.read_octet(&nodes::DATA_BUS)
    }

    /// Drive the data pins from a byte, restabilising after each pin.
    pub fn write_data_bus(&mut self, mut value: u8) {
        for &node in &nodes::DATA_BUS {
            self.sim.set_node(node, value & 1 == 1);
            value >>= 1;
        }
    }

    // ----- register extraction ----------------------------------------

    /// Accumulator.
    pub fn read_a(&self) -> u8 {
        self.read_octet(&nodes::REG_A)
    }

    /// X index register.
    pub fn read_x(&self) -> u8 {
        self.read_octet(&nodes::REG_X)
    }

    /// Y index register.
    pub fn read_y(&self) -> u8 {
        self.read_octet(&nodes::REG_Y)
    }

    /// Stack pointer.
    pub fn read_sp(&self) -> u8 {
        self.read_octet(&nodes::REG_S)
    }

    /// Status register.
    pub fn read_p(&self) -> u8 {
        self.read_octet(&nodes::REG_P)
    }

    /// Program counter low byte.
    pub fn read_pcl(&self) -> u8 {
        self.read_octet(&nodes::REG_PCL)
    }

    /// Program counter high byte.
    pub fn read_pch(&self) -> u8 {
        self.read_octet(&nodes::REG_PCH)
    }

    /// Program counter.
    pub fn read_pc(&self) -> u16 {
        u16::from_le_bytes([self.read_pcl(), self.read_pch()])
    }

    /// Instruction register. Stored inverted on the die.
    pub fn read_ir(&self) -> u8 {
        self.read_octet(&nodes::REG_NOT_IR) ^ 0xFF
    }

    fn read_octet(&self, group: &[NodeId; 8]) -> u8 {
        group
            .iter()
            .enumerate()
            .fold(0, |byte, (bit, &node)| {
                byte | (u8::from(self.sim.is_high(node)) << bit)
            })
    }

    // ----- memory ------------------------------------------------------

    /// The full 64 KiB memory image.
    pub fn ram(&self) -> &[u8; RAM_SIZE] {
        &self.ram
    }

    /// Mutable access to the memory image.
    pub fn ram_mut(&mut self) -> &mut [u8; RAM_SIZE] {
        &mut self.ram
    }

    /// Read one byte of memory without touching the bus.
    pub fn peek(&self, addr: u16) -> u8 {
        self.ram[addr as usize]
    }

    /// Write one byte of memory without touching the bus.
    pub fn poke(&mut self, addr: u16, value: u8) {
        self.ram[addr as usize] = value;
    }

    // ----- introspection -----------------------------------------------

    /// The underlying netlist simulation, for fault injection and
    /// invariant checks.
    pub fn sim_mut(&mut self) -> &mut Sim {
        &mut self.sim
    }

    /// Shared access to the underlying simulation.
    pub fn sim(&self) -> &Sim {
        &self.sim
    }

    /// One-line dump of the externally visible chip state, in the classic
    /// half-cycle trace format.
    pub fn status_line(&self) -> String {
        let clk = self.clk();
        let addr = self.address_bus();
        let data = self.data_bus();

        let mut line = String::with_capacity(96);
        write!(
            line,
            "halfcyc:{} phi0:{} AB:{:04X} D:{:02X} RnW:{} PC:{:04X} \
             A:{:02X} X:{:02X} Y:{:02X} SP:{:02X} P:{:02X} IR:{:02X}",
            self.cycle,
            u8::from(clk),
            addr,
            data,
            u8::from(self.rw()),
            self.read_pc(),
            self.read_a(),
            self.read_x(),
            self.read_y(),
            self.read_sp(),
            self.read_p(),
            self.read_ir(),
        )
        .unwrap();

        if clk {
            if self.rw() {
                write!(line, " R${addr:04X}=${:02X}", self.ram[addr as usize]).unwrap();
            } else {
                write!(line, " W${addr:04X}=${data:02X}").unwrap();
            }
        }

        line
    }
}
