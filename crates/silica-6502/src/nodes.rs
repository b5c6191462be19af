//! Node numbers of the MOS 6502 as digitised by the Visual6502 project.
//!
//! Every wire on the die has a dense index in the netlist dump; the package
//! pins and the internal register bits sit at fixed, well-known positions.
//! The numbering below is the standard Visual6502 assignment.

use silica_net::NodeId;

/// Ground rail.
pub const VSS: NodeId = 558;
/// Power rail.
pub const VCC: NodeId = 657;

/// Clock input (phi0).
pub const CLK0: NodeId = 1171;
/// Phi1 clock output.
pub const CLK1OUT: NodeId = 1163;
/// Phi2 clock output.
pub const CLK2OUT: NodeId = 421;

/// Reset input (active low).
pub const RES: NodeId = 159;
/// Ready input.
pub const RDY: NodeId = 89;
/// Set-overflow input.
pub const SO: NodeId = 1672;
/// Interrupt-request input (active low).
pub const IRQ: NodeId = 103;
/// Non-maskable-interrupt input (active low).
pub const NMI: NodeId = 1297;

/// Read/write output: high on read cycles.
pub const RW: NodeId = 1156;
/// Sync output: high during an opcode fetch.
pub const SYNC: NodeId = 539;

/// Address bus outputs ab0..ab7, LSB first.
pub const ADDR_BUS_LO: [NodeId; 8] = [268, 451, 1340, 211, 435, 736, 887, 1493];
/// Address bus outputs ab8..ab15, LSB first.
pub const ADDR_BUS_HI: [NodeId; 8] = [230, 148, 1443, 399, 1237, 349, 672, 195];
/// Bidirectional data bus pins db0..db7, LSB first.
pub const DATA_BUS: [NodeId; 8] = [1005, 82, 945, 650, 1393, 175, 1591, 1349];

/// Accumulator bits, LSB first.
pub const REG_A: [NodeId; 8] = [737, 1234, 978, 162, 727, 858, 1136, 1653];
/// X index register bits, LSB first.
pub const REG_X: [NodeId; 8] = [1216, 98, 1, 1648, 85, 589, 448, 777];
/// Y index register bits, LSB first.
pub const REG_Y: [NodeId; 8] = [64, 1148, 573, 305, 989, 615, 115, 843];
/// Stack pointer bits, LSB first.
pub const REG_S: [NodeId; 8] = [1403, 183, 81, 1532, 1702, 1098, 1212, 1435];
/// Status register bits, LSB first. Bit 5 has no physical storage on the
/// die; its slot points at node 0 and reads as whatever that wire holds.
pub const REG_P: [NodeId; 8] = [687, 1444, 1421, 439, 1119, 0, 77, 1370];
/// Program counter low byte bits, LSB first.
pub const REG_PCL: [NodeId; 8] = [1139, 1022, 655, 1359, 900, 622, 377, 1611];
/// Program counter high byte bits, LSB first.
pub const REG_PCH: [NodeId; 8] = [1670, 292, 502, 584, 948, 49, 1551, 205];
/// Instruction register bits, LSB first. Stored inverted on the die.
pub const REG_NOT_IR: [NodeId; 8] = [194, 702, 1182, 1125, 26, 1394, 895, 1320];

/// The largest node index referenced by any named pin or register bit.
/// A netlist must have more nodes than this to drive a 6502.
pub(crate) fn max_named_node() -> NodeId {
    let singles = [
        VSS, VCC, CLK0, CLK1OUT, CLK2OUT, RES, RDY, SO, IRQ, NMI, RW, SYNC,
    ];
    let groups = [
        ADDR_BUS_LO,
        ADDR_BUS_HI,
        DATA_BUS,
        REG_A,
        REG_X,
        REG_Y,
        REG_S,
        REG_P,
        REG_PCL,
        REG_PCH,
        REG_NOT_IR,
    ];
    let mut max = 0;
    for n in singles {
        max = max.max(n);
    }
    for group in groups {
        for n in group {
            max = max.max(n);
        }
    }
    max
}
