//! Cycle-exact MOS 6502 simulation over the Visual6502 transistor netlist.
//!
//! Rather than interpreting instructions, this crate drives the 6502's
//! actual transistor network (via [`silica_net`]) half a clock cycle at a
//! time. Every observable behaviour of the NMOS 6502 — documented and
//! undocumented opcodes, bus timing, internal register movement — falls out
//! of the netlist.
//!
//! The netlist tables themselves are opaque external data, loaded from
//! files by the [`data`] module. The [`Chip`] wraps the simulation together
//! with 64 KiB of memory and exposes the package pins and register bits as
//! typed accessors.
//!
//! # Example
//!
//! ```no_run
//! use silica_6502::{Chip, data};
//!
//! let netlist = data::load_default()?;
//! let mut chip = Chip::new(netlist)?;
//!
//! // Reset vector -> $F000, with an infinite loop there.
//! chip.poke(0xFFFC, 0x00);
//! chip.poke(0xFFFD, 0xF0);
//! chip.poke(0xF000, 0x4C);
//! chip.poke(0xF001, 0x00);
//! chip.poke(0xF002, 0xF0);
//!
//! chip.reset();
//! for _ in 0..100 {
//!     chip.step();
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod chip;
pub mod data;
pub mod nodes;

pub use chip::{Chip, ChipError, RAM_SIZE};
pub use silica_net::{Netlist, Sim};
