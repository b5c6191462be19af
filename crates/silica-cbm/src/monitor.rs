//! The KERNAL trap monitor.
//!
//! The BASIC interpreter ROM expects a KERNAL jump table at the top of the
//! address space. Instead of running a KERNAL image, every 3-byte slot in
//! the table holds `JMP $F800`, and the monitor watches the address bus for
//! instruction fetches from a trap address. When one lands, the service
//! runs on the host against the register file read straight out of the
//! chip's internal nodes, and $F800 is rewritten with a short sequence that
//! restores the (possibly modified) registers and returns to the caller.

use std::path::Path;

use silica_6502::{Chip, RAM_SIZE};

use crate::kernal::{Control, Flags, Kernal, Regs};

/// File name of the BASIC interpreter ROM, looked up in the working
/// directory.
pub const ROM_FILE: &str = "cbmbasic.bin";
/// Exact size of the BASIC ROM image.
pub const ROM_SIZE: usize = 17_591;

/// Load address of the BASIC ROM.
const ROM_BASE: usize = 0xA000;
/// Where the register-restoring return code is synthesised.
const TRAMPOLINE: u16 = 0xF800;
/// First and last KERNAL jump-table slots that are trapped.
const TABLE_FIRST: u16 = 0xFF90;
const TABLE_LAST: u16 = 0xFFF3;
/// The zero-page CHRGET/CHRGOT entry points, trapped directly because the
/// routine is self-modifying.
const CHRGET: u16 = 0x0073;
const CHRGOT: u16 = 0x0079;

/// Monitor setup error.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The BASIC ROM could not be read.
    #[error("cannot read {ROM_FILE}: {0}")]
    RomIo(#[from] std::io::Error),
    /// The BASIC ROM has the wrong size.
    #[error("{ROM_FILE} is {0} bytes, expected {ROM_SIZE}")]
    RomSize(usize),
}

/// Watches instruction fetches and services KERNAL calls on the host.
#[derive(Debug)]
pub struct Monitor {
    kernal: Kernal,
}

impl Monitor {
    /// Wrap the given KERNAL state.
    pub fn new(kernal: Kernal) -> Self {
        Self { kernal }
    }

    /// The KERNAL services, for direct access in tests.
    pub fn kernal_mut(&mut self) -> &mut Kernal {
        &mut self.kernal
    }

    /// Load the BASIC ROM from the working directory and plant the trap
    /// scaffolding.
    ///
    /// # Errors
    ///
    /// Fails when the ROM file is missing, unreadable, or the wrong size.
    pub fn install(&self, chip: &mut Chip) -> Result<(), MonitorError> {
        self.install_from(chip, Path::new("."))
    }

    /// Like [`install`](Self::install), loading the ROM from `dir`.
    ///
    /// # Errors
    ///
    /// Fails when the ROM file is missing, unreadable, or the wrong size.
    pub fn install_from(&self, chip: &mut Chip, dir: &Path) -> Result<(), MonitorError> {
        let rom = std::fs::read(dir.join(ROM_FILE))?;
        if rom.len() != ROM_SIZE {
            return Err(MonitorError::RomSize(rom.len()));
        }
        chip.ram_mut()[ROM_BASE..ROM_BASE + ROM_SIZE].copy_from_slice(&rom);
        Self::install_traps(chip);
        Ok(())
    }

    /// Plant the jump table, the reset stub, and the reset vector. Public
    /// so tests can trap without a ROM image.
    pub fn install_traps(chip: &mut Chip) {
        let ram = chip.ram_mut();
        let [tramp_lo, tramp_hi] = TRAMPOLINE.to_le_bytes();

        let mut addr = usize::from(TABLE_FIRST);
        while addr <= usize::from(TABLE_LAST) {
            ram[addr] = 0x4C; // JMP TRAMPOLINE
            ram[addr + 1] = tramp_lo;
            ram[addr + 2] = tramp_hi;
            addr += 3;
        }

        // RESET lands at $F000 on a JSR into the BASIC cold start. Cold
        // start scribbles over $01FE/$01FF, so the stack pointer must have
        // moved off the top of the stack page before it runs.
        ram[0xF000] = 0x20; // JSR $E394
        ram[0xF001] = 0x94;
        ram[0xF002] = 0xE3;

        ram[0xFFFC] = 0x00; // reset vector -> $F000
        ram[0xFFFD] = 0xF0;
    }

    /// Whether a fetch from `pc` is a trapped entry point.
    pub fn is_trap(pc: u16) -> bool {
        if pc == CHRGET || pc == CHRGOT {
            return true;
        }
        (TABLE_FIRST..=TABLE_LAST).contains(&pc) && (pc - TABLE_FIRST) % 3 == 0
    }

    /// Inspect the fetch the chip is presenting; if it is a trap, service
    /// it and synthesise the return path.
    ///
    /// Must be called between half-cycles, on a rising-edge instruction
    /// fetch (see [`Chip::in_fetch_cycle`]); each trapped fetch is then
    /// serviced exactly once.
    pub fn service(&mut self, chip: &mut Chip) -> Control {
        let pc = chip.address_bus();
        if !Self::is_trap(pc) {
            return Control::Continue;
        }

        let mut regs = Regs {
            a: chip.read_a(),
            x: chip.read_x(),
            y: chip.read_y(),
            sp: chip.read_sp(),
            p: Flags::from_bits_retain(chip.read_p()),
        };
        log::trace!(
            "trap ${pc:04X} A:{:02X} X:{:02X} Y:{:02X} SP:{:02X} P:{:02X}",
            regs.a,
            regs.x,
            regs.y,
            regs.sp,
            regs.p.bits()
        );

        let control = self.kernal.dispatch(pc, &mut regs, chip.ram_mut());

        // The register state must be in place before the chip reaches the
        // trampoline, which is several cycles away.
        write_trampoline(chip.ram_mut(), &regs);

        // The zero-page traps cannot hold a planted JMP (the CHRGET text
        // pointer lives at $7A/$7B), so the in-flight fetch is redirected
        // on the bus instead.
        if pc < 0x0100 {
            chip.hijack_fetch(TRAMPOLINE);
        }

        control
    }
}

/// `LDA #P / PHA / LDA #A / LDX #X / LDY #Y / PLP / RTS` at the trampoline
/// address. PLP/RTS rather than RTI: RTI entered this way derails the
/// netlist's program counter.
fn write_trampoline(ram: &mut [u8; RAM_SIZE], regs: &Regs) {
    let t = usize::from(TRAMPOLINE);
    ram[t..t + 11].copy_from_slice(&[
        0xA9,
        regs.p.bits(), // LDA #P
        0x48,          // PHA
        0xA9,
        regs.a, // LDA #A
        0xA2,
        regs.x, // LDX #X
        0xA0,
        regs.y, // LDY #Y
        0x28,   // PLP
        0x60,   // RTS
    ]);
}
