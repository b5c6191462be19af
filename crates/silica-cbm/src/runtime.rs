//! The top-level simulation loop.
//!
//! Strictly single-threaded: one half-cycle of the chip, then — if the chip
//! is presenting a rising-edge instruction fetch — one look by the monitor.
//! The monitor must observe every bus state in order and act between
//! half-cycles, which rules out running chip and monitor concurrently.

use std::path::Path;

use silica_6502::Chip;

use crate::kernal::Control;
use crate::monitor::{Monitor, MonitorError};

/// A chip wired to a KERNAL monitor.
#[derive(Debug)]
pub struct Runtime {
    chip: Chip,
    monitor: Monitor,
}

impl Runtime {
    /// Install the monitor (BASIC ROM from the working directory plus trap
    /// scaffolding), reset the chip, and wire everything together.
    ///
    /// # Errors
    ///
    /// Fails when the BASIC ROM cannot be loaded.
    pub fn new(chip: Chip, monitor: Monitor) -> Result<Self, MonitorError> {
        Self::with_rom_dir(chip, monitor, Path::new("."))
    }

    /// Like [`new`](Self::new), loading the ROM from `dir`.
    ///
    /// # Errors
    ///
    /// Fails when the BASIC ROM cannot be loaded.
    pub fn with_rom_dir(
        mut chip: Chip,
        monitor: Monitor,
        dir: &Path,
    ) -> Result<Self, MonitorError> {
        monitor.install_from(&mut chip, dir)?;
        chip.reset();
        Ok(Self { chip, monitor })
    }

    /// Run until a service requests exit. Returns the exit code.
    pub fn run(&mut self) -> i32 {
        self.run_for(u64::MAX).unwrap_or(0)
    }

    /// Run at most `max_half_cycles` half-cycles. Returns the exit code if
    /// a service requested exit, `None` if the budget ran out first.
    pub fn run_for(&mut self, max_half_cycles: u64) -> Option<i32> {
        for _ in 0..max_half_cycles {
            self.chip.step();
            log::trace!("{}", self.chip.status_line());

            if self.chip.in_fetch_cycle() {
                if let Control::Exit(code) = self.monitor.service(&mut self.chip) {
                    return Some(code);
                }
            }
        }
        None
    }

    /// The simulated chip.
    pub fn chip(&self) -> &Chip {
        &self.chip
    }

    /// Mutable access to the simulated chip.
    pub fn chip_mut(&mut self) -> &mut Chip {
        &mut self.chip
    }

    /// The trap monitor.
    pub fn monitor_mut(&mut self) -> &mut Monitor {
        &mut self.monitor
    }
}
