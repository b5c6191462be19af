//! `cbmbasic`: Commodore 64 BASIC on a transistor-level 6502.
//!
//! Requires `cbmbasic.bin` and the netlist data files in the working
//! directory. With no arguments, runs interactively; with a script path,
//! feeds the script as keyboard input and exits after the program ran.

use std::path::PathBuf;

use anyhow::Context;
use silica_6502::{Chip, data};
use silica_cbm::{Kernal, Monitor, Runtime};

fn main() {
    env_logger::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("cbmbasic: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<i32> {
    let mut args = std::env::args_os().skip(1);
    let script = args.next().map(PathBuf::from);
    if args.next().is_some() {
        anyhow::bail!("usage: cbmbasic [script]");
    }

    let netlist = data::load_default().context("loading the 6502 netlist")?;
    let chip = Chip::new(netlist).context("building the chip")?;

    let kernal = match &script {
        Some(path) => Kernal::with_script(path)
            .with_context(|| format!("opening script {}", path.display()))?,
        None => Kernal::interactive(),
    };

    let mut runtime =
        Runtime::new(chip, Monitor::new(kernal)).context("initialising the monitor")?;
    Ok(runtime.run())
}
