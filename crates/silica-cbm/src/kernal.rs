//! Host-side implementation of the KERNAL services CBMBASIC calls.
//!
//! Each service reproduces the documented behaviour of the corresponding
//! C64 KERNAL jump-table entry, mapped onto host facilities: character I/O
//! goes through the PETSCII terminal, file I/O through a 16-slot table of
//! host files, the time of day comes from the wall clock. Results travel
//! back to the chip through the captured register file — values in A/X/Y
//! and the carry flag set on failure, exactly as the ROM KERNAL signals.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::Timelike;
use rand::Rng;
use silica_6502::RAM_SIZE;

use crate::petscii::{CR, Terminal};

bitflags::bitflags! {
    /// The 6502 status register, as captured from the chip at a trap.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// Carry: set by services to signal an error.
        const C = 1 << 0;
        /// Zero.
        const Z = 1 << 1;
        /// Interrupt disable.
        const I = 1 << 2;
        /// Decimal mode.
        const D = 1 << 3;
        /// Break.
        const B = 1 << 4;
        /// Unused bit.
        const U = 1 << 5;
        /// Overflow.
        const V = 1 << 6;
        /// Negative.
        const N = 1 << 7;
    }
}

/// Register file captured at a trap and restored through the trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regs {
    /// Accumulator.
    pub a: u8,
    /// X index register.
    pub x: u8,
    /// Y index register.
    pub y: u8,
    /// Stack pointer.
    pub sp: u8,
    /// Status register.
    pub p: Flags,
}

impl Regs {
    /// Set Z and N from a result byte.
    fn set_sz(&mut self, value: u8) {
        self.p.set(Flags::Z, value == 0);
        self.p.set(Flags::N, value & 0x80 != 0);
    }

    /// Set C from a 9-bit subtraction result: carry set means no borrow.
    fn set_nc(&mut self, wide: u16) {
        self.p.set(Flags::C, wide & 0x100 == 0);
    }
}

/// Simulated KERNAL error codes, returned in A with the carry set.
pub mod errcode {
    /// No error.
    pub const NONE: u8 = 0;
    /// Logical file already open.
    pub const FILE_OPEN: u8 = 2;
    /// Logical file not open.
    pub const FILE_NOT_OPEN: u8 = 3;
    /// Host file not found.
    pub const FILE_NOT_FOUND: u8 = 4;
    /// Device did not respond.
    pub const DEVICE_NOT_PRESENT: u8 = 5;
    /// Channel is not open for input.
    pub const NOT_INPUT_FILE: u8 = 6;
    /// Channel is not open for output.
    pub const NOT_OUTPUT_FILE: u8 = 7;
    /// OPEN/LOAD/SAVE without a file name.
    pub const MISSING_FILE_NAME: u8 = 8;
    /// Logical file number outside the slot table.
    pub const ILLEGAL_DEVICE_NUMBER: u8 = 9;
}

/// Status-byte bit: timeout on read.
const ST_TIME_OUT_READ: u8 = 0x02;
/// Status-byte bit: end of file reached.
const ST_EOF: u8 = 0x40;

/// BASIC program area bounds reported by MEMBOT/MEMTOP.
const RAM_BOT: u16 = 0x0800;
const RAM_TOP: u16 = 0xA000;

/// Keystrokes injected when a script runs out: auto-start the program.
const RUN_KEYS: [u8; 4] = [b'R', b'U', b'N', CR];

/// Jiffies (1/60 s ticks) in a day.
const JIFFIES_PER_DAY: i64 = 24 * 60 * 60 * 60;

/// What the runtime loop should do after a trap was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Keep stepping the chip.
    Continue,
    /// Terminate the process with this exit code.
    Exit(i32),
}

#[derive(Debug)]
struct FileSlot {
    file: File,
    /// One byte of lookahead, so end-of-file is known before the final
    /// byte is handed to the guest.
    lookahead: Option<u8>,
}

#[derive(Debug)]
enum Input {
    Stdin,
    Script(BufReader<File>),
}

/// KERNAL state and services.
#[derive(Debug)]
pub struct Kernal {
    term: Terminal,
    input: Input,
    /// False when running a script: banner output is suppressed and the
    /// second READY prompt terminates the process.
    interactive: bool,
    ready_count: u32,
    /// Index into [`RUN_KEYS`] while the auto-start keystrokes drain.
    fakerun: Option<usize>,

    msg_flag: u8,
    status: u8,
    filename_addr: u16,
    filename_len: u16,
    lfn: u8,
    dev: u8,
    sec: u8,
    input_lfn: u8,
    output_lfn: u8,
    files: [Option<FileSlot>; 16],

    /// Jiffy-clock offset established by SETTIM, applied by RDTIM.
    tod_offset: i64,
}

impl Kernal {
    /// Interactive session: terminal on stdout, keyboard from stdin.
    pub fn interactive() -> Self {
        Self::build(Terminal::stdout(), None)
    }

    /// Script session: keyboard input comes from `path`. A leading `#`
    /// line (shebang) is skipped.
    ///
    /// # Errors
    ///
    /// Fails when the script cannot be opened or read.
    pub fn with_script(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut first = [0u8; 1];
        match file.read(&mut first) {
            Ok(1) if first[0] == b'#' => loop {
                let mut c = [0u8; 1];
                if file.read(&mut c)? == 0 || c[0] == b'\r' || c[0] == b'\n' {
                    break;
                }
            },
            Ok(_) => {
                file.seek(SeekFrom::Start(0))?;
            }
            Err(e) => return Err(e),
        }
        Ok(Self::build(Terminal::stdout(), Some(file)))
    }

    fn build(term: Terminal, script: Option<File>) -> Self {
        let interactive = script.is_none();
        Self {
            term,
            input: match script {
                Some(file) => Input::Script(BufReader::new(file)),
                None => Input::Stdin,
            },
            interactive,
            ready_count: 0,
            fakerun: None,
            msg_flag: 0,
            status: 0,
            filename_addr: 0,
            filename_len: 0,
            lfn: 0,
            dev: 0,
            sec: 0,
            input_lfn: 0,
            output_lfn: 0,
            files: std::array::from_fn(|_| None),
            tod_offset: 0,
        }
    }

    /// Swap in a different terminal (tests capture output this way).
    pub fn replace_terminal(&mut self, term: Terminal) {
        self.term = term;
    }

    /// Run the service for trap address `pc` against the captured register
    /// file and the chip's memory.
    pub fn dispatch(
        &mut self,
        pc: u16,
        regs: &mut Regs,
        ram: &mut [u8; RAM_SIZE],
    ) -> Control {
        match pc {
            0x0073 => self.chrget_common(regs, ram, true),
            0x0079 => self.chrget_common(regs, ram, false),
            0xFF90 => self.setmsg(regs),
            0xFF99 => self.memtop(regs),
            0xFF9C => self.membot(regs),
            0xFFB7 => self.readst(regs),
            0xFFBA => self.setlfs(regs),
            0xFFBD => self.setnam(regs),
            0xFFC0 => self.open(regs, ram),
            0xFFC3 => self.close(regs),
            0xFFC6 => self.chkin(regs),
            0xFFC9 => self.chkout(regs),
            0xFFCC => self.clrchn(),
            0xFFCF => return self.chrin(regs),
            0xFFD2 => self.chrout(regs, ram),
            0xFFD5 => return self.load(regs, ram),
            0xFFD8 => self.save(regs, ram),
            0xFFDB => self.settim(regs),
            0xFFDE => self.rdtim(regs),
            0xFFE1 => self.stop(regs),
            0xFFE4 => return self.getin(regs),
            0xFFE7 => self.clall(),
            0xFFF0 => self.plot(regs),
            0xFFF3 => self.iobase(regs, ram),
            // Jump-table entries BASIC never calls: registers round-trip
            // unchanged through the trampoline.
            _ => log::debug!("unhandled KERNAL entry ${pc:04X}"),
        }
        Control::Continue
    }

    // ----- character I/O ----------------------------------------------

    fn chrout(&mut self, regs: &mut Regs, ram: &mut [u8; RAM_SIZE]) {
        let a = regs.a;

        if !self.interactive {
            // Cold-start banner lines are noise in script output.
            for caller in [0xE430, 0xE43D, 0xE444] {
                if stack4(ram, regs.sp, 0xE10F, 0xAB4A, 0xAB30, caller) {
                    regs.p.remove(Flags::C);
                    return;
                }
            }
        }
        if stack4(ram, regs.sp, 0xE10F, 0xAB4A, 0xAB30, 0xA47B) {
            // The READY. prompt; its 'R' counts prompts for script mode.
            if a == b'R' {
                self.ready_count += 1;
            }
            if !self.interactive {
                regs.p.remove(Flags::C);
                return;
            }
        }
        if stack4(ram, regs.sp, 0xE10F, 0xAB4A, 0xAADC, 0xA486) {
            // The screen editor echoes CR after an entered program line;
            // the host terminal already echoed the keystroke.
            regs.p.remove(Flags::C);
            return;
        }

        if self.output_lfn != 0 {
            let Some(slot) = self.slot_mut(self.output_lfn) else {
                fail(regs, errcode::NOT_OUTPUT_FILE);
                return;
            };
            match slot.file.write_all(&[a]) {
                Ok(()) => regs.p.remove(Flags::C),
                Err(e) => {
                    log::debug!("CHROUT to file failed: {e}");
                    fail(regs, errcode::NOT_OUTPUT_FILE);
                }
            }
        } else {
            if let Err(e) = self.term.chrout(a) {
                log::warn!("terminal write failed: {e}");
            }
            regs.p.remove(Flags::C);
        }
    }

    fn chrin(&mut self, regs: &mut Regs) -> Control {
        if !self.interactive && self.ready_count >= 2 {
            return Control::Exit(0);
        }

        if self.input_lfn != 0 {
            self.file_input_byte(regs, CR);
            regs.p.remove(Flags::C);
            return Control::Continue;
        }

        let _ = self.term.flush();

        if let Some(i) = self.fakerun {
            regs.a = RUN_KEYS[i];
            if i + 1 == RUN_KEYS.len() {
                // Auto-start delivered; anything further comes from the
                // keyboard.
                self.fakerun = None;
                self.input = Input::Stdin;
            } else {
                self.fakerun = Some(i + 1);
            }
            regs.p.remove(Flags::C);
            return Control::Continue;
        }

        match &mut self.input {
            Input::Stdin => match read_one(&mut io::stdin()) {
                Some(b) => regs.a = if b == b'\n' { CR } else { b },
                None => return Control::Exit(0),
            },
            Input::Script(file) => match read_one(file) {
                Some(b) => regs.a = if b == b'\n' { CR } else { b },
                None => {
                    regs.a = 0xFF;
                    if self.ready_count == 1 {
                        regs.a = RUN_KEYS[0];
                        self.fakerun = Some(1);
                    }
                }
            },
        }
        regs.p.remove(Flags::C);
        Control::Continue
    }

    fn getin(&mut self, regs: &mut Regs) -> Control {
        if self.input_lfn != 0 {
            self.file_input_byte(regs, 199);
            regs.p.remove(Flags::C);
            return Control::Continue;
        }
        let _ = self.term.flush();
        match read_one(&mut io::stdin()) {
            Some(b) => regs.a = if b == b'\n' { CR } else { b },
            None => return Control::Exit(0),
        }
        regs.p.remove(Flags::C);
        Control::Continue
    }

    /// One byte from the current input file, through the lookahead slot.
    /// `eof_value` lands in A when the file is already exhausted.
    fn file_input_byte(&mut self, regs: &mut Regs, eof_value: u8) {
        let idx = usize::from(self.input_lfn);
        let Some(slot) = self.files.get_mut(idx).and_then(Option::as_mut) else {
            regs.a = eof_value;
            self.status |= ST_EOF;
            return;
        };

        if slot.lookahead.is_none() {
            match read_one(&mut slot.file) {
                Some(b) => slot.lookahead = Some(b),
                None => {
                    self.status |= ST_EOF | ST_TIME_OUT_READ;
                    regs.a = eof_value;
                    return;
                }
            }
        }

        regs.a = slot.lookahead.take().unwrap_or(eof_value);
        match read_one(&mut slot.file) {
            Some(b) => slot.lookahead = Some(b),
            None => self.status |= ST_EOF,
        }
    }

    // ----- file table --------------------------------------------------

    fn open(&mut self, regs: &mut Regs, ram: &[u8; RAM_SIZE]) {
        self.status = 0;
        let lfn = self.lfn;
        if usize::from(lfn) >= self.files.len() {
            fail(regs, errcode::ILLEGAL_DEVICE_NUMBER);
            return;
        }
        if self.files[usize::from(lfn)].is_some() {
            fail(regs, errcode::FILE_OPEN);
            return;
        }
        if self.filename_len == 0 {
            fail(regs, errcode::MISSING_FILE_NAME);
            return;
        }

        let name = self.filename(ram);
        let opened = if self.sec == 0 {
            File::open(&name)
        } else {
            File::create(&name)
        };
        match opened {
            Ok(file) => {
                self.files[usize::from(lfn)] = Some(FileSlot {
                    file,
                    lookahead: None,
                });
                regs.p.remove(Flags::C);
            }
            Err(e) => {
                log::debug!("OPEN {name:?} failed: {e}");
                fail(regs, errcode::FILE_NOT_FOUND);
            }
        }
    }

    fn close(&mut self, regs: &mut Regs) {
        let lfn = usize::from(self.lfn);
        if lfn >= self.files.len() || self.files[lfn].is_none() {
            fail(regs, errcode::FILE_NOT_OPEN);
            return;
        }
        self.files[lfn] = None;
        regs.p.remove(Flags::C);
    }

    fn chkin(&mut self, regs: &mut Regs) {
        self.status = 0;
        if usize::from(regs.x) >= self.files.len() {
            fail(regs, errcode::ILLEGAL_DEVICE_NUMBER);
            return;
        }
        if self.files[usize::from(regs.x)].is_none() {
            fail(regs, errcode::FILE_NOT_OPEN);
            return;
        }
        self.input_lfn = regs.x;
        regs.p.remove(Flags::C);
    }

    fn chkout(&mut self, regs: &mut Regs) {
        self.status = 0;
        if usize::from(regs.x) >= self.files.len() {
            fail(regs, errcode::ILLEGAL_DEVICE_NUMBER);
            return;
        }
        if self.files[usize::from(regs.x)].is_none() {
            fail(regs, errcode::FILE_NOT_OPEN);
            return;
        }
        self.output_lfn = regs.x;
        regs.p.remove(Flags::C);
    }

    fn clrchn(&mut self) {
        self.input_lfn = 0;
        self.output_lfn = 0;
    }

    fn clall(&mut self) {
        for slot in &mut self.files {
            *slot = None;
        }
    }

    fn slot_mut(&mut self, lfn: u8) -> Option<&mut FileSlot> {
        self.files.get_mut(usize::from(lfn))?.as_mut()
    }

    // ----- LOAD / SAVE -------------------------------------------------

    fn load(&mut self, regs: &mut Regs, ram: &mut [u8; RAM_SIZE]) -> Control {
        if regs.a != 0 {
            log::error!("LOAD with the verify flag is not implemented");
            return Control::Exit(1);
        }
        if self.filename_len == 0 {
            fail(regs, errcode::MISSING_FILE_NAME);
            return Control::Continue;
        }

        // The directory pseudo-file: synthesise a listing as a BASIC
        // program in the program area.
        if ram[usize::from(self.filename_addr)] == b'$' {
            match load_directory(ram) {
                Ok(end) => load_ok(regs, end),
                Err(e) => {
                    log::debug!("directory listing failed: {e}");
                    fail(regs, errcode::DEVICE_NOT_PRESENT);
                }
            }
            return Control::Continue;
        }

        let name = self.filename(ram);
        let Ok(meta) = fs::metadata(&name) else {
            fail(regs, errcode::FILE_NOT_FOUND);
            return Control::Continue;
        };

        // Loading a directory name changes the host working directory and
        // leaves an empty program.
        if meta.is_dir() {
            if std::env::set_current_dir(&name).is_err() {
                fail(regs, errcode::DEVICE_NOT_PRESENT);
                return Control::Continue;
            }
            ram[0x0801] = 0;
            ram[0x0802] = 0;
            load_ok(regs, 0x0803);
            return Control::Continue;
        }

        let Ok(mut file) = File::open(&name) else {
            fail(regs, errcode::FILE_NOT_FOUND);
            return Control::Continue;
        };
        let mut header = [0u8; 2];
        if file.read_exact(&mut header).is_err() {
            fail(regs, errcode::FILE_NOT_FOUND);
            return Control::Continue;
        }
        let mut start = u16::from_le_bytes(header);
        if self.sec != 0 {
            start = u16::from_le_bytes([regs.x, regs.y]);
        }
        let mut body = Vec::new();
        if file.read_to_end(&mut body).is_err() {
            fail(regs, errcode::FILE_NOT_FOUND);
            return Control::Continue;
        }

        let mut end = start;
        for &b in &body {
            ram[usize::from(end)] = b;
            if end == 0xFFFF {
                break;
            }
            end += 1;
        }

        let _ = self
            .term
            .host_line(&format!("LOADING FROM ${start:04X} to ${end:04X}"));
        load_ok(regs, end);
        Control::Continue
    }

    fn save(&mut self, regs: &mut Regs, ram: &[u8; RAM_SIZE]) {
        // A holds the zero-page location of the start-address pointer.
        let ptr = usize::from(regs.a);
        let start = u16::from_le_bytes([ram[ptr], ram[ptr + 1]]);
        let end = u16::from_le_bytes([regs.x, regs.y]);
        if end < start {
            regs.p.insert(Flags::C);
            regs.a = errcode::NONE;
            return;
        }
        if self.filename_len == 0 {
            fail(regs, errcode::MISSING_FILE_NAME);
            return;
        }
        let name = self.filename(ram);
        let Ok(mut file) = File::create(&name) else {
            fail(regs, errcode::FILE_NOT_FOUND);
            return;
        };
        let write = file
            .write_all(&start.to_le_bytes())
            .and_then(|()| file.write_all(&ram[usize::from(start)..usize::from(end)]));
        if let Err(e) = write {
            log::warn!("SAVE {name:?} failed: {e}");
        }
        regs.p.remove(Flags::C);
        regs.a = errcode::NONE;
    }

    fn filename(&self, ram: &[u8; RAM_SIZE]) -> String {
        let start = usize::from(self.filename_addr);
        let end = (start + usize::from(self.filename_len)).min(RAM_SIZE);
        String::from_utf8_lossy(&ram[start..end]).into_owned()
    }

    // ----- clock, cursor, entropy -------------------------------------

    fn rdtim(&self, regs: &mut Regs) {
        let jiffies = (now_jiffies() + self.tod_offset).rem_euclid(JIFFIES_PER_DAY) as u32;
        regs.y = (jiffies / 65536) as u8;
        regs.x = ((jiffies % 65536) / 256) as u8;
        regs.a = (jiffies % 256) as u8;
    }

    fn settim(&mut self, regs: &Regs) {
        let target =
            i64::from(regs.y) * 65536 + i64::from(regs.x) * 256 + i64::from(regs.a);
        self.tod_offset = target - now_jiffies();
    }

    fn stop(&self, regs: &mut Regs) {
        // Z set would mean the STOP key is down; there is no STOP key.
        regs.p.remove(Flags::Z);
    }

    fn plot(&self, regs: &mut Regs) {
        if regs.p.contains(Flags::C) {
            let (col, row) = self.term.cursor();
            regs.y = col;
            regs.x = row;
        } else {
            log::warn!("PLOT: setting the cursor position is not supported");
            regs.p.remove(Flags::C);
        }
    }

    fn iobase(&self, regs: &mut Regs, ram: &mut [u8; RAM_SIZE]) {
        // Only RND(0) looks here, reading the two CIA timers; feed it
        // entropy instead of simulating a CIA.
        const CIA: u16 = 0xDC00;
        let mut rng = rand::thread_rng();
        let t1: u16 = rng.gen();
        let t2: u16 = rng.gen();
        ram[usize::from(CIA + 4)..usize::from(CIA + 6)].copy_from_slice(&t1.to_le_bytes());
        ram[usize::from(CIA + 8)..usize::from(CIA + 10)].copy_from_slice(&t2.to_le_bytes());
        let [lo, hi] = CIA.to_le_bytes();
        regs.x = lo;
        regs.y = hi;
    }

    // ----- one-liners --------------------------------------------------

    fn setmsg(&mut self, regs: &mut Regs) {
        self.msg_flag = regs.a;
        regs.a = self.status;
    }

    fn memtop(&self, regs: &mut Regs) {
        if !regs.p.contains(Flags::C) {
            log::warn!("MEMTOP: setting the top of RAM is not supported");
        }
        let [lo, hi] = RAM_TOP.to_le_bytes();
        regs.x = lo;
        regs.y = hi;
    }

    fn membot(&self, regs: &mut Regs) {
        if !regs.p.contains(Flags::C) {
            log::warn!("MEMBOT: setting the bottom of RAM is not supported");
        }
        let [lo, hi] = RAM_BOT.to_le_bytes();
        regs.x = lo;
        regs.y = hi;
    }

    fn readst(&self, regs: &mut Regs) {
        regs.a = self.status;
    }

    fn setlfs(&mut self, regs: &Regs) {
        self.lfn = regs.a;
        self.dev = regs.x;
        self.sec = regs.y;
    }

    fn setnam(&mut self, regs: &Regs) {
        self.filename_addr = u16::from_le_bytes([regs.x, regs.y]);
        self.filename_len = u16::from(regs.a);
    }

    // ----- CHRGET / CHRGOT --------------------------------------------

    /// Host-side rendition of the zero-page CHRGET routine: advance the
    /// text pointer at $7A/$7B (CHRGET only), fetch the byte, and leave
    /// A and N/Z/C exactly as the 6502 code sequence would.
    fn chrget_common(&self, regs: &mut Regs, ram: &mut [u8; RAM_SIZE], inc: bool) {
        let mut advance = inc;
        loop {
            if advance {
                ram[0x7A] = ram[0x7A].wrapping_add(1);
                regs.set_sz(ram[0x7A]);
                if regs.p.contains(Flags::Z) {
                    ram[0x7B] = ram[0x7B].wrapping_add(1);
                    regs.set_sz(ram[0x7B]);
                }
            }

            let ptr = u16::from_le_bytes([ram[0x7A], ram[0x7B]]);
            regs.a = ram[usize::from(ptr)];
            regs.set_sz(regs.a);

            // CMP #$3A: colon or above returns with carry set.
            let diff = u16::from(regs.a).wrapping_sub(0x3A);
            regs.set_nc(diff);
            regs.set_sz(diff as u8);
            if regs.p.contains(Flags::C) {
                return;
            }

            // CMP #$20: a space is skipped by looping back to CHRGET.
            let diff = u16::from(regs.a).wrapping_sub(0x20);
            regs.set_nc(diff);
            regs.set_sz(diff as u8);
            if regs.p.contains(Flags::Z) {
                advance = true;
                continue;
            }
            break;
        }

        // SEC / SBC #$30 / SEC / SBC #$D0: digits come back with carry
        // clear. The V flag is not modelled; nothing downstream reads it.
        let diff = u16::from(regs.a).wrapping_sub(0x30);
        regs.a = diff as u8;
        regs.set_sz(regs.a);
        regs.set_nc(diff);
        let diff = u16::from(regs.a).wrapping_sub(0xD0);
        regs.a = diff as u8;
        regs.set_sz(regs.a);
        regs.set_nc(diff);
    }
}

/// Read a single byte, retrying on interruption. `None` on end of input.
fn read_one(reader: &mut impl Read) -> Option<u8> {
    let mut buf = [0u8; 1];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return None,
            Ok(_) => return Some(buf[0]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("input read failed: {e}");
                return None;
            }
        }
    }
}

/// Little-endian word from the simulated stack page at offset `i`.
fn stack16(ram: &[u8; RAM_SIZE], i: u8) -> u16 {
    let base = 0x0100 + usize::from(i);
    u16::from_le_bytes([ram[base], ram[base + 1]])
}

/// Match the four return addresses on the call stack; identifies which
/// CBMBASIC code path invoked CHROUT.
fn stack4(ram: &[u8; RAM_SIZE], sp: u8, a: u16, b: u16, c: u16, d: u16) -> bool {
    stack16(ram, sp.wrapping_add(1)).wrapping_add(1) == a
        && stack16(ram, sp.wrapping_add(3)).wrapping_add(1) == b
        && stack16(ram, sp.wrapping_add(5)).wrapping_add(1) == c
        && stack16(ram, sp.wrapping_add(7)).wrapping_add(1) == d
}

fn fail(regs: &mut Regs, code: u8) {
    regs.p.insert(Flags::C);
    regs.a = code;
}

fn load_ok(regs: &mut Regs, end: u16) {
    let [lo, hi] = end.to_le_bytes();
    regs.x = lo;
    regs.y = hi;
    regs.p.remove(Flags::C);
    regs.a = errcode::NONE;
}

/// Jiffies since local midnight.
fn now_jiffies() -> i64 {
    let now = chrono::Local::now();
    let seconds =
        (i64::from(now.hour()) * 60 + i64::from(now.minute())) * 60 + i64::from(now.second());
    let micros = i64::from(now.nanosecond() / 1000);
    seconds * 60 + micros / (1_000_000 / 60)
}

/// Write the directory of the host working directory as a linked BASIC
/// program at $0801: a reverse-video header line naming the directory,
/// then one line per entry with the size in 254-byte blocks as the line
/// number. Returns the end address.
fn load_directory(ram: &mut [u8; RAM_SIZE]) -> io::Result<u16> {
    let mut memp: u16 = 0x0801;

    let mut link = memp;
    memp = memp.wrapping_add(2);
    for b in [0, 0, 0x12, b'"'] {
        put(ram, &mut memp, b);
    }
    let cwd = std::env::current_dir()?;
    let cwd = cwd.to_string_lossy();
    for &b in cwd.as_bytes().iter().take(256) {
        put(ram, &mut memp, b);
    }
    for b in [b'"', b' ', b'0', b'0', b' ', b'2', b'A', 0] {
        put(ram, &mut memp, b);
    }
    patch_link(ram, link, memp);

    for entry in fs::read_dir(".")? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let blocks = ((meta.len() + 253) / 254).min(0xFFFF) as u16;

        link = memp;
        memp = memp.wrapping_add(2);
        for b in blocks.to_le_bytes() {
            put(ram, &mut memp, b);
        }
        if blocks < 1000 {
            put(ram, &mut memp, b' ');
            if blocks < 100 {
                put(ram, &mut memp, b' ');
                if blocks < 10 {
                    put(ram, &mut memp, b' ');
                }
            }
        }
        put(ram, &mut memp, b'"');
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let shown = &name.as_bytes()[..name.len().min(16)];
        for &b in shown {
            put(ram, &mut memp, b);
        }
        put(ram, &mut memp, b'"');
        for _ in shown.len()..16 {
            put(ram, &mut memp, b' ');
        }
        for b in *b" PRG  \0" {
            put(ram, &mut memp, b);
        }
        patch_link(ram, link, memp);
    }

    ram[usize::from(memp)] = 0;
    ram[usize::from(memp.wrapping_add(1))] = 0;
    Ok(memp.wrapping_add(2))
}

fn put(ram: &mut [u8; RAM_SIZE], memp: &mut u16, byte: u8) {
    ram[usize::from(*memp)] = byte;
    *memp = memp.wrapping_add(1);
}

fn patch_link(ram: &mut [u8; RAM_SIZE], link: u16, next: u16) {
    let [lo, hi] = next.to_le_bytes();
    ram[usize::from(link)] = lo;
    ram[usize::from(link.wrapping_add(1))] = hi;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    fn capture_kernal() -> (Kernal, SharedBuf) {
        let buf = SharedBuf::default();
        let mut k = Kernal::interactive();
        k.replace_terminal(Terminal::new(Box::new(buf.clone())));
        (k, buf)
    }

    fn regs() -> Regs {
        Regs {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFF,
            p: Flags::empty(),
        }
    }

    fn blank_ram() -> Box<[u8; RAM_SIZE]> {
        Box::new([0u8; RAM_SIZE])
    }

    /// Put a file name into RAM and point the SETNAM state at it.
    fn set_filename(k: &mut Kernal, ram: &mut [u8; RAM_SIZE], name: &str) {
        const AT: u16 = 0x0340;
        ram[usize::from(AT)..usize::from(AT) + name.len()]
            .copy_from_slice(name.as_bytes());
        k.filename_addr = AT;
        k.filename_len = name.len() as u16;
    }

    #[test]
    fn setlfs_and_setnam_record_parameters() {
        let (mut k, _) = capture_kernal();
        let mut r = regs();
        r.a = 2;
        r.x = 8;
        r.y = 1;
        k.setlfs(&r);
        assert_eq!((k.lfn, k.dev, k.sec), (2, 8, 1));

        r.a = 5;
        r.x = 0x40;
        r.y = 0x03;
        k.setnam(&r);
        assert_eq!(k.filename_addr, 0x0340);
        assert_eq!(k.filename_len, 5);
    }

    #[test]
    fn memtop_and_membot_report_the_basic_area() {
        let (k, _) = capture_kernal();
        let mut r = regs();
        r.p.insert(Flags::C);
        k.memtop(&mut r);
        assert_eq!(u16::from_le_bytes([r.x, r.y]), 0xA000);
        k.membot(&mut r);
        assert_eq!(u16::from_le_bytes([r.x, r.y]), 0x0800);
    }

    #[test]
    fn setmsg_returns_the_status_byte() {
        let (mut k, _) = capture_kernal();
        k.status = 0x42;
        let mut r = regs();
        r.a = 0x80;
        k.setmsg(&mut r);
        assert_eq!(k.msg_flag, 0x80);
        assert_eq!(r.a, 0x42);

        k.readst(&mut r);
        assert_eq!(r.a, 0x42);
    }

    #[test]
    fn stop_reports_no_stop_key() {
        let (k, _) = capture_kernal();
        let mut r = regs();
        r.p.insert(Flags::Z);
        k.stop(&mut r);
        assert!(!r.p.contains(Flags::Z));
    }

    #[test]
    fn chrout_emits_the_byte_and_clears_carry() {
        let (mut k, buf) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        r.a = b'A';
        r.p.insert(Flags::C);
        k.chrout(&mut r, &mut ram);
        assert_eq!(buf.bytes(), b"A");
        assert!(!r.p.contains(Flags::C));
    }

    #[test]
    fn chrout_translates_petscii() {
        let (mut k, buf) = capture_kernal();
        let mut ram = blank_ram();

        let mut r = regs();
        r.a = CR;
        k.chrout(&mut r, &mut ram);
        assert_eq!(buf.bytes(), b"\r\n");

        r.a = 147;
        k.chrout(&mut r, &mut ram);
        assert!(buf.bytes().ends_with(b"\x1b[2J\x1b[H"));
    }

    /// Plant the four return addresses CHROUT checks for on the stack.
    fn plant_callers(ram: &mut [u8; RAM_SIZE], sp: u8, addrs: [u16; 4]) {
        for (i, addr) in addrs.iter().enumerate() {
            let slot = 0x0100 + usize::from(sp) + 1 + 2 * i;
            let [lo, hi] = (addr - 1).to_le_bytes();
            ram[slot] = lo;
            ram[slot + 1] = hi;
        }
    }

    #[test]
    fn ready_prompt_counts_and_is_suppressed_in_script_mode() {
        let (mut k, buf) = capture_kernal();
        k.interactive = false;
        let mut ram = blank_ram();
        let mut r = regs();
        r.sp = 0xF0;
        plant_callers(&mut ram, r.sp, [0xE10F, 0xAB4A, 0xAB30, 0xA47B]);

        r.a = b'R';
        k.chrout(&mut r, &mut ram);
        assert_eq!(k.ready_count, 1);
        assert!(buf.bytes().is_empty(), "READY output must be swallowed");

        r.a = b'E';
        k.chrout(&mut r, &mut ram);
        assert_eq!(k.ready_count, 1, "only the R counts a prompt");
        assert!(buf.bytes().is_empty());
    }

    #[test]
    fn banner_is_printed_when_interactive() {
        let (mut k, buf) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        r.sp = 0xF0;
        plant_callers(&mut ram, r.sp, [0xE10F, 0xAB4A, 0xAB30, 0xE430]);
        r.a = b'C';
        k.chrout(&mut r, &mut ram);
        assert_eq!(buf.bytes(), b"C");
    }

    #[test]
    fn banner_is_suppressed_in_script_mode() {
        let (mut k, buf) = capture_kernal();
        k.interactive = false;
        let mut ram = blank_ram();
        let mut r = regs();
        r.sp = 0xF0;
        plant_callers(&mut ram, r.sp, [0xE10F, 0xAB4A, 0xAB30, 0xE430]);
        r.a = b'C';
        k.chrout(&mut r, &mut ram);
        assert!(buf.bytes().is_empty());
    }

    #[test]
    fn file_output_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let (mut k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();

        set_filename(&mut k, &mut ram, path.to_str().unwrap());
        k.lfn = 3;
        k.sec = 1; // secondary address non-zero: create for writing
        k.open(&mut r, &ram);
        assert!(!r.p.contains(Flags::C));

        r.x = 3;
        k.chkout(&mut r);
        assert!(!r.p.contains(Flags::C));

        for &b in b"HI" {
            r.a = b;
            k.chrout(&mut r, &mut ram);
            assert!(!r.p.contains(Flags::C));
        }

        k.clrchn();
        k.close(&mut r);
        assert!(!r.p.contains(Flags::C));

        assert_eq!(fs::read(&path).unwrap(), b"HI");
    }

    #[test]
    fn file_input_reports_eof_in_the_status_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        fs::write(&path, b"AB").unwrap();

        let (mut k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();

        set_filename(&mut k, &mut ram, path.to_str().unwrap());
        k.lfn = 2;
        k.sec = 0; // read
        k.open(&mut r, &ram);
        assert!(!r.p.contains(Flags::C));

        r.x = 2;
        k.chkin(&mut r);
        assert!(!r.p.contains(Flags::C));

        assert_eq!(k.chrin(&mut r), Control::Continue);
        assert_eq!(r.a, b'A');
        assert_eq!(k.status & ST_EOF, 0);

        k.chrin(&mut r);
        assert_eq!(r.a, b'B');
        assert_eq!(k.status & ST_EOF, ST_EOF, "EOF known via lookahead");

        k.chrin(&mut r);
        assert_eq!(r.a, CR, "reads past the end return carriage return");
        assert_eq!(k.status & ST_TIME_OUT_READ, ST_TIME_OUT_READ);
    }

    #[test]
    fn getin_returns_199_past_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        fs::write(&path, b"").unwrap();

        let (mut k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        set_filename(&mut k, &mut ram, path.to_str().unwrap());
        k.lfn = 1;
        k.sec = 0;
        k.open(&mut r, &ram);
        r.x = 1;
        k.chkin(&mut r);

        assert_eq!(k.getin(&mut r), Control::Continue);
        assert_eq!(r.a, 199);
    }

    #[test]
    fn open_rejects_bad_logical_file_numbers() {
        let (mut k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        set_filename(&mut k, &mut ram, "whatever");
        k.lfn = 20;
        k.open(&mut r, &ram);
        assert!(r.p.contains(Flags::C));
        assert_eq!(r.a, errcode::ILLEGAL_DEVICE_NUMBER);
    }

    #[test]
    fn open_without_a_name_fails() {
        let (mut k, _) = capture_kernal();
        let ram = blank_ram();
        let mut r = regs();
        k.lfn = 1;
        k.filename_len = 0;
        k.open(&mut r, &ram);
        assert!(r.p.contains(Flags::C));
        assert_eq!(r.a, errcode::MISSING_FILE_NAME);
    }

    #[test]
    fn close_of_an_unopened_file_fails() {
        let (mut k, _) = capture_kernal();
        let mut r = regs();
        k.lfn = 7;
        k.close(&mut r);
        assert!(r.p.contains(Flags::C));
        assert_eq!(r.a, errcode::FILE_NOT_OPEN);
    }

    #[test]
    fn save_then_load_restores_the_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.prg");
        let (mut k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();

        // Program bytes at $0801..$0810, start pointer at $2B.
        for (i, slot) in ram[0x0801..0x0810].iter_mut().enumerate() {
            *slot = 0xC0 + i as u8;
        }
        ram[0x2B] = 0x01;
        ram[0x2C] = 0x08;

        set_filename(&mut k, &mut ram, path.to_str().unwrap());
        r.a = 0x2B;
        r.x = 0x10;
        r.y = 0x08; // end = $0810
        k.save(&mut r, &ram);
        assert!(!r.p.contains(Flags::C));

        // Header is the start address, body is the region.
        let saved = fs::read(&path).unwrap();
        assert_eq!(&saved[..2], &[0x01, 0x08]);
        assert_eq!(saved.len(), 2 + 0x0F);

        // Wipe and load back.
        for slot in ram[0x0801..0x0810].iter_mut() {
            *slot = 0;
        }
        r = regs();
        set_filename(&mut k, &mut ram, path.to_str().unwrap());
        k.sec = 0; // honour the file's load address
        assert_eq!(k.load(&mut r, &mut ram), Control::Continue);
        assert!(!r.p.contains(Flags::C));
        assert_eq!(u16::from_le_bytes([r.x, r.y]), 0x0810);
        for (i, slot) in ram[0x0801..0x0810].iter().enumerate() {
            assert_eq!(*slot, 0xC0 + i as u8);
        }
    }

    #[test]
    fn save_with_inverted_region_fails() {
        let (mut k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        ram[0x2B] = 0x00;
        ram[0x2C] = 0x10; // start $1000
        set_filename(&mut k, &mut ram, "never-created");
        r.a = 0x2B;
        r.x = 0x00;
        r.y = 0x08; // end $0800 < start
        k.save(&mut r, &ram);
        assert!(r.p.contains(Flags::C));
        assert!(!std::path::Path::new("never-created").exists());
    }

    #[test]
    fn load_of_a_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.prg");
        let (mut k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        set_filename(&mut k, &mut ram, path.to_str().unwrap());
        k.load(&mut r, &mut ram);
        assert!(r.p.contains(Flags::C));
        assert_eq!(r.a, errcode::FILE_NOT_FOUND);
    }

    #[test]
    fn directory_listing_is_a_linked_basic_program() {
        let mut ram = blank_ram();
        let end = load_directory(&mut ram).unwrap();
        assert!(end > 0x0803);

        // Header line: link, line number 0, reverse-video quote.
        assert_ne!(u16::from_le_bytes([ram[0x0801], ram[0x0802]]), 0);
        assert_eq!(ram[0x0805], 0x12);
        assert_eq!(ram[0x0806], b'"');

        // The link chain ends on a null link before `end`.
        let mut addr = 0x0801u16;
        let mut hops = 0;
        loop {
            let link = u16::from_le_bytes([
                ram[usize::from(addr)],
                ram[usize::from(addr) + 1],
            ]);
            if link == 0 {
                break;
            }
            assert!(link > addr, "links must move forward");
            addr = link;
            hops += 1;
            assert!(hops < 10_000, "runaway link chain");
        }
        assert_eq!(addr.wrapping_add(2), end);
    }

    #[test]
    fn iobase_points_at_the_fake_cia() {
        let (k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        k.iobase(&mut r, &mut ram);
        assert_eq!(u16::from_le_bytes([r.x, r.y]), 0xDC00);
    }

    #[test]
    fn settim_offsets_rdtim() {
        let (mut k, _) = capture_kernal();
        let mut r = regs();
        r.y = 0x01;
        r.x = 0x02;
        r.a = 0x03;
        k.settim(&r);

        k.rdtim(&mut r);
        let set = 0x01_0203i64;
        let got = i64::from(r.y) * 65536 + i64::from(r.x) * 256 + i64::from(r.a);
        assert!((got - set).abs() <= 2, "set {set}, read back {got}");
    }

    #[test]
    fn chrget_fetches_a_digit_with_carry_clear() {
        let (k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        ram[0x7A] = 0xFF; // pointer $00FF, pre-increment makes it $0100
        ram[0x7B] = 0x00;
        ram[0x0100] = b'7';

        k.chrget_common(&mut r, &mut ram, true);
        assert_eq!(ram[0x7A], 0x00);
        assert_eq!(ram[0x7B], 0x01, "pointer high byte carries");
        assert_eq!(r.a, b'7', "digit comes back unchanged through the double subtract");
        assert!(!r.p.contains(Flags::C), "digits report carry clear");
        assert!(!r.p.contains(Flags::Z));
    }

    #[test]
    fn chrget_stops_on_a_colon_with_carry_set() {
        let (k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        ram[0x7A] = 0x00;
        ram[0x7B] = 0x02;
        ram[0x0201] = b':';

        k.chrget_common(&mut r, &mut ram, true);
        assert_eq!(r.a, b':');
        assert!(r.p.contains(Flags::C));
        assert!(r.p.contains(Flags::Z), "A - $3A is zero for a colon");
    }

    #[test]
    fn chrget_skips_spaces() {
        let (k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        ram[0x7A] = 0x00;
        ram[0x7B] = 0x02;
        ram[0x0201] = b' ';
        ram[0x0202] = b' ';
        ram[0x0203] = b'A';

        k.chrget_common(&mut r, &mut ram, true);
        assert_eq!(r.a, b'A');
        assert_eq!(ram[0x7A], 0x03);
        assert!(r.p.contains(Flags::C), "letters come back with carry set");
    }

    #[test]
    fn chrgot_rereads_without_advancing() {
        let (k, _) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        ram[0x7A] = 0x05;
        ram[0x7B] = 0x02;
        ram[0x0205] = b'X';

        k.chrget_common(&mut r, &mut ram, false);
        assert_eq!(r.a, b'X');
        assert_eq!(ram[0x7A], 0x05, "CHRGOT must not move the pointer");
    }

    #[test]
    fn script_chrin_exits_after_the_second_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bas");
        fs::write(&path, b"PRINT 1\n").unwrap();
        let mut k = Kernal::with_script(&path).unwrap();
        k.replace_terminal(Terminal::new(Box::new(SharedBuf::default())));

        k.ready_count = 2;
        let mut r = regs();
        assert_eq!(k.chrin(&mut r), Control::Exit(0));
    }

    #[test]
    fn script_eof_injects_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bas");
        fs::write(&path, b"X").unwrap();
        let mut k = Kernal::with_script(&path).unwrap();
        k.replace_terminal(Terminal::new(Box::new(SharedBuf::default())));
        k.ready_count = 1;

        let mut r = regs();
        k.chrin(&mut r);
        assert_eq!(r.a, b'X');

        for expected in RUN_KEYS {
            k.chrin(&mut r);
            assert_eq!(r.a, expected);
        }
        assert!(k.fakerun.is_none());
        assert!(matches!(k.input, Input::Stdin));
    }

    #[test]
    fn script_shebang_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bas");
        fs::write(&path, b"#!/usr/bin/cbmbasic\nP").unwrap();
        let mut k = Kernal::with_script(&path).unwrap();
        k.replace_terminal(Terminal::new(Box::new(SharedBuf::default())));

        let mut r = regs();
        k.chrin(&mut r);
        assert_eq!(r.a, b'P');
    }

    #[test]
    fn script_without_shebang_reads_from_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bas");
        fs::write(&path, b"10 PRINT").unwrap();
        let mut k = Kernal::with_script(&path).unwrap();
        k.replace_terminal(Terminal::new(Box::new(SharedBuf::default())));

        let mut r = regs();
        k.chrin(&mut r);
        assert_eq!(r.a, b'1');
    }

    #[test]
    fn newlines_become_carriage_returns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bas");
        fs::write(&path, b"A\nB").unwrap();
        let mut k = Kernal::with_script(&path).unwrap();
        k.replace_terminal(Terminal::new(Box::new(SharedBuf::default())));

        let mut r = regs();
        k.chrin(&mut r);
        assert_eq!(r.a, b'A');
        k.chrin(&mut r);
        assert_eq!(r.a, CR);
    }

    #[test]
    fn dispatch_routes_by_trap_address() {
        let (mut k, buf) = capture_kernal();
        let mut ram = blank_ram();
        let mut r = regs();
        r.a = b'Z';
        assert_eq!(k.dispatch(0xFFD2, &mut r, &mut ram), Control::Continue);
        assert_eq!(buf.bytes(), b"Z");

        // Unknown slots are a no-op.
        let before = r;
        assert_eq!(k.dispatch(0xFF9F, &mut r, &mut ram), Control::Continue);
        assert_eq!(r, before);
    }
}
