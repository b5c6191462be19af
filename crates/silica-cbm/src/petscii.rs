//! PETSCII output translated to an ANSI terminal.
//!
//! The printable subset of PETSCII maps straight onto ASCII. A handful of
//! control codes select colors, move the cursor, or clear the screen; those
//! become ANSI escape sequences. Inside a quoted string BASIC expects
//! control codes to print as-is (they show as reverse-video glyphs on a real
//! C64), so a quote character switches the translator into pass-through
//! mode until the closing quote or end of line.

use std::io::{self, Write};

/// Carriage return.
pub const CR: u8 = 13;

/// A PETSCII output sink over any writer, tracking an estimated cursor
/// position for the PLOT call.
pub struct Terminal {
    out: Box<dyn Write>,
    quote: bool,
    col: u8,
    row: u8,
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("quote", &self.quote)
            .field("col", &self.col)
            .field("row", &self.row)
            .finish_non_exhaustive()
    }
}

impl Terminal {
    /// Terminal writing to standard output.
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Terminal writing to an arbitrary sink.
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out,
            quote: false,
            col: 0,
            row: 0,
        }
    }

    /// Estimated cursor position as (column, row).
    pub fn cursor(&self) -> (u8, u8) {
        (self.col, self.row)
    }

    /// Flush the underlying writer. Called before blocking on input so a
    /// partial prompt line is visible.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Emit a host-side message (already ASCII) on a line of its own.
    pub fn host_line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "{text}")?;
        self.col = 0;
        self.row = self.row.saturating_add(1);
        Ok(())
    }

    /// Emit one PETSCII byte.
    pub fn chrout(&mut self, byte: u8) -> io::Result<()> {
        if self.quote {
            if byte == b'"' || byte == b'\n' || byte == b'\r' {
                self.quote = false;
            }
            self.out.write_all(&[byte])?;
            self.advance(byte);
            return Ok(());
        }

        match byte {
            5 => self.sgr(97),    // white
            10 => {}              // stray linefeeds are dropped
            CR => {
                self.out.write_all(b"\r\n")?;
                self.col = 0;
                self.row = self.row.saturating_add(1);
            }
            17 => {
                self.out.write_all(b"\x1b[B")?; // cursor down
                self.row = self.row.saturating_add(1);
            }
            19 => {
                self.out.write_all(b"\x1b[H")?; // cursor home
                self.col = 0;
                self.row = 0;
            }
            28 => self.sgr(31),   // red
            29 => {
                self.out.write_all(b"\x1b[C")?; // cursor right
                self.col = self.col.saturating_add(1);
            }
            30 => self.sgr(32),   // green
            31 => self.sgr(34),   // blue
            129 => self.sgr(33),  // orange
            144 => self.sgr(30),  // black
            145 => {
                self.out.write_all(b"\x1b[A")?; // cursor up
                self.row = self.row.saturating_sub(1);
            }
            147 => {
                self.out.write_all(b"\x1b[2J\x1b[H")?; // clear screen
                self.col = 0;
                self.row = 0;
            }
            149 => self.sgr(33),  // brown
            150 => self.sgr(91),  // light red
            151 => self.sgr(90),  // dark grey
            152 => self.sgr(90),  // medium grey
            153 => self.sgr(92),  // light green
            154 => self.sgr(94),  // light blue
            155 => self.sgr(37),  // light grey
            156 => self.sgr(35),  // purple
            157 => {
                self.out.write_all(b"\x1b[D")?; // cursor left
                self.col = self.col.saturating_sub(1);
            }
            158 => self.sgr(93),  // yellow
            159 => self.sgr(96),  // cyan
            b'"' => {
                self.quote = true;
                self.out.write_all(&[byte])?;
                self.advance(byte);
            }
            _ => {
                self.out.write_all(&[byte])?;
                self.advance(byte);
            }
        }
        Ok(())
    }

    fn sgr(&mut self, code: u8) {
        // Color failures are not worth surfacing; drop them.
        let _ = write!(self.out, "\x1b[{code}m");
    }

    fn advance(&mut self, byte: u8) {
        if byte == b'\r' || byte == b'\n' {
            self.col = 0;
            self.row = self.row.saturating_add(1);
        } else {
            self.col = self.col.saturating_add(1);
        }
    }
}
