//! Loading the 6502 netlist tables from their data files.
//!
//! The segment and transistor tables are opaque external data — the
//! digitised photomask of the chip — and are shipped next to the binary the
//! same way the BASIC ROM is. Two files are expected:
//!
//! - `6502.segdefs`: the first significant line is the node count; every
//!   following line is the index of a node carrying a pull-up.
//! - `6502.transdefs`: one `gate c1 c2` triple per line.
//!
//! Blank lines and `#` comments are ignored in both files. The files are
//! looked up in the directory named by the `SILICA_DATA` environment
//! variable, falling back to the working directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use silica_net::{Netlist, NetlistError, NodeId};

use crate::nodes;

/// Segment-table file name.
pub const SEGDEFS_FILE: &str = "6502.segdefs";
/// Transistor-table file name.
pub const TRANSDEFS_FILE: &str = "6502.transdefs";
/// Environment variable naming the data directory.
pub const DATA_DIR_ENV: &str = "SILICA_DATA";

/// Netlist data loading error.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// A data file could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        /// Path of the unreadable file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// A data file contains a malformed line.
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        /// Path of the malformed file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        message: String,
    },
    /// The tables do not form a valid netlist.
    #[error(transparent)]
    Netlist(#[from] NetlistError),
    /// The netlist is too small to contain the 6502's named nodes.
    #[error("netlist has {0} nodes, fewer than the 6502 requires")]
    TooSmall(usize),
}

/// The directory the netlist files will be loaded from: `$SILICA_DATA` if
/// set, the working directory otherwise.
pub fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV).map_or_else(|| PathBuf::from("."), PathBuf::from)
}

/// Load the 6502 netlist from `dir`.
///
/// # Errors
///
/// Fails when either file is missing or malformed, or when the tables do
/// not describe a chip large enough to hold the 6502's named nodes.
pub fn load_netlist(dir: &Path) -> Result<Netlist, DataError> {
    let seg_path = dir.join(SEGDEFS_FILE);
    let trans_path = dir.join(TRANSDEFS_FILE);

    let pullup = parse_segdefs(&read(&seg_path)?, &seg_path)?;
    let transdefs = parse_transdefs(&read(&trans_path)?, &trans_path)?;

    if pullup.len() <= nodes::max_named_node() {
        return Err(DataError::TooSmall(pullup.len()));
    }

    log::debug!(
        "netlist: {} nodes, {} transistor definitions",
        pullup.len(),
        transdefs.len()
    );
    Ok(Netlist::new(pullup, &transdefs, nodes::VSS, nodes::VCC)?)
}

/// Load the 6502 netlist from the default data directory.
///
/// # Errors
///
/// See [`load_netlist`].
pub fn load_default() -> Result<Netlist, DataError> {
    load_netlist(&data_dir())
}

/// Whether both data files exist in `dir`. Used by tests to skip when the
/// netlist dump is not available.
pub fn netlist_present(dir: &Path) -> bool {
    dir.join(SEGDEFS_FILE).exists() && dir.join(TRANSDEFS_FILE).exists()
}

fn read(path: &Path) -> Result<String, DataError> {
    fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn significant_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.split('#').next().unwrap_or("").trim()))
        .filter(|(_, line)| !line.is_empty())
}

fn parse_segdefs(text: &str, path: &Path) -> Result<Vec<bool>, DataError> {
    let mut lines = significant_lines(text);

    let (line_no, count_text) = lines.next().ok_or_else(|| DataError::Parse {
        path: path.to_path_buf(),
        line: 1,
        message: "missing node count".into(),
    })?;
    let count: usize = count_text.parse().map_err(|_| DataError::Parse {
        path: path.to_path_buf(),
        line: line_no,
        message: format!("bad node count {count_text:?}"),
    })?;

    let mut pullup = vec![false; count];
    for (line_no, text) in lines {
        let node: NodeId = text.parse().map_err(|_| DataError::Parse {
            path: path.to_path_buf(),
            line: line_no,
            message: format!("bad node index {text:?}"),
        })?;
        if node >= count {
            return Err(DataError::Parse {
                path: path.to_path_buf(),
                line: line_no,
                message: format!("pull-up node {node} out of range (count {count})"),
            });
        }
        pullup[node] = true;
    }
    Ok(pullup)
}

fn parse_transdefs(
    text: &str,
    path: &Path,
) -> Result<Vec<(NodeId, NodeId, NodeId)>, DataError> {
    let mut transdefs = Vec::new();
    for (line_no, line) in significant_lines(text) {
        let mut fields = line.split_whitespace().map(str::parse::<NodeId>);
        let triple = (|| {
            let gate = fields.next()?.ok()?;
            let c1 = fields.next()?.ok()?;
            let c2 = fields.next()?.ok()?;
            if fields.next().is_some() {
                return None;
            }
            Some((gate, c1, c2))
        })();
        let Some(triple) = triple else {
            return Err(DataError::Parse {
                path: path.to_path_buf(),
                line: line_no,
                message: format!("expected `gate c1 c2`, got {line:?}"),
            });
        };
        transdefs.push(triple);
    }
    Ok(transdefs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segdefs_with_comments() {
        let text = "# node count\n8\n\n3 # pull-up\n5\n";
        let pullup = parse_segdefs(text, Path::new("test")).unwrap();
        assert_eq!(pullup.len(), 8);
        assert!(pullup[3]);
        assert!(pullup[5]);
        assert!(!pullup[0]);
    }

    #[test]
    fn rejects_out_of_range_pullup() {
        let err = parse_segdefs("4\n9\n", Path::new("test")).unwrap_err();
        assert!(matches!(err, DataError::Parse { line: 2, .. }));
    }

    #[test]
    fn parses_transdefs() {
        let text = "0 1 2\n3 4 5 # comment\n";
        let triples = parse_transdefs(text, Path::new("test")).unwrap();
        assert_eq!(triples, vec![(0, 1, 2), (3, 4, 5)]);
    }

    #[test]
    fn rejects_short_triple() {
        let err = parse_transdefs("0 1\n", Path::new("test")).unwrap_err();
        assert!(matches!(err, DataError::Parse { line: 1, .. }));
    }

    #[test]
    fn small_netlist_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SEGDEFS_FILE), "4\n1\n").unwrap();
        fs::write(dir.path().join(TRANSDEFS_FILE), "0 1 2\n").unwrap();
        let err = load_netlist(dir.path()).unwrap_err();
        assert!(matches!(err, DataError::TooSmall(4)));
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_netlist(dir.path()).unwrap_err();
        assert!(matches!(err, DataError::Io { .. }));
    }
}
