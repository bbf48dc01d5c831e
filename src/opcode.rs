//! The opcode database (spec §4.B): a read-only, memory-mapped text
//! file mapping symbolic names to small nonnegative integers.

use crate::error::{Result, SrvshError};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::OnceLock;

/// A memory-mapped opcode name→number table.
///
/// The mapping itself is parsed lazily, the first time [`OpcodeDb::get`]
/// is called, and cached behind a [`OnceLock`] — mirroring the
/// init-once pattern `conmon-rs` uses for its global `Pause` instance.
pub struct OpcodeDb {
    // Kept alive for the lifetime of the database: parsing borrows out
    // of this mapping rather than copying the whole file.
    _mmap: Mmap,
    table: OnceLock<HashMap<String, i32>>,
    text: &'static str,
}

impl OpcodeDb {
    /// Opens and memory-maps the database at `path`. The file is
    /// mapped read-only, which is safe to share across any process
    /// that inherits it (spec §5).
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        // Safety: `text` only ever borrows from `_mmap`, which this
        // struct owns for its entire lifetime, and the struct is never
        // partially moved.
        let text: &'static str = {
            let s = std::str::from_utf8(&mmap).map_err(|e| SrvshError::resource(e))?;
            unsafe { std::mem::transmute::<&str, &'static str>(s) }
        };
        Ok(Self {
            _mmap: mmap,
            table: OnceLock::new(),
            text,
        })
    }

    fn table(&self) -> &HashMap<String, i32> {
        self.table.get_or_init(|| parse(self.text))
    }

    /// Looks up `name`, returning `-1` for an unrecognized name rather
    /// than an error — matching the spec's `OpcodeUnknown` contract,
    /// where the caller decides what to do with a negative result.
    pub fn get(&self, name: &str) -> i32 {
        self.table().get(name).copied().unwrap_or(-1)
    }
}

fn parse(text: &str) -> HashMap<String, i32> {
    let mut table = HashMap::new();
    for line in text.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let name = match parts.next() {
            Some(n) if !n.is_empty() => n,
            _ => continue,
        };
        let rest = parts.next().unwrap_or("").trim_start();
        let number_str: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(value) = number_str.parse::<i32>() {
            table.insert(name.to_string(), value);
        }
    }
    table
}

/// Resolves the database path from the environment, preferring
/// `OPCODE_DATABASE` over the `SRVSH_DATABASE` alias (spec §6).
pub fn env_database_path() -> Option<std::ffi::OsString> {
    std::env::var_os("OPCODE_DATABASE").or_else(|| std::env::var_os("SRVSH_DATABASE"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn looks_up_known_and_unknown_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "PING 7").unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file, "PONG 8 trailing text ignored").unwrap();
        writeln!(file, "   ").unwrap();
        file.flush().unwrap();

        let db = OpcodeDb::open(file.path()).unwrap();
        assert_eq!(db.get("PING"), 7);
        assert_eq!(db.get("PONG"), 8);
        assert_eq!(db.get("MISSING"), -1);
    }

    #[test]
    fn env_prefers_opcode_database() {
        // SAFETY: test runs single-threaded w.r.t. these two vars.
        unsafe {
            std::env::set_var("OPCODE_DATABASE", "/a");
            std::env::set_var("SRVSH_DATABASE", "/b");
        }
        assert_eq!(env_database_path().unwrap(), "/a");
        unsafe {
            std::env::remove_var("OPCODE_DATABASE");
        }
        assert_eq!(env_database_path().unwrap(), "/b");
        unsafe {
            std::env::remove_var("SRVSH_DATABASE");
        }
    }
}
