//! External tools: the GUID → decoder registry, the encoder toolchain names, and the
//! process-spawning capability every invocation goes through.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use tracing::debug;

use crate::error::{FmmtError, Result};
use crate::guid::{self, Guid};

/// Registered path of the CRC32 entry. Sections with this tool are checked in-process.
pub const VERIFY_ONLY_TOOL: &str = "GenCrc32";

/// Environment variable naming an extra tool definition file.
pub const TOOL_CONF_ENV: &str = "FMMT_TOOL_CONF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEntry {
    pub name: String,
    pub path: PathBuf,
}

impl ToolEntry {
    /// True for the verification-only CRC32 marker.
    pub fn is_verify_only(&self) -> bool {
        self.path.as_os_str() == VERIFY_ONLY_TOOL
    }
}

/// Immutable GUID → tool lookup, built once and passed to every parse and rebuild.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    entries: BTreeMap<Guid, ToolEntry>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ToolRegistry {
    /// An empty registry. Every GUID-defined section will be reported as unsupported.
    pub fn empty() -> Self {
        ToolRegistry {
            entries: BTreeMap::new(),
        }
    }

    /// The three tools EDK II ships: TianoCompress, LzmaCompress and the CRC32 marker.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.insert(guid::TIANO_COMPRESS, "TIANO", "TianoCompress");
        registry.insert(guid::LZMA_COMPRESS, "LZMA", "LzmaCompress");
        registry.insert(guid::CRC32_SECTION, "CRC32", VERIFY_ONLY_TOOL);
        registry
    }

    fn insert(&mut self, guid: Guid, name: &str, path: impl Into<PathBuf>) {
        self.entries.insert(
            guid,
            ToolEntry {
                name: name.to_string(),
                path: path.into(),
            },
        );
    }

    /// Adds the definitions in `text`, one `<guid> <name> <path>` per line.
    pub fn extend_from_str(mut self, text: &str) -> Result<Self> {
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(FmmtError::InvalidParameter(format!(
                    "tool definition line {}: expected '<guid> <name> <path>', got '{}'",
                    number + 1,
                    line
                )));
            }
            let guid: Guid = fields[0].parse().map_err(|_| {
                FmmtError::InvalidParameter(format!(
                    "tool definition line {}: bad GUID '{}'",
                    number + 1,
                    fields[0]
                ))
            })?;
            debug!(%guid, tool = fields[2], "registering GUID tool");
            self.insert(guid, fields[1], fields[2]);
        }
        Ok(self)
    }

    pub fn extend_from_file(self, path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| FmmtError::io(e, path))?;
        self.extend_from_str(&text)
    }

    pub fn lookup(&self, guid: &Guid) -> Option<&ToolEntry> {
        self.entries.get(guid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runs one external program to completion.
pub trait CommandRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> Result<ExitStatus>;
}

/// Spawns real processes, directly from an argument vector.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> Result<ExitStatus> {
        debug!(program = %program.display(), ?args, "spawning");
        Command::new(program)
            .args(args)
            .status()
            .map_err(|e| FmmtError::io(e, program))
    }
}

/// Runs `program` and turns a non-zero exit status into [`FmmtError::ToolFailed`].
pub fn run_checked(runner: &dyn CommandRunner, program: &Path, args: &[OsString]) -> Result<()> {
    let status = runner.run(program, args)?;
    if status.success() {
        Ok(())
    } else {
        Err(FmmtError::ToolFailed {
            tool: program.display().to_string(),
            status,
        })
    }
}

/// Encoder programs used by reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub gen_fv: PathBuf,
    pub gen_ffs: PathBuf,
    pub gen_sec: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Toolchain {
            gen_fv: PathBuf::from("GenFv"),
            gen_ffs: PathBuf::from("GenFfs"),
            gen_sec: PathBuf::from("GenSec"),
        }
    }
}
