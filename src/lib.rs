//! # fmmt Core Library
//!
//! Decomposes UEFI firmware images into their volumes, files and sections, and rebuilds a
//! volume from the recorded structure with the EDK II encoder tools.
//!
//! ## Key Modules
//!
//! - [`device`]: Scans a flat image for firmware volumes.
//! - [`decompose`]: Validates files and recursively parses their sections.
//! - [`tree`]: The decomposition tree recorded while parsing.
//! - [`rebuild`]: Replays the tree through GenFv, GenFfs and GenSec.
//! - [`tools`]: GUID tool registry and the external command capability.
//! - [`compress`]: The UEFI standard decompressor.
//!
//! ## Examples
//!
//! ```no_run
//! use fmmt::decompose::Decomposer;
//! use fmmt::device::Device;
//! use fmmt::tools::{SystemRunner, ToolRegistry};
//!
//! # fn main() -> fmmt::error::Result<()> {
//! let registry = ToolRegistry::with_builtins();
//! let mut device = Device::open(std::path::Path::new("bios.fd"))?;
//! Decomposer::new(&registry, &SystemRunner).decompose_all(&mut device)?;
//! print!("{}", fmmt::view::render_text(&device)?);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod compress;
pub mod decompose;
pub mod device;
pub mod error;
pub use error::FmmtError;
pub mod ffs;
pub mod guid;
pub mod leaf;
pub mod primitives;
pub mod rebuild;
pub mod section;
pub mod tools;
pub mod tree;
pub mod view;
pub mod volume;
