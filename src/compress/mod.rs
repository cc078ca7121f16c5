//! # Section Decompression
//!
//! Compression sections of the "standard" kind are expanded through a pluggable pair of
//! operations: a size query that reads the stream header, and the decode itself into a buffer
//! of exactly that size. [`EfiDecompressor`] is the built-in implementation of the UEFI
//! standard (LZ77 + Huffman) format.

mod efi;

pub use efi::EfiDecompressor;

use crate::error::Result;

pub trait Decompress {
    /// Size of the decoded output, read from the stream header without decoding.
    fn decoded_size(&self, src: &[u8]) -> Result<u32>;

    /// Decodes `src` into `dst`, which the caller sizes from [`Decompress::decoded_size`].
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}
