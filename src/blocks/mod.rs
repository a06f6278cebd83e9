//! Image block download and reassembly.

pub(crate) mod assembler;
pub(crate) mod downloader;
pub mod multipart;
