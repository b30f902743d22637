#![forbid(unsafe_code)]

//! Acquire a video by URL, normalize it under an upload ceiling and file it
//! into a per-user archive with its metadata and subtitle.

pub mod archive;
pub mod compressor;
pub mod config;
pub mod downloader;
pub mod error;
pub mod index;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod resolver;
pub mod subtitles;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use error::{AcquireError, AcquireResult};
pub use orchestrator::{AcquireRequest, Acquirer, Acquisition, Notice, Notifier};
