//! Daemon for communication with eBUS heating systems
//!
//! Mediates between the two-wire field bus and external clients: it
//! observes all bus traffic, actively polls and scans devices, loads
//! device specific message definitions based on the scanned
//! identification and exposes read/write/listen primitives over a text
//! line protocol.

#![deny(rust_2018_idioms)]
#![deny(rust_2021_compatibility)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod bushandler;
pub mod device;
pub mod mainloop;
pub mod network;
pub mod protocol;
pub mod queue;
pub mod request;
pub mod scan;

pub use ebus::Error;

pub type Result<T> = ebus::Result<T>;
