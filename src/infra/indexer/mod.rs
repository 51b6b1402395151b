//! Chain reader backed by a blockchain indexer.

pub mod client;
pub mod datum;

pub use client::{IndexerClient, IndexerConfig};
pub use datum::{PlutusData, decode_datum};
