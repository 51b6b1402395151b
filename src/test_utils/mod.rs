//! Test doubles for every external dependency.

pub mod mocks;

pub use mocks::{
    MockChainReader, MockConfig, MockJobScheduler, MockOrderStore, MockSchedule, MockStatusCache,
};
