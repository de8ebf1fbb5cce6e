// Library interface for feedbridge modules
// This allows tests and other binaries to import modules

pub mod engine;
pub mod entries;
pub mod error;
pub mod ledger;
pub mod normalize;
pub mod workspace;
