// Library surface for the gateway binary and its integration tests.
pub mod api;
pub mod atom;
pub mod awi;
pub mod bump;
pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod logging;
pub mod storage;
pub mod types;
pub mod wave;
