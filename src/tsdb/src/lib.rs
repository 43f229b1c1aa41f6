#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate async_trait;

pub mod codec;
pub mod common;
pub mod config;
pub mod engine;
pub mod errors;
pub mod field;
pub mod index;
pub mod series;
pub mod shard;
