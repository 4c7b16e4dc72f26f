pub mod adapter;
pub mod btle;
pub mod connection;
pub mod constants;
pub mod decoder;
pub mod events;
pub mod resolver;
pub mod scan;
pub mod simulated;
pub mod sink;
pub mod supervisor;
pub mod types;

#[cfg(test)]
mod testing;
