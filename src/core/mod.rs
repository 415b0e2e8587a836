pub mod cache;
pub mod config;
pub mod context;
pub mod diagram;
pub mod errors;
pub mod ports;
pub mod state;
pub mod types;
pub mod values;

#[cfg(test)]
mod tests;
