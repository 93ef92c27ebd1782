pub mod config;
pub mod decision;
pub mod grid;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod remote;
pub mod splitter;
pub mod storage;
pub mod tracking;

#[cfg(test)]
mod tests;
