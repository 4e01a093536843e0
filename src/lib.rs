pub mod cli;
pub mod collect;
pub mod config;
pub mod meter;
pub mod retry;
pub mod sink;
pub mod storage;
pub mod sync;
pub mod transport;
