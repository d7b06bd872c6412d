pub mod api;
pub mod cli;
pub mod engine;
pub mod error;
pub mod flows;
pub mod gateway;
pub mod storage;
