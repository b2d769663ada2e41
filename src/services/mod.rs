pub mod artifacts;
pub mod catalog;
pub mod delivery;
pub mod generator;
pub mod poller;
pub mod queue;
pub mod render;
pub mod status;
pub mod storage;
pub mod tracker;
pub mod worker;
