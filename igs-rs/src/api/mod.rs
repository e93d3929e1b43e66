//! Types exchanged between the dataplane daemon and its clients.

pub mod compute;
pub mod control;
pub mod network;
pub mod storage;
