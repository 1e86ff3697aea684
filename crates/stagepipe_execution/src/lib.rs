//! Staged execution of relational operators.
//!
//! Operators run as stages, each with its own queue and worker threads.
//! Queries are trees of packets. Tuples move between stages in pages through
//! single producer, single consumer fifos, and packets doing the same work
//! can share a single execution.
pub mod config;
pub mod container;
pub mod dispatcher;
pub mod packet;
pub mod stage;
pub mod stages;
pub mod storage;
pub mod tuple;

pub mod testutil;
