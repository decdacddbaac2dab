//! Daemon wiring for `rgeorepd` - the poll loop that ties change detection,
//! snapshots, enumeration and dispatch together.

pub mod daemon;
