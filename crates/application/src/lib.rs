#![forbid(unsafe_code)]

pub mod network_reconcile;
pub mod network_registry;
pub mod physical_network;
