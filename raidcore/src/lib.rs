// vim: tw=80

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Stripe columns, disks, and buffers are all indexed in lockstep
#![allow(clippy::needless_range_loop)]

pub mod array;
pub mod config;
pub mod dag;
pub mod disk_queue;
pub mod dispatch;
pub mod health;
pub mod layout;
pub mod raid;
pub mod recon;
pub mod shutdown;
pub mod transport;
pub mod types;

pub use crate::types::*;
