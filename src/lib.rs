//! directdrop: direct peer-to-peer file transfer.
//!
//! A relay is only used to negotiate a direct transport between two peers;
//! file bytes then flow over that transport in fixed-size chunks.
//! [`core::engine::TransferEngine`] is the entry point.

pub mod core;
pub mod utils;
