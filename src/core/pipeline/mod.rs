//! Byte movement: the chunked sender and the receiving reassembler.

pub mod receiver;
pub mod sender;
