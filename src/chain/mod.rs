pub mod htlc;
pub mod keys;
