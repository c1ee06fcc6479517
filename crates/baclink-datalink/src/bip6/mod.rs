pub mod bbmd;
pub mod bvlc6;
pub mod transport;
