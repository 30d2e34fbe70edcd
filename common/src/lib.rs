#[cfg(test)]
#[macro_use]
extern crate quickcheck;

mod timestamp;

pub mod codec;
pub mod record;
pub mod request;

pub use crate::timestamp::Timestamp;
