//! Various useful things.

pub mod fatal;
