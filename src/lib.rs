#![no_std]

mod buffer;
mod checkpoint;
mod commit;
pub mod config;
pub mod disk;
pub mod err;
pub mod journal;
mod revoke;
pub mod sal;
mod tx;
mod util;

pub use crate::journal::Journal;
pub use crate::tx::Handle;
