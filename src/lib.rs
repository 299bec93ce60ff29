#![doc = include_str!("../README.md")]

mod cfg;
mod error;
mod raw;
mod table;

pub mod reclaim;

pub use error::Error;
pub use reclaim::Reclaim;
pub use table::{Registration, RouteTable, Stats, Table, NOT_FOUND};
