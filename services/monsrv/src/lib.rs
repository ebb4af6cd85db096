//! Monitor service library
//!
//! Modbus gateway monitor: Fronius Symo inverter over Modbus/TCP, grid
//! meter, Saia auxiliary meters and Nibe 1155 heat pump on a shared Modbus
//! ASCII serial line. The monitor polls all devices on a fixed period and
//! publishes one record per tick to its history, the statistics and every
//! subscriber of the record feed.

pub mod api;
pub mod config;
pub mod context;
pub mod devices;
pub mod error;
pub mod fanout;
pub mod history;
pub mod monitor;
pub mod record;
pub mod registers;
pub mod statistics;

pub use context::AppContext;
pub use error::{MonSrvError, Result};
