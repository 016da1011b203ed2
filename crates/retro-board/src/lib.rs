pub mod board;
pub mod bus;
pub mod client;
pub mod handler;
pub mod manager;
pub mod message;
pub mod timer;
pub mod topics;

pub use bus::Bus;
pub use client::{ClientSession, Frame};
pub use manager::{BoardManager, BoardRef, ManagerConfig};
