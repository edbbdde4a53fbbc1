pub mod aof;
pub mod commands;
pub mod conn;
pub mod follow;
pub mod message;
pub mod observability;
pub mod router;
pub mod scan;
pub mod scan_bridge;
pub mod script_surface;
pub mod script_values;
pub mod scripts;
pub mod server;
pub mod similarity;
pub mod snapshot;
pub mod stats_array;

pub use message::{Message, OutputMode};
pub use server::Server;
