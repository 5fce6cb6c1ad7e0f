//! Building blocks for [`clap`]-driven configuration of nodes, servers and logging.

pub mod logging;
pub mod node;
pub mod server;
pub mod socket_addr;
pub mod tokio;
