pub mod control;
pub mod launcher;
pub mod sink;
pub mod transport;

pub use control::{ControlAuth, ControlConnection, TorConfig, TorInstances, TorSession};
pub use launcher::{LaunchConfig, TorProcess};
pub use sink::JsonLinesSink;
pub use transport::ReqwestTransport;
