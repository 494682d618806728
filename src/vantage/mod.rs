pub mod archive;
pub mod codec;
pub mod link;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use archive::{archive_records, DumpMode, TransferStats};
pub use link::{Connector, DeviceLink, LinkState, LoopBurst, TcpConnector};
pub use supervisor::{collect_forever, LoopHandler, SupervisorSettings};
