pub mod bench;
pub mod config;
pub mod discovery;
pub mod display;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export the primary types so users can depend on the crate
// without knowing the internal module layout.
pub use bench::{
    Armed, Bench, ChannelState, ConnectionStatus, Measurement, PowerStatus, ProtectionState,
};
pub use config::BenchConfig;
pub use discovery::{ChannelDescriptor, ChannelKey, Discovery};
pub use display::{DisplayName, DisplayNames};
pub use error::{Error, Result};
pub use protocol::{ChannelId, MeasureKind, ProtectionKind};
pub use transport::{Exchange, ResourceAddress, Session, Transport, Vxi11Transport};
