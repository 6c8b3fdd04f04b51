//! portal-core: Shared protocol engine for the portal reverse tunnel.
//!
//! Provides the frame model and binary codec, the per-connection control
//! channel pump (reader, writer, keepalive), guest links and the per-session
//! guest registry. Both the broker (`portald`) and the bridge (`portal`)
//! build their session state machines on top of these pieces.

pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod pump;
pub mod registry;
pub mod signal;

// Re-export commonly used items at crate root.
pub use codec::{frame_encode, read_frame, write_frame, FrameHeader, HEADER_LEN};
pub use config::{ProtocolSection, ProtocolSettings};
pub use error::{PortalError, PortalResult};
pub use frame::{ConnId, Frame, FrameKind, CONTROL_CONN_ID};
pub use link::{GuestLink, LinkReleased};
pub use pump::{ControlChannel, Outbound};
pub use registry::{Delivery, GuestRegistry};
pub use signal::CloseSignal;
