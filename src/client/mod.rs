//! Upstream messaging service integration: normalized message types, the
//! abstract client port and the per-user session broker.

pub mod broker;
pub mod factory;
pub mod session;
pub mod types;
pub mod upstream;

pub use broker::ClientBroker;
pub use session::SessionStore;
pub use types::{ChatInfo, ChatKind, Dialog, MediaInfo, MediaKind, Message, UserInfo};
pub use upstream::{ClientFactory, ProgressFn, TransferControl, UpstreamClient, UpstreamError};
