pub mod codec;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod providers;
pub mod relay;
pub mod routing;
pub mod server;

pub use codec::{CodecRegistry, Dialect, Endpoint, ProtocolCodec, StreamTranslator};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use forwarder::{BackoffPolicy, Forwarder};
pub use routing::{ProviderDescriptor, RouteEntry, RoutingTable};
pub use server::Gateway;
