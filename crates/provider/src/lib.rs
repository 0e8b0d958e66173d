pub mod echo;
pub mod error;
pub mod provider;
pub mod registry;

#[cfg(feature = "http")]
pub mod http;

pub use echo::EchoProvider;
pub use error::{ProviderError, is_transient_message};
pub use provider::{DynProvider, Provider};
pub use registry::ProviderRegistry;

#[cfg(feature = "http")]
pub use http::HttpProvider;
