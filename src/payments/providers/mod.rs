pub mod hosted;
pub mod push;

pub use hosted::{HostedProvider, HostedProviderConfig};
pub use push::{normalize_msisdn, PushProvider, PushProviderConfig};
