//! Client side of the lease service.

mod endpoint;

pub use endpoint::LeaseClient;
