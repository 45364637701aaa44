//! Provider client for the external tabular data source: transport contract,
//! Airtable HTTP transport, per-tenant rate limiting, retries and failure
//! classification.

mod airtable;
mod backoff;
mod client;
mod error;
mod limiter;
mod transport;

pub use airtable::{AirtableTransport, AirtableTransportFactory, DEFAULT_AIRTABLE_BASE_URL};
pub use backoff::BackoffPolicy;
pub use client::ProviderClient;
pub use error::{classify_reqwest_error, classify_status, ProviderError, RequestScope};
pub use limiter::RateLimiter;
pub use transport::{
    FieldMeta, ModifiedSince, ProviderRecord, ProviderTransport, QueryPage, QueryRequest,
    TableMeta, TransportFactory,
};

pub const CRATE_NAME: &str = "flightsync-provider";
