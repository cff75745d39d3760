//! # olp-client-core
//!
//! Authenticated, cached, cancellable request pipeline for a geospatial data
//! platform client SDK.
//!
//! ## Architecture
//!
//! - [`error`]: the crate-wide [`error::OlpError`] umbrella every component
//!   converts into.
//! - [`data`]: catalog identifiers and cache keys.
//! - [`clock`]: injectable time source, so refresh and expiry logic can be
//!   tested deterministically.
//! - [`scheduler`]: injectable task spawning and cancellable sleeping.
//! - [`cancellation`]: hierarchical cooperative cancellation tokens.
//! - [`http`]: the abstract transport trait plus the default `reqwest`-backed
//!   implementation.
//! - [`cache`]: the two-tier (memory + persistent, with an optional protected
//!   overlay) key/value cache.
//! - [`token`]: the auto-refreshing OAuth2 client-credentials token provider.
//! - [`lookup`]: API base-URL resolution and caching.
//! - [`named_mutex`]: fingerprint-keyed request coalescing.
//! - [`client`]: [`client::OlpClient`], the orchestrator tying every
//!   collaborator above into a single `fetch` call.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Crate-wide error type and conversions.
pub mod error;

/// Catalog identifiers and cache keys.
pub mod data;

/// Injectable time source.
pub mod clock;

/// Injectable task scheduling and cancellable sleeping.
pub mod scheduler;

/// Hierarchical cooperative cancellation.
pub mod cancellation;

/// Abstract HTTP transport and wire types.
pub mod http;

/// Two-tier key/value cache.
pub mod cache;

/// Auto-refreshing OAuth2 client-credentials token provider.
pub mod token;

/// API base-URL resolution and caching.
pub mod lookup;

/// Fingerprint-keyed request coalescing.
pub mod named_mutex;

/// The top-level client orchestrator.
pub mod client;

pub use cache::{CacheConfig, CacheError, DefaultCache, EvictionPolicy};
pub use cancellation::{CancelHandle, CancellationContext};
pub use client::{AttemptState, FetchRequest, OlpClient, OlpClientConfig};
pub use clock::{Clock, FakeClock, SystemClock};
pub use data::{CacheKey, CatalogId, CatalogIdError};
pub use error::{OlpError, OlpResult};
pub use http::{Http, HttpRequest, HttpResponse, Method, ReqwestTransport, RetrySettings};
pub use lookup::{ApiEntry, ApiLookupClient, ApiLookupConfig, FetchMode, LookupError};
pub use named_mutex::NamedMutexTable;
pub use scheduler::{TaskScheduler, TokioScheduler};
pub use token::{Credentials, Token, TokenError, TokenProvider, TokenProviderConfig};

/// The crate's version, as reported by Cargo.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The crate's package name, as reported by Cargo.
pub const NAME: &str = env!("CARGO_PKG_NAME");
