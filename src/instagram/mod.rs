//! Instagram Graph API integration
//!
//! - `client`: transport seam and retry/backoff policy
//! - `errors`: classification of upstream error bodies
//! - `graph`: typed endpoint calls
//! - `token`: OAuth exchange, refresh and validation
//! - `signature`: webhook HMAC verification
//! - `webhook`: webhook payload types

pub mod client;
pub mod errors;
pub mod graph;
pub mod signature;
pub mod token;
pub mod webhook;

pub use client::{
    GraphRequest, GraphResponse, GraphTransport, ReqwestTransport, RetryOutcome, RetryPolicy,
    RetryingClient, Sleeper, TokioSleeper, TransportError,
};
pub use graph::GraphApi;
pub use signature::SignatureVerifier;
pub use token::TokenLifecycleManager;
