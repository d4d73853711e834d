//! Authentication
//!
//! Handles:
//! - Signed application sessions
//! - Owner selection per request
//! - Instagram OAuth flow and its state store

mod middleware;
mod oauth;
pub mod session;

pub use middleware::{CurrentOwner, CurrentUser};
pub use oauth::{OAuthState, OAuthStateStore, auth_router};
pub use session::{SESSION_COOKIE, Session, create_session_token, verify_session_token};
