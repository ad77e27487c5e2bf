//! Application Services
//!
//! Client-facing use cases: request routing and session lifecycle.

pub mod router;
pub mod session;

pub use router::{ClientRequest, RequestOutcome, Router};
pub use session::{ClientSession, SessionConfig};
