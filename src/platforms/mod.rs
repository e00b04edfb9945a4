//! Platform integrations.
//!
//! - COTPS: mobile-number login with a bearer token plus session cookie,
//!   balance polling, and order create/submit.
//!
//! Providers plug into the shared session machinery by implementing
//! [`SessionProvider`](crate::session::SessionProvider).

pub mod cotps;

pub use cotps::CotpsClient;
