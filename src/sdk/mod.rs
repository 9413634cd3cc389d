/// Remote access to the key-value service.
///
/// [`Client`] holds the authenticated session with one bucket and classifies
/// every reply into a [`StoreResult`](crate::StoreResult).
pub mod client;
/// Transport security for client sessions.
pub mod tls;

pub use client::Client;
