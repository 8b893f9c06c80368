pub mod client;
pub mod discuss;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use client::{Credentials, RemoteModelClient, SessionHandle};
pub use discuss::CallType;
pub use transport::{HttpTransport, Transport};
