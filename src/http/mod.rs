//! Typed request/response model and the transport seam.

mod request;
mod response;
mod transport;

pub use request::{Method, Request, RequestIdentity, join_url};
pub use response::{Headers, Response};
pub use transport::{ReqwestTransport, Transport, USER_AGENT, http_client};

#[cfg(test)]
pub use transport::MockTransport;
