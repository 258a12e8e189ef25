pub mod proxy;
pub mod request;
pub mod resolver;
pub mod traced_io;
pub mod transport;

pub use request::RequestTemplate;
pub use transport::{HttpTransport, ProbeResponse, Transport, TransportSettings};
