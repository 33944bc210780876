mod backend;
mod native;
pub mod protocol;
mod socket;
pub mod transport;

pub use backend::{CODE_SEPARATOR, SigningBackend, SigningError, SigningRequest, SigningResult};
pub use native::{CERT_NO_BUF_LEN, NativeBackend, SIGNATURE_BUF_LEN, SignLibrary};
pub use socket::{DEFAULT_RESPONSE_TIMEOUT, SocketBackend};
pub use transport::{
    Connection, Connector, Endpoint, TransportError, TransportSecurity, WsConnector,
};
