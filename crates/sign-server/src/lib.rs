pub mod codec;
pub mod documents;
pub mod error;
pub mod server;
pub mod signing;

pub use codec::{CodecError, EnvelopeCipher};
pub use documents::{Document, DocumentError, DocumentStore};
pub use error::ServerError;
pub use server::{ApiResponse, AppState, router, run};
pub use signing::{
    Endpoint, NativeBackend, SigningBackend, SigningError, SigningRequest, SigningResult,
    SocketBackend,
};
