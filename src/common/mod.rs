pub mod error;
pub mod http;

pub use error::{Error, ErrorKind, Result};
pub use http::{HttpResponse, ReqwestTransport, Transport};
