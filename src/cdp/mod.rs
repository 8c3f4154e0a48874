pub(crate) mod error;
pub(crate) mod types;

pub use error::CdpError;
pub use types::{CdpEvent, CdpResponse};
