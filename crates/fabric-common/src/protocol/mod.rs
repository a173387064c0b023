pub mod endpoint;
pub mod error;
pub mod requests;
pub mod responses;


pub use endpoint::HostDescription;
pub use error::{FabricError, Result};
pub use requests::{AccessType, Request, RequestMethod};
pub use responses::{Response, ServerErrorBody, STATUS_FORBIDDEN, STATUS_UNAUTHORIZED};
