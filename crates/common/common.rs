pub mod config;
pub mod control;
pub mod error;
pub mod key;
pub mod request;
pub mod schema;
pub mod uri;

pub use config::Config;
pub use control::{ControlAction, ControlIdentifier, ControlIdentifiers};
pub use error::FdbError;
pub use key::Key;
pub use request::Request;
pub use schema::Schema;
pub use uri::SfdbUri;
