pub mod decode;
pub mod encode;
pub mod error;
pub mod structs;

pub use decode::SfdbDecode;
pub use encode::SfdbEncode;
pub use error::CodecError;
