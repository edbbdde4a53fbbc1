pub mod codec;
pub mod value;

pub use codec::{decode_value, encode_value, parse_inline, DecodeOutcome};
pub use value::Value;
