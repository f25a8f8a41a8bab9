pub mod binary;
pub mod string;
pub mod variable_int;

pub use binary::{binary_len, decode_binary, encode_binary};
pub use string::{decode_string, encode_string, string_len};
pub use variable_int::{
    decode_variable_int, encode_variable_int, try_decode_variable_int, variable_int_len,
    VARIABLE_INT_MAX,
};
