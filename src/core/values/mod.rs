pub mod typed_value;
pub mod vector;

pub use typed_value::TypedValue;
pub use vector::BasicVector;
