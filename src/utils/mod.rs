pub mod address;

pub use address::{parse_address, split_subaddress, validate_address};
