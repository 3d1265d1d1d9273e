pub mod id;
pub mod itemutil;
pub mod types;
