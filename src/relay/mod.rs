pub mod session;
pub mod transcoder;
pub mod types;
