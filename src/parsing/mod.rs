pub mod error;
pub mod handle;
pub mod parser;
pub mod session;
pub mod stream;
