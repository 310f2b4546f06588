//! Konexion library exports for the binary and for testing

pub mod core;
pub mod inference;
pub mod server;

#[cfg(test)]
pub mod test_support;
