pub mod address_validator;
pub mod amount;
pub mod chain_normalizer;
pub mod id_generator;

// Re-export commonly used functions
pub use chain_normalizer::normalize_chain;
