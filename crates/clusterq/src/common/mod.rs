pub mod error;
pub mod fsutils;
pub mod parser;
pub mod parser2;
pub mod placeholders;
pub mod setup;
