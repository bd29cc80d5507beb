pub mod board;
pub mod errors;
