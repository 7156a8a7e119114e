pub mod alignment;
pub mod config;
pub mod fraction;
pub mod score;
