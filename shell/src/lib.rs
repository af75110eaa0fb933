pub mod builtin;
pub mod eval;
pub mod global;
pub mod job;
pub mod parser;
pub mod pipeline;
pub mod search;
pub mod signal;
pub mod types;
