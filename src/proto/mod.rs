//! Line-oriented command protocol spoken by the `scpi` agent.

pub mod command;
pub mod parser;
