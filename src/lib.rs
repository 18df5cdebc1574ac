#![forbid(unsafe_code)]

pub mod checkpoint;
pub mod chunk;
pub mod cli;
pub mod completion;
pub mod config;
pub mod context;
pub mod control;
pub mod dispatch;
pub mod epub;
pub mod export;
pub mod glossary;
pub mod logging;
pub mod openai;
pub mod orchestrator;
pub mod prompt;
pub mod reassemble;
pub mod sanitize;
pub mod segment;
