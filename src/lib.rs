//! Gomoku board assistant.
//! Pipeline: capture → recognizer → scheduler → engine → report.
//! The scheduler owns the game record; the engine runs on its own task behind
//! `EngineHandle`; suggestions are cached in the chess manual.

pub mod board;
pub mod cache;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod gtp;
pub mod recognizer;
pub mod report;
pub mod rules;
pub mod scheduler;
