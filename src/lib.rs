#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod chat;
pub mod cli;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
#[cfg(test)]
pub mod http_stub;
pub mod logging;
pub mod orchestrator;
pub mod presenter;
pub mod registry;
