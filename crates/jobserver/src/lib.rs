//! A single-process job server.
//!
//! Clients connect over TCP and send line commands (`jobs`, `run`, `kill`,
//! `watch`). Jobs are child processes whose stdout/stderr are read through
//! pipes and broadcast, line by line, to every client watching them. One
//! thread drives everything from a `poll(2)` loop, see [`event_loop`].

pub mod cli;
pub mod config;
pub mod connection_table;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod job_registry;
pub mod shutdown;
pub mod tracing_init;
