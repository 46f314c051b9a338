//! Ricart-Agrawala distributed mutual exclusion over a shared append-only
//! chat log.
//!
//! Three components: the [`lamport_mutex`] DME core, the [`file_service`]
//! external append/read service, and the [`chat`] App Shell that glues the
//! two together behind an interactive REPL.

pub mod chat;
pub mod error;
pub mod file_service;
pub mod lamport_mutex;
pub mod net;
