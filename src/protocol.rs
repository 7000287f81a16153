//! Interaction protocol between the assistant agent and the chat client
//!
//! Two vocabularies live here: the interactive elements an assistant
//! message may carry instead of (or next to) prose, and the events a
//! streaming turn emits.

mod elements;
mod events;
pub mod render;

pub use elements::*;
pub use events::*;
