//! Concrete [`racewatch_core::Sink`] implementations: Valkyrie/Helgrind-
//! compatible XML, a human-readable terminal writer, and an in-memory sink
//! for tests.

pub mod memory;
pub mod terminal;
pub mod xml;

pub use memory::InMemorySink;
pub use terminal::TerminalSink;
pub use xml::ValkyrieXmlSink;
