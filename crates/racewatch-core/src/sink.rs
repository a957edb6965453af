//! The narrow capability set a race report consumer implements.
//!
//! Kept deliberately small so that XML, terminal, and in-memory-for-tests
//! sinks (the three concrete implementations in `racewatch-sinks`) all fit
//! it without leaking their own I/O details into `racewatch-core`.

use crate::error::DetectorError;
use crate::race::Race;

pub trait Sink: Send {
    fn write_race(&mut self, race: &Race) -> Result<(), DetectorError>;
    fn flush(&mut self) -> Result<(), DetectorError>;
    fn close(&mut self) -> Result<(), DetectorError>;
}
