//! An in-memory sink, for tests that want to inspect reported races directly
//! instead of parsing a serialized format.

use racewatch_core::error::DetectorError;
use racewatch_core::race::Race;
use racewatch_core::sink::Sink;

#[derive(Debug, Default)]
pub struct InMemorySink {
    pub races: Vec<Race>,
    pub flushed: bool,
    pub closed: bool,
}

impl Sink for InMemorySink {
    fn write_race(&mut self, race: &Race) -> Result<(), DetectorError> {
        self.races.push(race.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DetectorError> {
        self.flushed = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DetectorError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn race() -> Race {
        use racewatch_core::race::AccessSnapshot;
        Race {
            first: AccessSnapshot {
                tid: 1,
                pc: 0x10,
                addr: 0x1000,
                size: 8,
                is_write: true,
                captured_stack: Default::default(),
            },
            second: AccessSnapshot {
                tid: 2,
                pc: 0x20,
                addr: 0x1000,
                size: 8,
                is_write: false,
                captured_stack: Default::default(),
            },
        }
    }

    #[test]
    fn records_races_in_order() {
        let mut sink = InMemorySink::default();
        sink.write_race(&race()).unwrap();
        sink.flush().unwrap();
        sink.close().unwrap();
        assert_eq!(sink.races.len(), 1);
        assert!(sink.flushed && sink.closed);
    }
}
