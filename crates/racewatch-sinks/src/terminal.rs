//! Human-readable race report, one block per race, to any `io::Write`.

use std::io::Write;

use racewatch_core::error::DetectorError;
use racewatch_core::race::{AccessSnapshot, Race};
use racewatch_core::sink::Sink;

pub struct TerminalSink<W: Write + Send> {
    out: W,
    count: u64,
}

impl<W: Write + Send> TerminalSink<W> {
    pub fn new(out: W) -> Self {
        TerminalSink { out, count: 0 }
    }

    fn fmt_access(a: &AccessSnapshot) -> String {
        let kind = if a.is_write { "write" } else { "read" };
        let mut s = format!(
            "  {kind} of {} bytes at 0x{:x} by thread {} (pc 0x{:x})",
            a.size, a.addr, a.tid, a.pc
        );
        for (depth, pc) in a.captured_stack.iter().rev().enumerate() {
            s.push_str(&format!("\n    #{depth} 0x{pc:x}"));
        }
        s
    }
}

impl<W: Write + Send> Sink for TerminalSink<W> {
    fn write_race(&mut self, race: &Race) -> Result<(), DetectorError> {
        self.count += 1;
        writeln!(self.out, "race #{}", self.count)
            .and_then(|_| writeln!(self.out, "{}", Self::fmt_access(&race.second)))
            .and_then(|_| writeln!(self.out, "  conflicts with:"))
            .and_then(|_| writeln!(self.out, "{}", Self::fmt_access(&race.first)))
            .map_err(|e| DetectorError::resource(format!("terminal sink write failed: {e}")))
    }

    fn flush(&mut self) -> Result<(), DetectorError> {
        self.out
            .flush()
            .map_err(|e| DetectorError::resource(format!("terminal sink flush failed: {e}")))
    }

    fn close(&mut self) -> Result<(), DetectorError> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racewatch_core::race::AccessSnapshot;

    #[test]
    fn writes_both_sides_of_a_race() {
        let race = Race {
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
        };

        let mut buf = Vec::new();
        {
            let mut sink = TerminalSink::new(&mut buf);
            sink.write_race(&race).unwrap();
            sink.flush().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("race #1"));
        assert!(text.contains("thread 1"));
        assert!(text.contains("thread 2"));
    }
}
