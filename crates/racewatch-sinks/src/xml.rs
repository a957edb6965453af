//! Valkyrie/Helgrind-compatible XML sink.
//!
//! Element ordering and attribute names follow the authoritative reference
//! for this format: DRace's `sink::Valkyrie`. Races stream out as soon as
//! they're written rather than being buffered for a single pass, since the
//! element order (`status RUNNING` before any `error`, `status FINISHED`
//! after the last one) is a prefix/suffix around an arbitrarily long middle
//! section.

use std::io::Write as IoWrite;

use chrono::Utc;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use racewatch_core::error::DetectorError;
use racewatch_core::race::{AccessSnapshot, Race};
use racewatch_core::sink::Sink;

fn iso_time() -> String {
    Utc::now().to_rfc3339()
}

fn io_err(context: &str, e: impl std::fmt::Display) -> DetectorError {
    DetectorError::resource(format!("{context}: {e}"))
}

pub struct ValkyrieXmlSink<W: IoWrite> {
    writer: Writer<W>,
    pid: u32,
    next_id: u64,
    start_time: String,
    finished: bool,
}

impl<W: IoWrite> ValkyrieXmlSink<W> {
    pub fn new(out: W, pid: u32) -> Result<Self, DetectorError> {
        let writer = Writer::new_with_indent(out, b' ', 2);
        let mut sink = ValkyrieXmlSink {
            writer,
            pid,
            next_id: 0,
            start_time: iso_time(),
            finished: false,
        };
        sink.write_preamble()?;
        Ok(sink)
    }

    fn elem_text(&mut self, name: &str, text: &str) -> Result<(), DetectorError> {
        self.writer
            .write_event(Event::Start(BytesStart::new(name)))
            .map_err(|e| io_err("xml start", e))?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(|e| io_err("xml text", e))?;
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(|e| io_err("xml end", e))
    }

    fn write_preamble(&mut self) -> Result<(), DetectorError> {
        self.writer
            .write_event(Event::Start(BytesStart::new("valgrindoutput")))
            .map_err(|e| io_err("xml root", e))?;
        self.elem_text("protocolversion", "4")?;
        self.elem_text("protocoltool", "helgrind")?;
        self.elem_text("pid", &self.pid.to_string())?;
        self.elem_text("tool", "racewatch")?;

        self.writer
            .write_event(Event::Start(BytesStart::new("status")))
            .map_err(|e| io_err("xml status", e))?;
        self.elem_text("state", "RUNNING")?;
        let start_time = self.start_time.clone();
        self.elem_text("time", &start_time)?;
        self.writer
            .write_event(Event::End(BytesEnd::new("status")))
            .map_err(|e| io_err("xml status", e))
    }

    fn write_stack(&mut self, stack: &[u64]) -> Result<(), DetectorError> {
        self.writer
            .write_event(Event::Start(BytesStart::new("stack")))
            .map_err(|e| io_err("xml stack", e))?;
        // innermost frame first: the captured stack is outermost-first, so reverse it.
        for pc in stack.iter().rev() {
            self.writer
                .write_event(Event::Start(BytesStart::new("frame")))
                .map_err(|e| io_err("xml frame", e))?;
            self.elem_text("ip", &format!("0x{pc:x}"))?;
            self.elem_text("obj", "racewatch")?;
            self.writer
                .write_event(Event::End(BytesEnd::new("frame")))
                .map_err(|e| io_err("xml frame", e))?;
        }
        self.writer
            .write_event(Event::End(BytesEnd::new("stack")))
            .map_err(|e| io_err("xml stack", e))
    }

    fn write_xwhat(&mut self, label: &str, access: &AccessSnapshot) -> Result<(), DetectorError> {
        self.writer
            .write_event(Event::Start(BytesStart::new("xwhat")))
            .map_err(|e| io_err("xml xwhat", e))?;
        let kind = if access.is_write { "write" } else { "read" };
        self.elem_text(
            "text",
            &format!(
                "{label} {kind} of size {} at 0x{:x} by thread #{}",
                access.size, access.addr, access.tid
            ),
        )?;
        self.elem_text("hthreadid", &access.tid.to_string())?;
        self.write_stack(&access.captured_stack)?;
        self.writer
            .write_event(Event::End(BytesEnd::new("xwhat")))
            .map_err(|e| io_err("xml xwhat", e))
    }
}

impl<W: IoWrite + Send> Sink for ValkyrieXmlSink<W> {
    fn write_race(&mut self, race: &Race) -> Result<(), DetectorError> {
        let id = self.next_id;
        self.next_id += 1;

        self.writer
            .write_event(Event::Start(BytesStart::new("error")))
            .map_err(|e| io_err("xml error", e))?;
        self.elem_text("unique", &format!("0x{id:x}"))?;
        self.elem_text("tid", &race.second.tid.to_string())?;
        self.elem_text("threadname", "Thread")?;
        self.elem_text("kind", "Race")?;
        self.write_xwhat("Possible data race during", &race.second)?;
        self.write_xwhat("This conflicts with a previous", &race.first)?;
        self.writer
            .write_event(Event::End(BytesEnd::new("error")))
            .map_err(|e| io_err("xml error", e))
    }

    fn flush(&mut self) -> Result<(), DetectorError> {
        self.writer
            .get_mut()
            .flush()
            .map_err(|e| io_err("xml flush", e))
    }

    fn close(&mut self) -> Result<(), DetectorError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.writer
            .write_event(Event::Start(BytesStart::new("status")))
            .map_err(|e| io_err("xml status", e))?;
        self.elem_text("state", "FINISHED")?;
        self.elem_text("time", &iso_time())?;
        self.writer
            .write_event(Event::End(BytesEnd::new("status")))
            .map_err(|e| io_err("xml status", e))?;

        let mut duration = BytesStart::new("duration");
        duration.push_attribute(("unit", "ms"));
        self.writer
            .write_event(Event::Empty(duration))
            .map_err(|e| io_err("xml duration", e))?;

        self.writer
            .write_event(Event::End(BytesEnd::new("valgrindoutput")))
            .map_err(|e| io_err("xml root", e))?;
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racewatch_core::race::AccessSnapshot;

    fn race() -> Race {
        Race {
            first: AccessSnapshot {
                tid: 1,
                pc: 0x10,
                addr: 0x1000,
                size: 8,
                is_write: true,
                captured_stack: vec![0xAA, 0xBB].into(),
            },
            second: AccessSnapshot {
                tid: 2,
                pc: 0x20,
                addr: 0x1000,
                size: 8,
                is_write: false,
                captured_stack: vec![0xCC].into(),
            },
        }
    }

    #[test]
    fn emits_elements_in_valkyrie_order() {
        let mut buf = Vec::new();
        {
            let mut sink = ValkyrieXmlSink::new(&mut buf, 4242).unwrap();
            sink.write_race(&race()).unwrap();
            sink.close().unwrap();
        }
        let xml = String::from_utf8(buf).unwrap();

        let root = xml.find("<valgrindoutput>").unwrap();
        let proto = xml.find("<protocolversion>").unwrap();
        let first_status = xml.find("<status>").unwrap();
        let running = xml.find("RUNNING").unwrap();
        let error = xml.find("<error>").unwrap();
        let finished = xml.find("FINISHED").unwrap();
        let duration = xml.find("<duration").unwrap();

        assert!(root < proto);
        assert!(proto < first_status);
        assert!(first_status < running);
        assert!(running < error);
        assert!(error < finished);
        assert!(finished < duration);
        assert!(xml.contains("0x0"), "first race gets unique id 0x0");
    }

    #[test]
    fn double_close_is_idempotent() {
        let mut buf = Vec::new();
        let mut sink = ValkyrieXmlSink::new(&mut buf, 1).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
    }
}
