//! Trace file format: a JSON-lines recording of detector-contract calls,
//! standing in for the out-of-scope binary instrumenter so the detector can
//! be driven and demonstrated without one.

use std::io::BufRead;
use std::path::Path;

use serde::Deserialize;

use racewatch_core::error::DetectorError;
use racewatch_core::thread_state::ThreadId;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceEvent {
    Fork { parent: ThreadId, child: ThreadId },
    Join { parent: ThreadId, child: ThreadId },
    Read { tid: ThreadId, pc: u64, addr: u64, size: u8 },
    Write { tid: ThreadId, pc: u64, addr: u64, size: u8 },
    Acquire { tid: ThreadId, handle: u64 },
    Release { tid: ThreadId, handle: u64 },
    HappensBefore { tid: ThreadId, id: u64 },
    HappensAfter { tid: ThreadId, id: u64 },
    Allocate { tid: ThreadId, addr: u64, size: u64 },
    Deallocate { tid: ThreadId, addr: u64 },
    FuncEnter { tid: ThreadId, pc: u64 },
    FuncExit { tid: ThreadId },
    EnterExclude { tid: ThreadId },
    LeaveExclude { tid: ThreadId },
}

pub struct Trace {
    pub master_tid: ThreadId,
    pub events: Vec<TraceEvent>,
}

impl Trace {
    /// One JSON object per line; blank lines and `#`-prefixed lines are
    /// skipped so traces can carry comments.
    pub fn load(path: &Path, master_tid: ThreadId) -> Result<Trace, DetectorError> {
        let file = std::fs::File::open(path)
            .map_err(|e| DetectorError::resource(format!("cannot open trace {path:?}: {e}")))?;
        let reader = std::io::BufReader::new(file);
        let mut events = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line
                .map_err(|e| DetectorError::resource(format!("cannot read trace {path:?}: {e}")))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let event: TraceEvent = serde_json::from_str(trimmed).map_err(|e| {
                DetectorError::usage(format!("trace {path:?} line {}: {e}", lineno + 1))
            })?;
            events.push(event);
        }
        Ok(Trace { master_tid, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_event_per_line_and_skips_comments() {
        let dir = tempfile_dir();
        let path = dir.join("t.jsonl");
        std::fs::write(
            &path,
            "# a wr race\n\
             {\"op\":\"fork\",\"parent\":1,\"child\":10}\n\
             {\"op\":\"write\",\"tid\":10,\"pc\":1,\"addr\":4096,\"size\":8}\n",
        )
        .unwrap();

        let trace = Trace::load(&path, 1).unwrap();
        assert_eq!(trace.events.len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("racewatch-trace-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
