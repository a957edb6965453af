//! Drive an [`Engine`] from a recorded [`Trace`], in place of the external
//! binary instrumenter.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;

use racewatch_core::config::Config;
use racewatch_core::engine::{Engine, Tls};
use racewatch_core::error::DetectorError;
use racewatch_core::sink::Sink;
use racewatch_core::thread_state::ThreadId;
use racewatch_sinks::{TerminalSink, ValkyrieXmlSink};

use crate::trace::{Trace, TraceEvent};

pub struct ReplayArgs {
    pub trace_path: PathBuf,
    pub config_path: Option<PathBuf>,
    /// Cleared by the process's ctrlc handler; checked between trace events
    /// so a long replay can be cut short, the way `commands::record`'s
    /// recording loop checks it between samples.
    pub running: Arc<AtomicBool>,
}

pub struct ReplayOutcome {
    pub summary: racewatch_core::race::FinalizeSummary,
}

/// Applies each [`TraceEvent`] to `engine`, tracking the live `Tls` per
/// `ThreadId` the way the instrumenter would track its per-thread token.
struct Replayer<'e> {
    engine: &'e Engine,
    tokens: AHashMap<ThreadId, Tls>,
}

impl<'e> Replayer<'e> {
    fn new(engine: &'e Engine, master_tid: ThreadId) -> Self {
        let mut tokens = AHashMap::new();
        tokens.insert(master_tid, engine.register_thread(master_tid));
        Replayer { engine, tokens }
    }

    fn token(&self, tid: ThreadId) -> Option<&Tls> {
        self.tokens.get(&tid)
    }

    fn apply(&mut self, event: &TraceEvent) {
        match *event {
            TraceEvent::Fork { parent, child } => {
                let Some(parent_tls) = self.token(parent).cloned() else {
                    DetectorError::usage(format!("fork from unknown parent tid {parent}")).log();
                    return;
                };
                let child_tls = self.engine.fork(&parent_tls, child);
                self.tokens.insert(child, child_tls);
            }
            TraceEvent::Join { parent, child } => {
                let Some(parent_tls) = self.token(parent).cloned() else {
                    DetectorError::usage(format!("join from unknown parent tid {parent}")).log();
                    return;
                };
                self.engine.join(&parent_tls, child);
                self.tokens.remove(&child);
            }
            TraceEvent::Read { tid, pc, addr, size } => self.with_tls(tid, |e, t| e.read(t, pc, addr, size)),
            TraceEvent::Write { tid, pc, addr, size } => self.with_tls(tid, |e, t| e.write(t, pc, addr, size)),
            TraceEvent::Acquire { tid, handle } => self.with_tls(tid, |e, t| e.acquire(t, handle)),
            TraceEvent::Release { tid, handle } => self.with_tls(tid, |e, t| e.release(t, handle)),
            TraceEvent::HappensBefore { tid, id } => self.with_tls(tid, |e, t| e.happens_before(t, id)),
            TraceEvent::HappensAfter { tid, id } => self.with_tls(tid, |e, t| e.happens_after(t, id)),
            TraceEvent::Allocate { tid, addr, size } => self.with_tls(tid, |e, t| e.allocate(t, addr, size)),
            TraceEvent::Deallocate { tid, addr } => self.with_tls(tid, |e, t| e.deallocate(t, addr)),
            TraceEvent::FuncEnter { tid, pc } => self.with_tls(tid, |e, t| e.func_enter(t, pc)),
            TraceEvent::FuncExit { tid } => self.with_tls(tid, |e, t| e.func_exit(t)),
            TraceEvent::EnterExclude { tid } => self.with_tls(tid, |e, t| e.enter_exclude(t)),
            TraceEvent::LeaveExclude { tid } => self.with_tls(tid, |e, t| e.leave_exclude(t)),
        }
    }

    fn with_tls(&self, tid: ThreadId, f: impl FnOnce(&Engine, &Tls)) {
        match self.token(tid) {
            Some(tls) => f(self.engine, tls),
            None => DetectorError::usage(format!("event for unregistered tid {tid}")).log(),
        }
    }
}

fn build_sinks(config: &Config) -> Result<Vec<Box<dyn Sink>>, DetectorError> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    if config.output.terminal {
        sinks.push(Box::new(TerminalSink::new(std::io::stdout())));
    }
    if let Some(path) = &config.output.xml_file {
        let file = std::fs::File::create(path)
            .map_err(|e| DetectorError::resource(format!("cannot create {path:?}: {e}")))?;
        sinks.push(Box::new(ValkyrieXmlSink::new(file, std::process::id())?));
    }
    Ok(sinks)
}

pub fn run(args: ReplayArgs) -> Result<ReplayOutcome, DetectorError> {
    let config = Config::load(args.config_path.as_deref())?;
    let trace = Trace::load(&args.trace_path, 1)?;
    let engine = Engine::init(config.clone());
    let mut replayer = Replayer::new(&engine, trace.master_tid);

    for event in &trace.events {
        if !args.running.load(Ordering::SeqCst) {
            log::warn!("replay interrupted, finalizing with events applied so far");
            break;
        }
        replayer.apply(event);
    }

    let mut sinks = build_sinks(&config)?;
    let summary = engine.finalize(&mut sinks);
    log::info!(
        "replay finished: {} races, {} dropped events",
        summary.races_reported,
        engine.dropped_events()
    );
    Ok(ReplayOutcome { summary })
}

/// A [`Sink`] that hands every race to a shared `Vec`, so the caller can
/// read the results back after [`Engine::finalize`] has consumed the sink
/// through its trait object.
#[derive(Clone, Default)]
struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<racewatch_core::race::Race>>>);

impl Sink for SharedSink {
    fn write_race(&mut self, race: &racewatch_core::race::Race) -> Result<(), DetectorError> {
        self.0.lock().unwrap().push(race.clone());
        Ok(())
    }
    fn flush(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }
    fn close(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }
}

/// Replay straight into memory, for the `selftest` command and tests — no
/// file or terminal output.
pub fn run_in_memory(
    trace: &Trace,
    config: &Config,
) -> (racewatch_core::race::FinalizeSummary, Vec<racewatch_core::race::Race>) {
    let engine = Engine::init(config.clone());
    let mut replayer = Replayer::new(&engine, trace.master_tid);
    for event in &trace.events {
        replayer.apply(event);
    }
    let shared = SharedSink::default();
    let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(shared.clone())];
    let summary = engine.finalize(&mut sinks);
    let races = shared.0.lock().unwrap().clone();
    (summary, races)
}
