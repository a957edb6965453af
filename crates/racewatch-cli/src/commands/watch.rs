//! Live race-stream viewer: replays a trace and redraws the race list as
//! detections come in, instead of waiting for a single end-of-run report.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashSet;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph};

use racewatch_core::config::Config;
use racewatch_core::engine::{Engine, Tls};
use racewatch_core::error::DetectorError;
use racewatch_core::race::Race;
use racewatch_core::sink::Sink;
use racewatch_core::thread_state::ThreadId;

use crate::trace::{Trace, TraceEvent};

pub struct WatchArgs {
    pub trace_path: PathBuf,
    pub config_path: Option<PathBuf>,
    /// Cleared by the process's ctrlc handler; checked each frame alongside
    /// the `q`/`Esc` key so Ctrl+C tears the terminal down cleanly instead of
    /// leaving it in raw/alternate-screen mode.
    pub running: Arc<AtomicBool>,
}

const MAX_LINES: usize = 500;

fn race_key(race: &Race) -> (u64, u64, ThreadId, ThreadId) {
    let (pc_lo, pc_hi) = if race.first.pc <= race.second.pc {
        (race.first.pc, race.second.pc)
    } else {
        (race.second.pc, race.first.pc)
    };
    let (tid_lo, tid_hi) = if race.first.tid <= race.second.tid {
        (race.first.tid, race.second.tid)
    } else {
        (race.second.tid, race.first.tid)
    };
    (pc_lo, pc_hi, tid_lo, tid_hi)
}

fn race_line(race: &Race) -> String {
    format!(
        "tid {} {} 0x{:x}  vs  tid {} {} 0x{:x}",
        race.first.tid,
        if race.first.is_write { "write" } else { "read" },
        race.first.addr,
        race.second.tid,
        if race.second.is_write { "write" } else { "read" },
        race.second.addr,
    )
}

/// Scrollback shared between the render loop and the sink handed to
/// `Engine::finalize`. `finalize` is idempotent but not incremental — every
/// call hands the full retained race list to its sinks again — so entries
/// are deduped by the same `(min_pc, max_pc, min_tid, max_tid)` identity the
/// collector itself uses, rather than trusting call count.
#[derive(Default)]
struct Scrollback {
    seen: AHashSet<(u64, u64, ThreadId, ThreadId)>,
    lines: VecDeque<String>,
}

impl Scrollback {
    fn absorb(&mut self, race: &Race) {
        if !self.seen.insert(race_key(race)) {
            return;
        }
        self.lines.push_back(race_line(race));
        if self.lines.len() > MAX_LINES {
            self.lines.pop_front();
        }
    }
}

#[derive(Clone, Default)]
struct ScrollbackHandle(Arc<Mutex<Scrollback>>);

impl Sink for ScrollbackHandle {
    fn write_race(&mut self, race: &Race) -> Result<(), DetectorError> {
        self.0.lock().unwrap().absorb(race);
        Ok(())
    }
    fn flush(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }
    fn close(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }
}

/// Mirrors `commands::replay::Replayer`, but drip-feeds the trace one event
/// at a time so the viewer can redraw between events instead of all at once.
struct DripReplayer<'e> {
    engine: &'e Engine,
    tokens: ahash::AHashMap<ThreadId, Tls>,
}

impl<'e> DripReplayer<'e> {
    fn new(engine: &'e Engine, master_tid: ThreadId) -> Self {
        let mut tokens = ahash::AHashMap::new();
        tokens.insert(master_tid, engine.register_thread(master_tid));
        DripReplayer { engine, tokens }
    }

    fn apply(&mut self, event: &TraceEvent) {
        match *event {
            TraceEvent::Fork { parent, child } => {
                if let Some(parent_tls) = self.tokens.get(&parent).cloned() {
                    let child_tls = self.engine.fork(&parent_tls, child);
                    self.tokens.insert(child, child_tls);
                }
            }
            TraceEvent::Join { parent, child } => {
                if let Some(parent_tls) = self.tokens.get(&parent).cloned() {
                    self.engine.join(&parent_tls, child);
                    self.tokens.remove(&child);
                }
            }
            TraceEvent::Read { tid, pc, addr, size } => self.with(tid, |e, t| e.read(t, pc, addr, size)),
            TraceEvent::Write { tid, pc, addr, size } => self.with(tid, |e, t| e.write(t, pc, addr, size)),
            TraceEvent::Acquire { tid, handle } => self.with(tid, |e, t| e.acquire(t, handle)),
            TraceEvent::Release { tid, handle } => self.with(tid, |e, t| e.release(t, handle)),
            TraceEvent::HappensBefore { tid, id } => self.with(tid, |e, t| e.happens_before(t, id)),
            TraceEvent::HappensAfter { tid, id } => self.with(tid, |e, t| e.happens_after(t, id)),
            TraceEvent::Allocate { tid, addr, size } => self.with(tid, |e, t| e.allocate(t, addr, size)),
            TraceEvent::Deallocate { tid, addr } => self.with(tid, |e, t| e.deallocate(t, addr)),
            TraceEvent::FuncEnter { tid, pc } => self.with(tid, |e, t| e.func_enter(t, pc)),
            TraceEvent::FuncExit { tid } => self.with(tid, |e, t| e.func_exit(t)),
            TraceEvent::EnterExclude { tid } => self.with(tid, |e, t| e.enter_exclude(t)),
            TraceEvent::LeaveExclude { tid } => self.with(tid, |e, t| e.leave_exclude(t)),
        }
    }

    fn with(&self, tid: ThreadId, f: impl FnOnce(&Engine, &Tls)) {
        if let Some(tls) = self.tokens.get(&tid) {
            f(self.engine, tls);
        }
    }
}

struct App {
    scrollback: ScrollbackHandle,
    events_applied: usize,
    total_events: usize,
    finished: bool,
    running: bool,
    interrupt: Arc<AtomicBool>,
}

fn draw(f: &mut Frame, app: &App) {
    let area = f.area();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let scrollback = app.scrollback.0.lock().unwrap();
    let status = Paragraph::new(format!(
        "events {}/{}  races {}  {}",
        app.events_applied,
        app.total_events,
        scrollback.lines.len(),
        if app.finished { "finished — press q to quit" } else { "replaying…  press q to quit" }
    ))
    .block(Block::default().borders(Borders::ALL).title("racewatch"));
    f.render_widget(status, chunks[0]);

    let items: Vec<ListItem> = scrollback
        .lines
        .iter()
        .rev()
        .map(|l| ListItem::new(l.as_str()))
        .collect();
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title("races"));
    f.render_widget(list, chunks[1]);
}

pub fn run(args: WatchArgs) -> Result<(), DetectorError> {
    let config = Config::load(args.config_path.as_deref())?;
    let trace = Trace::load(&args.trace_path, 1)?;
    let engine = Engine::init(config);
    let mut replayer = DripReplayer::new(&engine, trace.master_tid);

    let mut terminal = setup_terminal().map_err(|e| DetectorError::resource(e.to_string()))?;
    let mut app = App {
        scrollback: ScrollbackHandle::default(),
        events_applied: 0,
        total_events: trace.events.len(),
        finished: false,
        running: true,
        interrupt: args.running.clone(),
    };

    let result = run_loop(&mut terminal, &mut app, &engine, &mut replayer, &trace.events);

    restore_terminal(&mut terminal).map_err(|e| DetectorError::resource(e.to_string()))?;
    result.map_err(|e| DetectorError::resource(e.to_string()))
}

type Term = Terminal<CrosstermBackend<io::Stdout>>;

fn setup_terminal() -> io::Result<Term> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    Terminal::new(CrosstermBackend::new(stdout))
}

fn restore_terminal(terminal: &mut Term) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    Ok(())
}

fn run_loop(
    terminal: &mut Term,
    app: &mut App,
    engine: &Engine,
    replayer: &mut DripReplayer,
    events: &[TraceEvent],
) -> io::Result<()> {
    while app.running {
        if !app.interrupt.load(Ordering::SeqCst) {
            app.running = false;
            app.finished = true;
        }

        if !app.finished {
            if let Some(event) = events.get(app.events_applied) {
                replayer.apply(event);
                app.events_applied += 1;
            } else {
                app.finished = true;
            }

            if app.events_applied % 64 == 0 || app.finished {
                let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(app.scrollback.clone())];
                engine.finalize(&mut sinks);
            }
        }

        terminal.draw(|f| draw(f, app))?;

        if event::poll(Duration::from_millis(if app.finished { 100 } else { 0 }))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press
                    && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                {
                    app.running = false;
                }
            }
        }
    }
    Ok(())
}
