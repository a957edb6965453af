//! Client side of the managed-code symbol resolver protocol.
//!
//! The resolver itself is an external process; this module only speaks its
//! tagged-message wire protocol over a channel and owns the
//! timeout/protocol-error fallback behavior the detector contract requires.
//! A real transport (shared memory, a pipe) plugs in by constructing a
//! [`ResolverClient`] from a type that implements [`ResolverTransport`];
//! tests use an in-memory channel pair.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use ahash::AHashMap;

use crate::error::DetectorError;

/// Tagged messages exchanged with the external resolver process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverMessage {
    Connect,
    Pid(u32),
    Attached,
    LoadSyms { module: String },
    Confirm { module: String, available: bool },
    Wait,
    Exit,
}

/// Anything that can carry [`ResolverMessage`]s to and from the external
/// process. A blocking channel pair satisfies this in tests; a shared-memory
/// ring buffer would in production.
pub trait ResolverTransport {
    fn send(&self, msg: ResolverMessage) -> Result<(), DetectorError>;
    fn recv_timeout(&self, timeout: Duration) -> Result<ResolverMessage, DetectorError>;
}

/// A transport backed by a pair of `std::sync::mpsc` channels, for tests and
/// for in-process resolver shims.
pub struct ChannelTransport {
    pub tx: Sender<ResolverMessage>,
    pub rx: Receiver<ResolverMessage>,
}

impl ResolverTransport for ChannelTransport {
    fn send(&self, msg: ResolverMessage) -> Result<(), DetectorError> {
        self.tx
            .send(msg)
            .map_err(|e| DetectorError::protocol(format!("resolver channel closed: {e}")))
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<ResolverMessage, DetectorError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => DetectorError::protocol("resolver response timed out"),
            RecvTimeoutError::Disconnected => {
                DetectorError::protocol("resolver channel disconnected")
            }
        })
    }
}

/// Whether a module's symbols are available from the resolver, once
/// resolved — `Unresolved` modules fall back to raw pc reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolAvailability {
    Available,
    Unavailable,
    Unresolved,
}

/// Client-side state machine: connect, announce the pid, wait for
/// `ATTACHED`, then request symbols per module as they're seen.
pub struct ResolverClient<T: ResolverTransport> {
    transport: T,
    timeout: Duration,
    modules: AHashMap<String, SymbolAvailability>,
    attached: bool,
}

impl<T: ResolverTransport> ResolverClient<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        ResolverClient {
            transport,
            timeout,
            modules: AHashMap::new(),
            attached: false,
        }
    }

    /// Handshake with the external process. On timeout or protocol error,
    /// the client stays un-attached and every subsequent module resolves to
    /// raw-pc fallback — this is the required tolerate-and-degrade behavior,
    /// never a propagated failure.
    pub fn connect(&mut self, pid: u32) {
        if let Err(e) = self.transport.send(ResolverMessage::Connect) {
            e.log();
            return;
        }
        if let Err(e) = self.transport.send(ResolverMessage::Pid(pid)) {
            e.log();
            return;
        }
        match self.transport.recv_timeout(self.timeout) {
            Ok(ResolverMessage::Attached) => self.attached = true,
            Ok(_) => {
                DetectorError::protocol("unexpected reply to CONNECT/PID").log();
            }
            Err(e) => e.log(),
        }
    }

    /// Request symbols for `module`, returning whether they turned out to be
    /// available. Falls back to `Unresolved` (raw pc) on timeout or protocol
    /// error without resetting the whole connection — only this module is
    /// affected.
    pub fn resolve_module(&mut self, module: &str) -> SymbolAvailability {
        if let Some(&known) = self.modules.get(module) {
            return known;
        }
        if !self.attached {
            return SymbolAvailability::Unresolved;
        }

        let availability = (|| -> Result<SymbolAvailability, DetectorError> {
            self.transport.send(ResolverMessage::LoadSyms {
                module: module.to_string(),
            })?;
            match self.transport.recv_timeout(self.timeout)? {
                ResolverMessage::Confirm { available, .. } => Ok(if available {
                    SymbolAvailability::Available
                } else {
                    SymbolAvailability::Unavailable
                }),
                ResolverMessage::Wait => {
                    // one more try; the resolver is still loading the module
                    match self.transport.recv_timeout(self.timeout)? {
                        ResolverMessage::Confirm { available, .. } => Ok(if available {
                            SymbolAvailability::Available
                        } else {
                            SymbolAvailability::Unavailable
                        }),
                        _ => Err(DetectorError::protocol("unexpected reply after WAIT")),
                    }
                }
                _ => Err(DetectorError::protocol("unexpected reply to LOADSYMS")),
            }
        })();

        let result = availability.unwrap_or_else(|e| {
            e.log();
            self.attached = false; // protocol error resets the connection
            SymbolAvailability::Unresolved
        });
        self.modules.insert(module.to_string(), result);
        result
    }

    pub fn disconnect(&mut self) {
        let _ = self.transport.send(ResolverMessage::Exit);
        self.attached = false;
    }
}
