//! Start/stop bookkeeping for every protocol object of a network.

use std::{cell::RefCell, rc::Rc};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("`{0}` is already running")]
    AlreadyRunning(String),
    #[error("`{0}` is not running")]
    NotRunning(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to start `{name}`: {source}")]
    Start {
        name: String,
        #[source]
        source: ProtocolError,
    },
    #[error("{} protocol(s) failed to stop: {}", .0.len(), format_failures(.0))]
    Stop(Vec<(String, ProtocolError)>),
}

fn format_failures(failures: &[(String, ProtocolError)]) -> String {
    failures
        .iter()
        .map(|(name, error)| format!("{name} ({error})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Something that can be started and stopped by a [`ProtocolController`].
pub trait Lifecycle {
    fn start(&mut self) -> Result<(), ProtocolError>;
    fn stop(&mut self) -> Result<(), ProtocolError>;
    fn is_running(&self) -> bool;
}

impl<T: Lifecycle + ?Sized> Lifecycle for Rc<RefCell<T>> {
    fn start(&mut self) -> Result<(), ProtocolError> {
        self.borrow_mut().start()
    }

    fn stop(&mut self) -> Result<(), ProtocolError> {
        self.borrow_mut().stop()
    }

    fn is_running(&self) -> bool {
        self.borrow().is_running()
    }
}

struct Registered {
    name: String,
    protocol: Box<dyn Lifecycle>,
    started: bool,
}

/// Starts registered objects in registration order and stops them in the
/// same order.
#[derive(Default)]
pub struct ProtocolController {
    protocols: Vec<Registered>,
}

impl ProtocolController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, protocol: impl Lifecycle + 'static) {
        let name = name.into();
        tracing::trace!(%name, "Registering protocol");
        self.protocols.push(Registered {
            name,
            protocol: Box::new(protocol),
            started: false,
        });
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.protocols.iter().map(|p| p.name.as_str())
    }

    pub fn is_running(&self, name: &str) -> Option<bool> {
        self.protocols
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.protocol.is_running())
    }

    /// Starts every object not started yet. Stops at the first failure;
    /// objects started before it keep running.
    pub fn start_all(&mut self) -> Result<(), ControllerError> {
        let mut started = 0usize;
        for registered in self.protocols.iter_mut().filter(|p| !p.started) {
            registered
                .protocol
                .start()
                .map_err(|source| ControllerError::Start {
                    name: registered.name.clone(),
                    source,
                })?;
            registered.started = true;
            started += 1;
        }
        tracing::debug!(started, total = self.protocols.len(), "Protocols started");
        Ok(())
    }

    /// Stops every started object, continuing past failures.
    pub fn stop_all(&mut self) -> Result<(), ControllerError> {
        let mut failures = Vec::new();
        for registered in self.protocols.iter_mut().filter(|p| p.started) {
            registered.started = false;
            if let Err(error) = registered.protocol.stop() {
                tracing::warn!(name = %registered.name, %error, "Protocol failed to stop");
                failures.push((registered.name.clone(), error));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ControllerError::Stop(failures))
        }
    }
}

impl std::fmt::Debug for ProtocolController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolController")
            .field("protocols", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
