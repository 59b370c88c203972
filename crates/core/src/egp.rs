//! Entanglement generation protocol adapters.
//!
//! One [`EgpProtocol`] exists per ordered pair of end nodes joined by a link.
//! Node programs talk to it through a cloneable [`EgpHandle`].

use std::{cell::RefCell, future::Future, rc::Rc};

use crate::{
    controller::{Lifecycle, ProtocolError},
    link::{LinkError, SharedLink},
    node::{CreateId, NodeId, ProcessingNode},
    qlink::{EgpRequest, EgpResult, ResCreateAndKeep, ResError, SignalLabel},
    simulation::{Mailbox, Recv},
};

#[derive(Debug, thiserror::Error)]
pub enum EgpError {
    #[error("EGP `{0}` is not running")]
    NotRunning(String),
    #[error("EGP `{name}` serves node {peer}, not node {requested}")]
    WrongPeer {
        name: String,
        peer: NodeId,
        requested: NodeId,
    },
    #[error("request for zero pairs")]
    EmptyRequest,
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Result queues of one EGP, one per signal label.
#[derive(Clone, Default)]
pub struct EgpSignals {
    created: Mailbox<ResCreateAndKeep>,
    errors: Mailbox<ResError>,
}

impl EgpSignals {
    pub fn deliver(&self, result: EgpResult) {
        match result {
            EgpResult::CreateAndKeep(res) => self.created.push(res),
            EgpResult::Error(err) => self.errors.push(err),
        }
    }

    /// Resolves to the next result under `label`, or `None` once the
    /// signals are closed.
    pub fn await_signal(
        &self,
        label: SignalLabel,
    ) -> impl Future<Output = Option<EgpResult>> + 'static {
        let created = self.created.clone();
        let errors = self.errors.clone();
        async move {
            match label {
                SignalLabel::CreateAndKeep => created.recv().await.map(EgpResult::CreateAndKeep),
                SignalLabel::Error => errors.recv().await.map(EgpResult::Error),
            }
        }
    }

    pub fn pending(&self, label: SignalLabel) -> usize {
        match label {
            SignalLabel::CreateAndKeep => self.created.len(),
            SignalLabel::Error => self.errors.len(),
        }
    }

    fn close(&self) {
        self.created.close();
        self.errors.close();
    }
}

pub struct EgpProtocol {
    name: String,
    node: ProcessingNode,
    peer_name: String,
    peer_id: NodeId,
    link: SharedLink,
    signals: EgpSignals,
    running: bool,
}

impl EgpProtocol {
    pub fn new(node: ProcessingNode, peer: &ProcessingNode, link: SharedLink) -> Self {
        Self {
            name: format!("egp_{}_{}", node.name(), peer.name()),
            node,
            peer_name: peer.name().to_string(),
            peer_id: peer.id(),
            link,
            signals: EgpSignals::default(),
            running: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signals(&self) -> &EgpSignals {
        &self.signals
    }

    /// Validates `request` and forwards it to the link. `CreateAndKeep`
    /// returns the create id assigned to it.
    pub fn put(&self, request: EgpRequest) -> Result<Option<CreateId>, EgpError> {
        if !self.running {
            return Err(EgpError::NotRunning(self.name.clone()));
        }
        if request.remote_node_id() != self.peer_id {
            return Err(EgpError::WrongPeer {
                name: self.name.clone(),
                peer: self.peer_id,
                requested: request.remote_node_id(),
            });
        }
        match request {
            EgpRequest::CreateAndKeep(req) => {
                if req.number == 0 {
                    return Err(EgpError::EmptyRequest);
                }
                let create_id = self.node.next_create_id();
                self.link.borrow_mut().put_create(self.node.id(), req, create_id)?;
                Ok(Some(create_id))
            }
            EgpRequest::Receive(req) => {
                self.link
                    .borrow_mut()
                    .put_receive(self.node.id(), req.remote_node_id)?;
                Ok(None)
            }
        }
    }
}

impl Lifecycle for EgpProtocol {
    fn start(&mut self) -> Result<(), ProtocolError> {
        if self.running {
            return Err(ProtocolError::AlreadyRunning(self.name.clone()));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ProtocolError> {
        if !self.running {
            return Err(ProtocolError::NotRunning(self.name.clone()));
        }
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl std::fmt::Debug for EgpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgpProtocol")
            .field("name", &self.name)
            .field("peer", &self.peer_name)
            .field("running", &self.running)
            .finish()
    }
}

pub type SharedEgp = Rc<RefCell<EgpProtocol>>;

/// What a node program holds to use one EGP.
#[derive(Clone)]
pub struct EgpHandle {
    inner: SharedEgp,
    signals: EgpSignals,
    peer_name: String,
    peer_id: NodeId,
}

impl EgpHandle {
    pub fn new(inner: SharedEgp) -> Self {
        let (signals, peer_name, peer_id) = {
            let egp = inner.borrow();
            (egp.signals.clone(), egp.peer_name.clone(), egp.peer_id)
        };
        Self {
            inner,
            signals,
            peer_name,
            peer_id,
        }
    }

    pub fn put(&self, request: impl Into<EgpRequest>) -> Result<Option<CreateId>, EgpError> {
        self.inner.borrow().put(request.into())
    }

    pub fn await_signal(
        &self,
        label: SignalLabel,
    ) -> impl Future<Output = Option<EgpResult>> + 'static {
        self.signals.await_signal(label)
    }

    /// Next delivered pair.
    pub fn next_pair(&self) -> Recv<ResCreateAndKeep> {
        self.signals.created.recv()
    }

    pub fn next_error(&self) -> Recv<ResError> {
        self.signals.errors.recv()
    }

    pub fn pending(&self, label: SignalLabel) -> usize {
        self.signals.pending(label)
    }

    /// Wakes every waiter with `None`; no results are delivered afterwards.
    pub fn close(&self) {
        self.signals.close();
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn peer_id(&self) -> NodeId {
        self.peer_id
    }

    pub fn protocol(&self) -> &SharedEgp {
        &self.inner
    }
}

impl std::fmt::Debug for EgpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgpHandle").field("peer", &self.peer_name).finish()
    }
}
