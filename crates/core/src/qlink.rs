//! Request and result types exchanged between node programs, EGP adapters,
//! link layers and schedulers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::node::{CreateId, NodeId};

/// Ask the link to create `number` entangled pairs with the remote node and
/// keep them in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqCreateAndKeep {
    pub remote_node_id: NodeId,
    pub number: u32,
}

impl ReqCreateAndKeep {
    pub fn new(remote_node_id: NodeId, number: u32) -> Self {
        Self {
            remote_node_id,
            number,
        }
    }
}

/// Accept pairs created by the remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqReceive {
    pub remote_node_id: NodeId,
}

impl ReqReceive {
    pub fn new(remote_node_id: NodeId) -> Self {
        Self { remote_node_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EgpRequest {
    CreateAndKeep(ReqCreateAndKeep),
    Receive(ReqReceive),
}

impl EgpRequest {
    pub fn remote_node_id(&self) -> NodeId {
        match self {
            EgpRequest::CreateAndKeep(req) => req.remote_node_id,
            EgpRequest::Receive(req) => req.remote_node_id,
        }
    }
}

impl From<ReqCreateAndKeep> for EgpRequest {
    fn from(req: ReqCreateAndKeep) -> Self {
        EgpRequest::CreateAndKeep(req)
    }
}

impl From<ReqReceive> for EgpRequest {
    fn from(req: ReqReceive) -> Self {
        EgpRequest::Receive(req)
    }
}

/// One delivered pair, as seen from one of its two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResCreateAndKeep {
    /// Create id assigned by the requesting node
    pub create_id: CreateId,
    /// Memory position holding this node's half of the pair
    pub logical_qubit_id: usize,
    pub remote_node_id: NodeId,
    /// Index of this pair within its request
    pub sequence_number: u32,
    /// Fidelity the link model reports for the pair
    pub fidelity: f64,
    /// Attempts the link spent on this pair
    pub attempts: u32,
    /// Delivery time (virtual nanos)
    pub time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Heralded failures exhausted the attempt budget
    Timeout,
    /// No free communication qubit on one of the two devices
    OutOfMemory,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Timeout => write!(f, "timeout"),
            ErrorCode::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Failed request, delivered to the requesting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResError {
    pub create_id: CreateId,
    pub remote_node_id: NodeId,
    pub code: ErrorCode,
    pub time: u64,
}

/// Label a node program waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignalLabel {
    CreateAndKeep,
    Error,
}

impl fmt::Display for SignalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalLabel::CreateAndKeep => write!(f, "ResCreateAndKeep"),
            SignalLabel::Error => write!(f, "ResError"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EgpResult {
    CreateAndKeep(ResCreateAndKeep),
    Error(ResError),
}

impl EgpResult {
    pub fn label(&self) -> SignalLabel {
        match self {
            EgpResult::CreateAndKeep(_) => SignalLabel::CreateAndKeep,
            EgpResult::Error(_) => SignalLabel::Error,
        }
    }

    pub fn create_id(&self) -> CreateId {
        match self {
            EgpResult::CreateAndKeep(res) => res.create_id,
            EgpResult::Error(err) => err.create_id,
        }
    }
}
