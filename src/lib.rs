//! Remote terminal execution service: a PTY-execution engine fronted by a
//! WebSocket/SSE fanout server.
//!
//! [`terminal`] owns the PTY/shell lifecycle, [`reader`] bridges its
//! blocking reads onto a tokio channel, [`execution`] batches that output
//! into poll-cycle responses, [`service`] dispatches execute requests
//! across Executions, [`topic`] is the in-memory pub/sub registry, and
//! [`server`] wires sessions, WebSockets, and topics together behind the
//! HTTP/JSON surface.

pub mod error;
pub mod execution;
pub mod reader;
pub mod sanitize;
pub mod server;
pub mod service;
pub mod terminal;
pub mod topic;

pub use error::EngineError;
pub use execution::{Execution, ExecutionResponse, ProcessAction, ProcessUpdate};
pub use server::{router, ServerState};
pub use service::{ExecuteRequest, ExecutionObserver, ExecutionRef, NewProcessRequest, Service};
pub use terminal::Terminal;
pub use topic::{TopicManager, TopicMessage};
