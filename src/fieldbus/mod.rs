//! Field-bus read contract.
//!
//! Only "connect to a controller" and "read raw bytes of a block" are
//! consumed here; the wire protocol lives behind the trait.

mod simulated;

pub use simulated::*;

use crate::layout::ControllerConfig;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldBusError {
    #[error("cannot connect to {controller}: {reason}")]
    Connection { controller: String, reason: String },
    #[error("read of block {block_id} failed: {reason}")]
    Read { block_id: u16, reason: String },
    #[error("read of block {block_id} timed out after {timeout:?}")]
    Timeout { block_id: u16, timeout: Duration },
    #[error("block {block_id}: expected {expected} bytes, got {got}")]
    ShortRead {
        block_id: u16,
        expected: usize,
        got: usize,
    },
}

/// A controller access channel. Sessions are exclusive: one read at a time.
pub trait FieldBus: Send + Sync + 'static {
    type Session: Send + 'static;

    fn connect(
        &self,
        controller: &ControllerConfig,
    ) -> impl Future<Output = Result<Self::Session, FieldBusError>> + Send;

    /// Read `length` bytes of `block_id` starting at `offset`.
    fn read_block(
        &self,
        session: &mut Self::Session,
        block_id: u16,
        offset: usize,
        length: usize,
    ) -> impl Future<Output = Result<Vec<u8>, FieldBusError>> + Send;
}
