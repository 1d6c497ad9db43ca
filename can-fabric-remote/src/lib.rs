//! Remote transport for the `can-fabric` engine.
//!
//! A [`FabricServer`] hosts a fabric behind a TCP listener with one
//! real-time worker thread per connection. [`RemoteFabric`] is the client
//! side: it implements [`can_fabric::FabricOps`] over the binary wire
//! protocol in [`wire`], so code written against the trait cannot tell a
//! remote fabric from a local one. [`FabricSession`] picks between the two
//! at runtime.

pub mod alloc;
pub mod client;
pub mod server;
pub mod wire;

pub use alloc::{RtArena, RtBuf};
pub use client::{EventReceiver, FabricEvent, RemoteFabric};
pub use server::{FabricServer, ServerConfig};

use can_fabric::{
    AcceptRule, CanFdFrame, CanFrame, Fabric, FabricError, FabricOps, FaultRequest, FifoHandle,
    FlushMask, OverflowPolicy,
};
use std::sync::Arc;

/// A fabric reachable under one name, wherever it lives.
pub enum FabricSession {
    Local(Arc<Fabric>),
    Remote(RemoteFabric),
}

impl FabricSession {
    pub fn is_remote(&self) -> bool {
        matches!(self, FabricSession::Remote(_))
    }
}

impl FabricOps for FabricSession {
    fn create_fifo(
        &self,
        depth: usize,
        fd: bool,
        policy: OverflowPolicy,
    ) -> Result<FifoHandle, FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.create_fifo(depth, fd, policy),
            FabricSession::Remote(remote) => remote.create_fifo(depth, fd, policy),
        }
    }

    fn delete_fifo(&self, handle: FifoHandle) -> Result<(), FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.delete_fifo(handle),
            FabricSession::Remote(remote) => remote.delete_fifo(handle),
        }
    }

    fn set_accept_filter(
        &self,
        handle: FifoHandle,
        rules: &[AcceptRule],
    ) -> Result<(), FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.set_accept_filter(handle, rules),
            FabricSession::Remote(remote) => remote.set_accept_filter(handle, rules),
        }
    }

    fn flush(&self, handle: FifoHandle, mask: FlushMask) -> Result<(), FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.flush(handle, mask),
            FabricSession::Remote(remote) => remote.flush(handle, mask),
        }
    }

    fn read_frame(&self, handle: FifoHandle) -> Result<Option<CanFrame>, FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.read_frame(handle),
            FabricSession::Remote(remote) => remote.read_frame(handle),
        }
    }

    fn read_frames(&self, handle: FifoHandle, max: usize) -> Result<Vec<CanFrame>, FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.read_frames(handle, max),
            FabricSession::Remote(remote) => remote.read_frames(handle, max),
        }
    }

    fn write_frame(&self, handle: FifoHandle, frame: &CanFrame) -> Result<(), FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.write_frame(handle, frame),
            FabricSession::Remote(remote) => remote.write_frame(handle, frame),
        }
    }

    fn write_frames(&self, handle: FifoHandle, frames: &[CanFrame]) -> Result<usize, FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.write_frames(handle, frames),
            FabricSession::Remote(remote) => remote.write_frames(handle, frames),
        }
    }

    fn read_fd_frame(&self, handle: FifoHandle) -> Result<Option<CanFdFrame>, FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.read_fd_frame(handle),
            FabricSession::Remote(remote) => remote.read_fd_frame(handle),
        }
    }

    fn read_fd_frames(
        &self,
        handle: FifoHandle,
        max: usize,
    ) -> Result<Vec<CanFdFrame>, FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.read_fd_frames(handle, max),
            FabricSession::Remote(remote) => remote.read_fd_frames(handle, max),
        }
    }

    fn write_fd_frame(&self, handle: FifoHandle, frame: &CanFdFrame) -> Result<(), FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.write_fd_frame(handle, frame),
            FabricSession::Remote(remote) => remote.write_fd_frame(handle, frame),
        }
    }

    fn write_fd_frames(
        &self,
        handle: FifoHandle,
        frames: &[CanFdFrame],
    ) -> Result<usize, FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.write_fd_frames(handle, frames),
            FabricSession::Remote(remote) => remote.write_fd_frames(handle, frames),
        }
    }

    fn install_fault(&self, req: &FaultRequest) -> Result<(), FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.install_fault(req),
            FabricSession::Remote(remote) => remote.install_fault(req),
        }
    }

    fn reset_fault(&self) -> Result<(), FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.reset_fault(),
            FabricSession::Remote(remote) => remote.reset_fault(),
        }
    }

    fn ping(&self, value: u32) -> Result<u32, FabricError> {
        match self {
            FabricSession::Local(fabric) => fabric.ping(value),
            FabricSession::Remote(remote) => remote.ping(value),
        }
    }
}
