//! Strata Server - the per-shard replication pipeline.
//!
//! A node hosts a set of shard controllers, one role per shard:
//!
//! - The [`ShardsDirector`] maps shard id to the controller holding its
//!   role on this node and enforces that the roles never coexist.
//! - A [`LeaderController`] orders client write batches into the shard log,
//!   replicates them to followers, commits on quorum, applies committed
//!   entries, and answers clients with assigned version ids.
//! - A [`FollowerController`] receives the leader's log stream, persists
//!   entries, acks the highest contiguous durable offset, and applies up to
//!   the leader's commit watermark.
//!
//! The transport is an external collaborator: controllers speak through the
//! [`ReplicationRpcProvider`] trait and plain request/response structs.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod director;
mod error;
mod follower;
mod leader;
mod quorum;
mod rpc;

pub use config::ControllerConfig;
pub use director::{DirectorContext, ShardsDirector};
pub use error::{ServerError, ServerResult};
pub use follower::FollowerController;
pub use leader::{LeaderController, LeaderInfo, LeaderStatus};
pub use quorum::QuorumTracker;
pub use rpc::{
    AppendAck, AppendRequest, BecomeLeaderRequest, DeleteShardRequest, DeleteShardResponse,
    LogEntry, NewTermRequest, NewTermResponse, ReadRequest, ReadResponse, ReplicateStream,
    ReplicationRpcProvider, SnapshotResponse, TruncateRequest, TruncateResponse, WriteRequest,
    WriteResponse,
};
