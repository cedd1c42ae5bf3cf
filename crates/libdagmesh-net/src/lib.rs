pub mod error;
pub mod identity;
pub mod message;
pub mod transport;
pub mod retry;
pub mod topology;
pub mod node;
pub mod convergence;
pub mod action;
pub mod cluster;

pub use error::NetError;
pub use identity::PeerInfo;
pub use message::{DocHeads, Envelope, Request, Response};
pub use transport::Network;
pub use topology::{InboundReplicator, PeerState, ReplicatorEdge};
pub use node::{Node, SyncReport, SyncSummary, WriteOutcome};
pub use convergence::{ConvergenceTracker, DocHeadState};
pub use action::{Action, Fields};
pub use cluster::{Cluster, ClusterBuilder};
