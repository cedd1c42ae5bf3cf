pub mod types;
pub mod encoding;
pub mod hash;
pub mod crdt;
pub mod store;
pub mod assembler;
pub mod events;
pub mod gate;
pub mod keys;
pub mod config;
pub mod registry;
pub mod signing;
pub mod error;

pub use error::{Divergence, MeshError};
pub use types::{Cid, DocId, KeyId, PeerId, Topic};
pub use types::commit::{
    CollectionCommit, Commit, CompositeCommit, CrdtKind, DocStatus, FieldCommit, FieldDelta,
    FieldLink, FieldPayload, Value,
};
pub use types::document::Document;
pub use crdt::FieldState;
pub use store::{CommitStore, IngestOutcome, LockedStore};
pub use assembler::Assembler;
pub use events::{Event, EventBus, EventFilter, EventKind, MergeEvent, Subscription, UpdateEvent};
pub use gate::{AccessGate, AllowAll, PolicyGate};
pub use keys::{DocKey, KeyStore, Keyring};
pub use config::{load_node_config, save_node_config, NodeConfig};
pub use registry::{CollectionDef, CollectionRegistry};
pub use signing::NodeKeypair;
