pub mod ids;
pub mod commit;
pub mod document;
pub mod topic;

pub use ids::{Cid, DocId, KeyId, PeerId};
pub use topic::Topic;
