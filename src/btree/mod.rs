//! Page-local B+-tree primitives: key encoding, leaf/index page payloads,
//! split/join scoring policies, long records, and the generic key/value
//! codec seam. Traversal and mutation across whole trees lives one level up
//! in [`crate::tree`]; this module only knows about the contents of a single
//! page.

pub mod codecs;
pub mod join;
pub mod key;
pub mod longrecord;
pub mod page;
pub mod split;

pub use codecs::{KeyCodec, ValCodec};
pub use join::JoinPolicy;
pub use key::{Key, Segment};
pub use longrecord::LongRecordDescriptor;
pub use page::{FindResult, IndexEntry, IndexPage, LeafEntry, LeafPage};
pub use split::{SequenceHint, SplitPolicy};
