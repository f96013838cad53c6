//! PyTorch `.pth` support: pickle replay, storage resolution and the decode strategies.

pub mod archive;
pub mod pickle_reader;
pub mod reader;
pub mod storage;
pub mod tensor;

pub use pickle_reader::{Object, OpCode, PersistentLoader, PickleError, StringEncoding, read_pickle};
pub use reader::CheckpointReader;
pub use storage::{ElementType, FlatValues};
pub use tensor::{Materialized, TensorRecord};
