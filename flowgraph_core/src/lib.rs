//! Foundational mechanisms shared by the dataflow engine: the bipartite
//! ring buffer that carries samples between blocks, the wire-level
//! [`DataType`] taxonomy, reference-counted record payloads, and a
//! stack-allocated vector for the sample multiplexer's hot path.

pub mod datatype;
pub mod error;
pub mod refcount;
pub mod ring_buffer;
pub mod stack_vec;

pub use datatype::{DataType, RefCountedKind};
pub use error::{BufferError, Result};
pub use refcount::RefCounted;
pub use ring_buffer::{ring_buffer, Reader, Writer, WriterCloser, DEFAULT_CAPACITY, MAX_READERS};
pub use stack_vec::StackVec;
