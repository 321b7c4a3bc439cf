//! # Core Protocol Components
//!
//! Tagged values and the frame codec.
//!
//! ## Components
//! - **Value**: [`Data`], the tagged value delivered to callbacks, and its [`Tag`]
//! - **Codec**: [`FrameCodec`] for buffers and datagrams, [`recv_any`] for streams
//!
//! ## Wire Format
//! ```text
//! [Tag(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum payload size: 16MB by default (prevents memory exhaustion)
//! - Length validation before allocation
//! - Notification tags are never accepted from the wire

pub mod codec;
pub mod value;

pub use codec::{recv_any, FrameCodec, Received};
pub use value::{Data, Tag};
