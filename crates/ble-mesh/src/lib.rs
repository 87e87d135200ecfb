//! Broadcast mesh transport for offline transfer relaying
//!
//! This crate splits messages into advertisement-sized chunks, reassembles
//! them from whatever order the channel delivers, repeats queued messages
//! round-robin, and lets a connected node submit relayed transfers to the
//! ledger and flood the result back.

pub mod adapter;
pub mod codec;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod reassembly;
pub mod scheduler;

// Re-export main types
pub use adapter::{ListenHandle, MeshTransport};
pub use codec::{Chunk, ChunkHeader, EncodeMeta, MessageId, CHUNK_LEN, MAX_MESSAGE_LEN};
pub use connectivity::ConnectivityFlag;
pub use engine::{BroadcastInfo, EngineConfig, MeshEngine, MeshEvent, MessageSummary};
pub use error::{MeshError, MeshResult};
pub use gateway::{FailureStage, GatewayConfig, GatewayRelay, GatewayResponse};
pub use reassembly::{ChunkOutcome, MessageRole, Progress, ReassemblyStore};
pub use scheduler::{BroadcastScheduler, TickOutcome};
