//! The reason-act execution engine: demultiplexes model output into visible
//! and hidden reasoning channels, masks and recovers sensitive fields around
//! tool calls, renders short-term memory into the model-facing transcript,
//! and drives the executor loop that ties all of it together.

pub mod demux;
pub mod error;
pub mod executor;
pub mod frame;
pub mod memory;
pub mod model_client;
pub mod sensitive;
pub mod tools;

pub use error::{EngineError, Result};
pub use executor::{AgentExecConfig, CancelToken, DeepThinkConfig, ExecMode, Executor, ExecutorDeps, LoopBound};
pub use frame::FrameKind;
