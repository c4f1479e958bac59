pub mod dispatch;
pub mod http;
pub mod registry;

pub use dispatch::{ExecutorContext, InvocationKind, ToolDispatcher, ToolFrame, ToolInvocation};
pub use http::HttpToolInvoker;
pub use registry::ToolRegistry;
