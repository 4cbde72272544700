//! Assistant-initiated function calls.

pub mod call;
pub mod dispatcher;
pub mod http;
pub mod registry;

pub use call::{AmbientContext, FunctionCallRequest, FunctionCallResult, ToolOutcome};
pub use dispatcher::{DispatchDecision, DispatchOutcome, FunctionCallDispatcher};
pub use http::HttpToolHandler;
pub use registry::{FnToolHandler, ToolHandler, ToolRegistry};
