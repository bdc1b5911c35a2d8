pub mod error;
pub mod requests;
pub mod responses;

#[cfg(test)]
mod tests;

pub use error::{Result, TidewireError};
pub use requests::{Frame, MethodName, ParsedRequest, RequestId, RpcArgs, RpcRequest};
pub use responses::{RpcResponse, RpcResult, RpcStats};
