pub mod config;
pub mod error;
pub mod fees;
pub mod handler;
pub mod management;
pub mod requests;
pub mod runtime;
pub mod sequence;
pub mod simulate;
pub mod submit;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod validation;

pub use config::{Config, Network};
pub use error::{ErrorCode, GatewayError, GatewayResult};
pub use handler::Gateway;
pub use requests::{
    BuildRequest, GatewayRequest, InboundRequest, ResponseEnvelope,
    TxSummary,
};
pub use runtime::{
    RelayerInfo, RelayerRuntime, RuntimeError, RuntimeResult,
    SendTransactionRequest, Submission, WaitStatus,
};
