//! Error types for the keel language server front end.

use thiserror::Error;
use tower_lsp::jsonrpc;

/// Errors that can occur while starting or running the server.
#[derive(Debug, Error)]
pub enum Error {
    /// An error from the keel core.
    #[error("Core error: {0}")]
    Core(#[from] keel::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for keel-lsp operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The JSON-RPC error answering a request that failed with `err`.
///
/// Edits and URIs the client should not have sent are `InvalidParams`;
/// everything else, lifecycle violations included, is `InternalError`.
#[must_use]
pub fn to_jsonrpc(err: &keel::Error) -> jsonrpc::Error {
    let code = if err.is_invalid_params() {
        jsonrpc::ErrorCode::InvalidParams
    } else {
        jsonrpc::ErrorCode::InternalError
    };
    jsonrpc::Error {
        code,
        message: err.to_string().into(),
        data: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(keel::Error::InvalidRange("9:0".into()), jsonrpc::ErrorCode::InvalidParams)]
    #[case(keel::Error::MalformedPayload("x".into()), jsonrpc::ErrorCode::InvalidParams)]
    #[case(keel::Error::InvalidUri("x".into()), jsonrpc::ErrorCode::InvalidParams)]
    #[case(keel::Error::ShutDown, jsonrpc::ErrorCode::InternalError)]
    #[case(keel::Error::Internal("x".into()), jsonrpc::ErrorCode::InternalError)]
    fn core_errors_map_to_rpc_codes(#[case] err: keel::Error, #[case] code: jsonrpc::ErrorCode) {
        let rpc = to_jsonrpc(&err);
        assert_eq!(rpc.code, code);
        assert_eq!(rpc.message, err.to_string());
    }
}
