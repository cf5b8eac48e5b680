//! # Result Abstraction
//!
//! [`UbusResult`] is the single value both transports produce from a call.
//! It hides socket-vs-HTTP framing differences behind one operation:
//! decode the payload into a caller-supplied shape, or hand back the typed
//! error the status code maps to.

use serde::de::DeserializeOwned;

use crate::error::{self, status_to_kind, unknown_status_context, ErrorKind};
use crate::value::Value;

/// A `(status, payload)` pair, transport-agnostic.
#[derive(Debug, Clone)]
pub struct UbusResult {
    status: u32,
    payload: Value,
}

impl UbusResult {
    pub fn new(status: u32, payload: Value) -> Self {
        Self { status, payload }
    }

    /// The raw numeric status code, for callers that want it directly
    /// (e.g. to log it) without going through `unmarshal`.
    pub fn status(&self) -> u32 {
        self.status
    }

    /// Decode the payload into `T`, or return the mapped error.
    ///
    /// - status 0 with a non-empty payload: decodes into `T`; a structural
    ///   mismatch is reported as [`ErrorKind::InvalidResponse`].
    /// - status 0 with an empty payload: [`ErrorKind::NoData`], a success
    ///   from the transport's point of view, but nothing to decode.
    /// - any other status: the mapped error from the status table.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        if let Some(kind) = status_to_kind(self.status) {
            let err = if kind == ErrorKind::Unknown && !(0..=10).contains(&self.status) {
                kind.wrap(unknown_status_context(self.status))
            } else {
                kind.wrap(format!("ubus call returned status {}", self.status))
            };
            return Err(err);
        }

        if self.payload.is_empty_container() {
            return Err(ErrorKind::NoData.wrap("ubus call succeeded with an empty payload"));
        }

        let json = self.payload.to_json();
        serde_json::from_value(json)
            .map_err(|e| ErrorKind::InvalidResponse.wrap(format!("unmarshal payload: {e}")))
    }
}

/// Convenience for call sites that only care whether the call is an
/// is-kind match without decoding a payload (e.g. `unmarshal::<()>`-style
/// bodiless calls where [`ErrorKind::NoData`] should read as success).
pub fn is_success_or_no_data(err: &anyhow::Error) -> bool {
    error::is_no_data(err)
}
