//! # Error Taxonomy
//!
//! A closed set of sentinel error kinds shared by both transports. Call
//! sites attach human-readable context with [`wrap`] while keeping the
//! sentinel recoverable by identity through `anyhow`'s `downcast_ref` chain
//! walk, so `is_not_found(&err)` works regardless of how many layers of
//! context were stacked on top.

use std::fmt;

/// Sentinel identity for every failure this crate can produce.
///
/// `NoData` is not really a *failure*. It is the success-with-empty-payload
/// signal threaded through [`crate::result::UbusResult::unmarshal`], but it
/// lives in the same closed enum so callers can match on it uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid command")]
    InvalidCommand,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("method not found")]
    MethodNotFound,
    #[error("not found")]
    NotFound,
    #[error("no data")]
    NoData,
    #[error("permission denied")]
    PermissionDenied,
    #[error("timeout")]
    Timeout,
    #[error("not supported")]
    NotSupported,
    #[error("unknown ubus error")]
    Unknown,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("transport closed")]
    Closed,
    #[error("invalid response")]
    InvalidResponse,
    #[error("not a unix socket")]
    NotUnixSocket,
    #[error("unsupported attribute type")]
    UnsupportedAttributeType,
    #[error("invalid blob length")]
    InvalidBlobLength,
    #[error("blobmsg payload too short")]
    BlobmsgPayloadTooShort,
    #[error("invalid blobmsg header length")]
    InvalidBlobmsgHeaderLength,
    #[error("array entry not extended")]
    ArrayEntryNotExtended,
    #[error("table entry not extended")]
    TableEntryNotExtended,
}

impl ErrorKind {
    /// Attach formatted context to this sentinel, producing an
    /// [`anyhow::Error`] whose source chain still contains the sentinel.
    pub fn wrap(self, context: impl fmt::Display) -> anyhow::Error {
        anyhow::Error::new(self).context(context.to_string())
    }

    /// Promote this sentinel into an `anyhow::Error` with no extra context.
    pub fn into_error(self) -> anyhow::Error {
        anyhow::Error::new(self)
    }
}

/// Same as [`ErrorKind::wrap`], written as a free function for call sites
/// that already hold an `anyhow::Error` and want to re-tag it.
pub fn wrap(kind: ErrorKind, context: impl fmt::Display) -> anyhow::Error {
    kind.wrap(context)
}

/// Map a ubus status code to its taxonomy sentinel, per the table shared by
/// both transports. `None` means success (status 0); `Some(NoData)`
/// for status 5 is also a transport-level success; [`crate::result`] is
/// what turns it into an empty-payload signal for `unmarshal`.
pub fn status_to_kind(status: u32) -> Option<ErrorKind> {
    match status {
        0 => None,
        1 => Some(ErrorKind::InvalidCommand),
        2 => Some(ErrorKind::InvalidParameter),
        3 => Some(ErrorKind::MethodNotFound),
        4 => Some(ErrorKind::NotFound),
        5 => Some(ErrorKind::NoData),
        6 => Some(ErrorKind::PermissionDenied),
        7 => Some(ErrorKind::Timeout),
        8 => Some(ErrorKind::NotSupported),
        9 => Some(ErrorKind::Unknown),
        10 => Some(ErrorKind::ConnectionFailed),
        _ => Some(ErrorKind::Unknown),
    }
}

/// Render the "unknown ubus error code: N" context message for a status
/// that isn't in the table at all (i.e. not 0..=10).
pub fn unknown_status_context(status: u32) -> String {
    format!("unknown ubus error code: {status}")
}

/// Walk `err`'s source chain looking for `kind` by identity.
pub fn is_kind(err: &anyhow::Error, kind: ErrorKind) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ErrorKind>() == Some(&kind))
}

macro_rules! is_kind_predicate {
    ($name:ident, $kind:ident) => {
        #[doc = concat!("True if `err`'s source chain contains [`ErrorKind::", stringify!($kind), "`].")]
        pub fn $name(err: &anyhow::Error) -> bool {
            is_kind(err, ErrorKind::$kind)
        }
    };
}

is_kind_predicate!(is_invalid_command, InvalidCommand);
is_kind_predicate!(is_invalid_parameter, InvalidParameter);
is_kind_predicate!(is_method_not_found, MethodNotFound);
is_kind_predicate!(is_not_found, NotFound);
is_kind_predicate!(is_no_data, NoData);
is_kind_predicate!(is_permission_denied, PermissionDenied);
is_kind_predicate!(is_timeout, Timeout);
is_kind_predicate!(is_not_supported, NotSupported);
is_kind_predicate!(is_unknown, Unknown);
is_kind_predicate!(is_connection_failed, ConnectionFailed);
is_kind_predicate!(is_closed, Closed);
is_kind_predicate!(is_invalid_response, InvalidResponse);
is_kind_predicate!(is_not_unix_socket, NotUnixSocket);
is_kind_predicate!(is_unsupported_attribute_type, UnsupportedAttributeType);
is_kind_predicate!(is_invalid_blob_length, InvalidBlobLength);
is_kind_predicate!(is_blobmsg_payload_too_short, BlobmsgPayloadTooShort);
is_kind_predicate!(is_invalid_blobmsg_header_length, InvalidBlobmsgHeaderLength);
is_kind_predicate!(is_array_entry_not_extended, ArrayEntryNotExtended);
is_kind_predicate!(is_table_entry_not_extended, TableEntryNotExtended);
