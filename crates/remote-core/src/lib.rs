pub mod envelope;
pub mod identity;
pub mod pending;

pub use envelope::{
    decode, encode, Action, Command, Envelope, Failure, FailureCode, ProtocolError,
    CONTROL_TYPES, DEFAULT_MAX_FRAME_BYTES,
};
pub use identity::{CorrelationToken, Identity, BACKEND_IDENTITY};
pub use pending::{PendingError, PendingRequestTable};
