pub mod cancel;
pub mod client;
pub mod config;
pub mod confirmation;
pub mod decoder;
pub mod dedup;
pub mod error;
pub mod protocol;
pub mod reducer;
pub mod session;
pub mod stream;
pub mod transcript;

pub use cancel::CancellationGovernor;
pub use client::{HttpTransport, Transport};
pub use error::{ProtocolError, SessionError, SessionResult, StopError};
pub use session::{ChatSession, RoundOutcome, SessionConfig, SessionSnapshot};
pub use transcript::{Mode, Query};
