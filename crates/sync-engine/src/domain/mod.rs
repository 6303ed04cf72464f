//! Domain layer: value objects and pure policies, no I/O.

pub mod errors;
pub mod events;
pub mod mutation;
pub mod records;
pub mod retry;
pub mod session;

pub use errors::{SyncError, SyncResult};
pub use events::{ChannelEvent, ChannelState, WILDCARD_EVENT};
pub use mutation::{MutationReceipt, MutationStatus, PendingMutation, TempId};
pub use records::{decode_records, Record, TEMP_ID_PREFIX};
pub use retry::{Backoff, RetryPolicy};
pub use session::{Credential, SessionEpoch, SessionStatus};
