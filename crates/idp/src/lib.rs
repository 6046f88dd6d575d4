#![doc = include_str!("../README.md")]

use mutex::{raw_impls::cs::CriticalSectionRawMutex, BlockingMutex};

pub mod adaptor;
pub mod config;
pub mod dispatcher;
pub mod master;
pub mod node;
pub mod router;
pub mod session;
pub mod transaction;
pub mod well_known;

pub use adaptor::{Adaptor, AdaptorFlags, AdaptorId, AdaptorPort};
pub use config::{ConfigError, IdpConfig};
pub use dispatcher::{Dispatcher, PendingResponse, ResponseStream};
pub use idp_frame::{self as frame, Address, Packet, PacketFlags};
pub use master::{EnumerationState, Master, NodeInfo};
pub use node::{LocalNode, Node, NodeCore, NodeState, PacketTransmit, Processed};
pub use router::{Router, RouterState, RouterWorker};
pub use session::{Client, ServerSession};
pub use transaction::{IncomingTransaction, OutgoingTransaction, Response};
pub use well_known::{Capabilities, Command, CommandFlags, Identity, ResponseCode};

/// The lock guarding all shared state in this crate
///
/// Locks are short: never held across an await, or across a call that could
/// come back into the same lock.
pub(crate) type Lock<T> = BlockingMutex<CriticalSectionRawMutex, T>;
