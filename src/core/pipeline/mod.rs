//! Transfer pipeline: sender send loop, receiver reassembly, rate tracking.

pub mod rate;
pub mod receiver;
pub mod sender;

pub use receiver::{ChunkOutcome, FileReceiver};
pub use sender::{SendContext, SendControl, SendJob, SendOutcome, run_send_loop};
