//! The staged pipeline of one run.
//!
//! Records enter through the [`ApiWorkManager`], pass the handler, the
//! writer (transaction log) and the sender (network), and every answer is
//! routed back to its caller by the [`Dispatcher`]. [`Stream`] wires the
//! stages together and sequences shutdown.

pub mod dispatcher;
pub mod handler;
pub mod mailbox;
pub mod monitor;
pub mod reader;
pub mod sender;
pub mod stats;
pub mod stream;
pub mod work;
pub mod writer;

pub use dispatcher::{
    ChannelResponder, Dispatcher, MissingResponderPolicy, Responder, ResponderEntry,
};
pub use handler::HandlerStage;
pub use mailbox::{Mailbox, MailboxError, MailboxHandle, ResultSink};
pub use monitor::{EventSource, HeartbeatMonitor};
pub use reader::ReplayReader;
pub use sender::{SenderStage, SenderStageParams};
pub use stats::StreamStats;
pub use stream::{PipelineMode, Stream, StreamConfig, StreamError, StreamState};
pub use work::ApiWorkManager;
pub use writer::WriterStage;
