//! Bus requests and client requests.

use crate::Result;
use ebus::{MasterFrame, OutputFormat, SlaveFrame};
use std::{collections::VecDeque, sync::mpsc::SyncSender};

/// A poll of one message, injected on bus idle.
#[derive(Debug)]
pub struct PollRequest {
    /// Catalog index of the polled message.
    pub message: usize,
    pub master: MasterFrame,
}

/// A walk over (slave x message) pairs issuing scan queries.
#[derive(Debug)]
pub struct ScanRequest {
    /// All secondary message indexes, replayed per slave.
    pub all_messages: Vec<usize>,
    /// Remaining secondary messages for the current slave.
    pub messages: VecDeque<usize>,
    /// The currently queried message index.
    pub current: usize,
    /// Remaining slave addresses, front is in progress.
    pub slaves: VecDeque<u8>,
    pub master: MasterFrame,
    /// Offset for storing results in the scan result table.
    pub notify_index: usize,
    /// Position of the current message within the walk of one slave.
    pub result_index: usize,
    /// Whether this request was started by a full walk (no waiter).
    pub delete_on_finish: bool,
    /// The overall result of the walk.
    pub result: Result<()>,
    /// Completion signal for synchronous scans.
    pub waiter: Option<SyncSender<Result<()>>>,
}

/// A request owned by the queue until dispatch, then by the protocol
/// until completion.
#[derive(Debug)]
pub enum BusRequest {
    /// Externally prepared master bytes with a completion waiter.
    Active {
        master: MasterFrame,
        waiter: SyncSender<Result<SlaveFrame>>,
    },
    Poll(PollRequest),
    Scan(ScanRequest),
}

impl BusRequest {
    pub fn master(&self) -> &MasterFrame {
        match self {
            BusRequest::Active { master, .. } => master,
            BusRequest::Poll(poll) => &poll.master,
            BusRequest::Scan(scan) => &scan.master,
        }
    }
}

/// The request listen mode of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    None,
    Listen,
    Direct,
}

impl Default for ListenMode {
    fn default() -> Self {
        ListenMode::None
    }
}

/// Mode info carried per client connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMode {
    pub listen: ListenMode,
    pub format: OutputFormat,
    pub with_unknown: bool,
    pub only_unknown: bool,
}

/// A command line from a client, waiting for its response.
#[derive(Debug)]
pub struct NetRequest {
    pub line: String,
    pub user: String,
    pub mode: RequestMode,
    /// Start of the listen window (seconds).
    pub since: u64,
    pub response: SyncSender<NetResponse>,
}

/// The dispatcher's answer to a [`NetRequest`].
#[derive(Debug, Clone)]
pub struct NetResponse {
    pub text: String,
    pub mode: RequestMode,
    pub user: String,
    pub disconnect: bool,
    /// End of the listen window covered by this response.
    pub until: u64,
}
