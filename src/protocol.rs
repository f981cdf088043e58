//! Low level eBUS protocol handling: SYN detection, bus arbitration,
//! master send, slave receive, CRC validation and own-address answering.
//!
//! The handler is driven by symbol arrivals from the device and owns the
//! single in-flight transaction. Observers are notified inline in a
//! fixed order: seen addresses first, then the message, then the
//! request completion.

use crate::{device::Device, queue::Queue, request::BusRequest, Result};
use ebus::{
    is_master, slave_address,
    symbol::{push_escaped, unescape},
    Error, MasterFrame, SlaveFrame, ACK, BROADCAST, ESC, MAX_DATA_LEN, NAK, SYN,
};
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::Write as _,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        mpsc::sync_channel,
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

/// Seconds without SYN after which the device is reconnected.
pub const RECONNECT_MISSING_SIGNAL: u64 = 60;

/// Seconds without SYN after which the signal is considered lost.
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Protocol status passed to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    /// Bus is idle with no pending work.
    Idle,
    SignalAcquired,
    SignalLost,
}

/// How an observed message passed the protocol handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Sent by us.
    Sent,
    /// Answered by us on behalf of an own address.
    Answered,
    /// Observed from foreign participants.
    Received,
}

impl MessageDirection {
    pub fn label(self) -> &'static str {
        match self {
            MessageDirection::Sent => "sent",
            MessageDirection::Answered => "answered",
            MessageDirection::Received => "received",
        }
    }
}

/// Observer interface of the bus handler, called inline from the
/// protocol task.
pub trait ProtocolListener: Send {
    fn on_status(&mut self, status: ProtocolStatus);

    fn on_seen_address(&mut self, address: u8);

    fn on_message(&mut self, direction: MessageDirection, master: &MasterFrame, slave: &SlaveFrame);

    /// Ask for an answer to a master frame addressed to an own address
    /// that has no registered answer.
    fn on_answer(&mut self, _master: &MasterFrame) -> Option<SlaveFrame> {
        None
    }

    /// A poll or scan request finished one transaction; an optionally
    /// returned request is executed next.
    fn notify_request(
        &mut self,
        request: BusRequest,
        result: Result<()>,
        slave: &SlaveFrame,
    ) -> Option<BusRequest>;
}

/// Timing and retry settings of the protocol handler.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub own_master: u8,
    /// Bounds the arbitration state.
    pub acquire_timeout: Duration,
    pub acquire_retries: usize,
    pub send_retries: usize,
    /// Bounds the wait for the slave part and inter-symbol gaps.
    pub recv_timeout: Duration,
    pub read_only: bool,
    /// Answer requests to the own addresses.
    pub answer: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            own_master: 0xff,
            acquire_timeout: Duration::from_millis(10),
            acquire_retries: 3,
            send_retries: 2,
            recv_timeout: Duration::from_millis(50),
            read_only: false,
            answer: false,
        }
    }
}

type AnswerKey = (u8, u8, u8, Vec<u8>);

#[derive(Debug)]
struct DumpWriter {
    file: File,
    path: PathBuf,
    max_size: u64,
    written: u64,
}

#[derive(Debug)]
pub struct ProtocolShared {
    own_master: u8,
    own_slave: u8,
    read_only: bool,
    signal: AtomicBool,
    shutdown: AtomicBool,
    reconnect_request: AtomicBool,
    reconnect_count: AtomicU32,
    conflict: AtomicBool,
    answering: AtomicBool,
    symbol_rate: AtomicU64,
    max_symbol_rate: AtomicU64,
    log_raw: AtomicBool,
    answers: Mutex<HashMap<AnswerKey, SlaveFrame>>,
    dump: Mutex<Option<DumpWriter>>,
}

/// Clonable access to the protocol task: request submission and state
/// snapshots.
#[derive(Debug, Clone)]
pub struct ProtocolHandle {
    requests: Arc<Queue<BusRequest>>,
    shared: Arc<ProtocolShared>,
}

impl ProtocolHandle {
    pub fn own_master(&self) -> u8 {
        self.shared.own_master
    }

    pub fn own_slave(&self) -> u8 {
        self.shared.own_slave
    }

    pub fn is_own_address(&self, address: u8) -> bool {
        address == self.shared.own_master || address == self.shared.own_slave
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    pub fn has_signal(&self) -> bool {
        self.shared.signal.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Relaxed)
    }

    pub fn is_answering(&self) -> bool {
        self.shared.answering.load(Ordering::Relaxed)
    }

    pub fn is_address_conflict(&self) -> bool {
        self.shared.conflict.load(Ordering::Relaxed)
    }

    pub fn symbol_rate(&self) -> u64 {
        self.shared.symbol_rate.load(Ordering::Relaxed)
    }

    pub fn max_symbol_rate(&self) -> u64 {
        self.shared.max_symbol_rate.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u32 {
        self.shared.reconnect_count.load(Ordering::Relaxed)
    }

    /// Tear down and reopen the device on the protocol task.
    pub fn reconnect(&self) {
        self.shared.reconnect_request.store(true, Ordering::Relaxed);
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.requests.notify();
    }

    pub fn set_log_raw(&self, enable: bool) -> bool {
        self.shared.log_raw.swap(enable, Ordering::Relaxed) != enable
    }

    pub fn is_log_raw(&self) -> bool {
        self.shared.log_raw.load(Ordering::Relaxed)
    }

    /// Number of requests waiting for dispatch.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Drop the registered answers and the address conflict flag.
    pub fn clear(&self) {
        self.shared.conflict.store(false, Ordering::Relaxed);
        if let Ok(mut answers) = self.shared.answers.lock() {
            answers.clear();
        }
    }

    /// Enqueue a request; the protocol picks it up on the next bus idle.
    pub fn add_request(&self, request: BusRequest) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        self.requests.push(request);
        Ok(())
    }

    /// Send the master frame and wait for the transaction to complete.
    ///
    /// The caller observes all observer-side state mutations of the
    /// transaction before this returns.
    pub fn send_and_wait(&self, master: MasterFrame) -> Result<SlaveFrame> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        if !self.has_signal() {
            return Err(Error::NoSignal);
        }
        let (waiter, done) = sync_channel(1);
        self.add_request(BusRequest::Active { master, waiter })?;
        match done.recv_timeout(Duration::from_secs(30)) {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Register an automatic answer for requests to an own address.
    pub fn set_answer(&self, dst: u8, id: &[u8], answer: SlaveFrame) -> Result<()> {
        if id.len() < 2 {
            return Err(Error::InvalidArgument);
        }
        self.shared.answering.store(true, Ordering::Relaxed);
        let key = (dst, id[0], id[1], id[2..].to_vec());
        if let Ok(mut answers) = self.shared.answers.lock() {
            answers.insert(key, answer);
        }
        Ok(())
    }

    pub fn has_answer(&self, address: u8) -> bool {
        self.shared
            .answers
            .lock()
            .map(|answers| answers.keys().any(|(dst, ..)| *dst == address))
            .unwrap_or(false)
    }

    fn find_answer(&self, master: &MasterFrame) -> Option<SlaveFrame> {
        let answers = self.shared.answers.lock().ok()?;
        let data = master.data();
        for ((dst, pb, sb, id), answer) in answers.iter() {
            if *dst == master.destination()
                && *pb == master.primary()
                && *sb == master.secondary()
                && data.starts_with(id)
            {
                return Some(answer.clone());
            }
        }
        None
    }

    /// Start or roll over the binary capture file; `None` disables it.
    pub fn set_dump(&self, path: Option<&str>, max_size: u64) -> Result<()> {
        let mut dump = self.shared.dump.lock().map_err(|_| Error::Io)?;
        match path {
            None => *dump = None,
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                *dump = Some(DumpWriter {
                    file,
                    path: PathBuf::from(path),
                    max_size,
                    written: 0,
                });
            }
        }
        Ok(())
    }
}

/// The protocol state machine, owned by the protocol task.
pub struct ProtocolHandler {
    device: Box<dyn Device>,
    listener: Box<dyn ProtocolListener>,
    config: ProtocolConfig,
    handle: ProtocolHandle,
    /// Chained follow-up of the last poll/scan transaction.
    pending: Option<BusRequest>,
    last_syn: Instant,
    rate_window: Instant,
    rate_count: u64,
}

/// Listener discarding all notifications, used until the bus handler is
/// attached.
struct NullListener;

impl ProtocolListener for NullListener {
    fn on_status(&mut self, _status: ProtocolStatus) {}

    fn on_seen_address(&mut self, _address: u8) {}

    fn on_message(
        &mut self,
        _direction: MessageDirection,
        _master: &MasterFrame,
        _slave: &SlaveFrame,
    ) {
    }

    fn notify_request(
        &mut self,
        _request: BusRequest,
        _result: Result<()>,
        _slave: &SlaveFrame,
    ) -> Option<BusRequest> {
        None
    }
}

impl ProtocolHandler {
    pub fn new(device: Box<dyn Device>, config: ProtocolConfig) -> Self {
        let shared = ProtocolShared {
            own_master: config.own_master,
            own_slave: slave_address(config.own_master),
            read_only: config.read_only,
            signal: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            reconnect_request: AtomicBool::new(false),
            reconnect_count: AtomicU32::new(0),
            conflict: AtomicBool::new(false),
            answering: AtomicBool::new(config.answer),
            symbol_rate: AtomicU64::new(0),
            max_symbol_rate: AtomicU64::new(0),
            log_raw: AtomicBool::new(false),
            answers: Mutex::new(HashMap::new()),
            dump: Mutex::new(None),
        };
        Self {
            device,
            listener: Box::new(NullListener),
            config,
            handle: ProtocolHandle {
                requests: Arc::new(Queue::new()),
                shared: Arc::new(shared),
            },
            pending: None,
            last_syn: Instant::now(),
            rate_window: Instant::now(),
            rate_count: 0,
        }
    }

    /// Attach the observer of bus traffic and request completions.
    pub fn set_listener(&mut self, listener: Box<dyn ProtocolListener>) {
        self.listener = listener;
    }

    pub fn handle(&self) -> ProtocolHandle {
        self.handle.clone()
    }

    /// Drive the state machine until shutdown.
    pub fn run(&mut self) {
        if let Err(e) = self.device.open() {
            log::error!("unable to open device: {}", e);
        }
        while !self.handle.is_shutdown() {
            if self.handle.shared.reconnect_request.swap(false, Ordering::Relaxed)
                || !self.device.is_open()
            {
                self.reconnect();
                continue;
            }
            if let Err(e) = self.run_once() {
                if e == Error::Io || e == Error::Send {
                    log::error!("device error: {}", e);
                    self.reconnect();
                }
            }
            if self.last_syn.elapsed() > SIGNAL_TIMEOUT {
                self.signal_lost();
            }
            if self.last_syn.elapsed() > Duration::from_secs(RECONNECT_MISSING_SIGNAL) {
                log::warn!("signal lost for {}s, reconnecting", RECONNECT_MISSING_SIGNAL);
                self.reconnect();
            }
        }
        self.shutdown_requests();
        self.device.close();
    }

    /// Handle one symbol arrival (or timeout). Public for the scripted
    /// test harness.
    pub fn run_once(&mut self) -> Result<()> {
        let symbol = match self.recv_symbol(self.config.recv_timeout)? {
            Some(symbol) => symbol,
            None => return Ok(()),
        };
        if symbol == SYN {
            self.mark_syn();
            let next = self
                .pending
                .take()
                .or_else(|| self.handle.requests.pop(Duration::ZERO));
            match next {
                Some(request) => self.execute(request),
                None => self.listener.on_status(ProtocolStatus::Idle),
            }
            return Ok(());
        }
        self.receive_foreign(symbol)
    }

    fn mark_syn(&mut self) {
        self.last_syn = Instant::now();
        if !self.handle.shared.signal.swap(true, Ordering::Relaxed) {
            log::info!("signal acquired");
            self.listener.on_status(ProtocolStatus::SignalAcquired);
        }
    }

    fn signal_lost(&mut self) -> bool {
        if self.handle.shared.signal.swap(false, Ordering::Relaxed) {
            log::warn!("signal lost");
            self.listener.on_status(ProtocolStatus::SignalLost);
            true
        } else {
            false
        }
    }

    fn reconnect(&mut self) {
        self.fail_in_flight(Error::NoSignal);
        self.signal_lost();
        self.device.close();
        match self.device.open() {
            Ok(()) => {
                self.handle
                    .shared
                    .reconnect_count
                    .fetch_add(1, Ordering::Relaxed);
                self.last_syn = Instant::now();
                log::info!("device reopened");
            }
            Err(e) => {
                log::error!("unable to reopen device: {}", e);
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    fn fail_in_flight(&mut self, error: Error) {
        if let Some(request) = self.pending.take() {
            self.complete(request, Err(error), &SlaveFrame::new());
        }
    }

    fn shutdown_requests(&mut self) {
        self.fail_in_flight(Error::Shutdown);
        while let Some(request) = self.handle.requests.pop(Duration::ZERO) {
            self.complete(request, Err(Error::Shutdown), &SlaveFrame::new());
        }
    }

    fn count_symbol(&mut self) {
        self.rate_count += 1;
        if self.rate_window.elapsed() >= Duration::from_secs(1) {
            let rate = self.rate_count;
            self.rate_count = 0;
            self.rate_window = Instant::now();
            self.handle.shared.symbol_rate.store(rate, Ordering::Relaxed);
            if rate > self.handle.shared.max_symbol_rate.load(Ordering::Relaxed) {
                self.handle.shared.max_symbol_rate.store(rate, Ordering::Relaxed);
            }
        }
    }

    fn dump_symbol(&mut self, symbol: u8) {
        let mut dump = match self.handle.shared.dump.lock() {
            Ok(dump) => dump,
            Err(_) => return,
        };
        if let Some(writer) = dump.as_mut() {
            if writer.file.write_all(&[symbol]).is_err() {
                log::error!("unable to write dump file");
                *dump = None;
                return;
            }
            writer.written += 1;
            if writer.max_size > 0 && writer.written >= writer.max_size {
                let old = writer.path.with_extension("old");
                let _ = std::fs::rename(&writer.path, &old);
                match OpenOptions::new().create(true).append(true).open(&writer.path) {
                    Ok(file) => {
                        writer.file = file;
                        writer.written = 0;
                    }
                    Err(_) => *dump = None,
                }
            }
        }
    }

    fn recv_symbol(&mut self, timeout: Duration) -> Result<Option<u8>> {
        match self.device.recv(timeout)? {
            Some(symbol) => {
                self.count_symbol();
                self.dump_symbol(symbol);
                Ok(Some(symbol))
            }
            None => Ok(None),
        }
    }

    /// Receive one unescaped symbol; SYN aborts the frame.
    fn recv_unescaped(&mut self) -> Result<u8> {
        match self.recv_symbol(self.config.recv_timeout)? {
            None => Err(Error::Timeout),
            Some(SYN) => Err(Error::Eof),
            Some(ESC) => match self.recv_symbol(self.config.recv_timeout)? {
                None => Err(Error::Timeout),
                Some(symbol) => unescape(symbol),
            },
            Some(symbol) => Ok(symbol),
        }
    }

    fn consume_echo(&mut self, sent: &[u8]) -> Result<bool> {
        for &expected in sent {
            match self.recv_symbol(self.config.recv_timeout)? {
                Some(symbol) if symbol == expected => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn wait_for_syn(&mut self) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match self.recv_symbol(self.config.recv_timeout)? {
                Some(SYN) => {
                    self.mark_syn();
                    return Ok(true);
                }
                Some(symbol) => {
                    self.receive_foreign(symbol)?;
                }
                None => {}
            }
        }
        Ok(false)
    }

    fn execute(&mut self, request: BusRequest) {
        if self.config.read_only {
            // success with no-op
            self.complete(request, Ok(()), &SlaveFrame::new());
            return;
        }
        let master = request.master().clone();
        let outcome = self.transaction(&master);
        if self.handle.is_log_raw() {
            match &outcome {
                Ok(slave) => log::info!("> {} / {}", master, slave),
                Err(e) => log::info!("> {} failed: {}", master, e),
            }
        }
        match &outcome {
            Ok(slave) => {
                self.listener.on_seen_address(master.source());
                let dst = master.destination();
                if dst != BROADCAST && !is_master(dst) {
                    self.listener.on_seen_address(dst);
                }
                let slave = slave.clone();
                self.listener
                    .on_message(MessageDirection::Sent, &master, &slave);
                self.complete(request, Ok(()), &slave);
            }
            Err(e) => {
                let error = *e;
                self.complete(request, Err(error), &SlaveFrame::new());
                if error == Error::Io || error == Error::Send {
                    self.handle.reconnect();
                }
            }
        }
    }

    /// Run one complete bus transaction for the master frame. Entered
    /// right after a SYN was observed.
    fn transaction(&mut self, master: &MasterFrame) -> Result<SlaveFrame> {
        if !master.is_complete() || master.data_size() > MAX_DATA_LEN {
            return Err(Error::InvalidArgument);
        }
        let source = master.source();
        // arbitration: send the own address after SYN and check the echo
        let mut attempts = 0;
        loop {
            self.device.send(&[source])?;
            let won = match self.recv_symbol(self.config.acquire_timeout)? {
                Some(symbol) if symbol == source => true,
                Some(SYN) => false,
                Some(other) => {
                    log::debug!("arbitration lost against {:02x}", other);
                    self.receive_foreign(other)?;
                    false
                }
                None => false,
            };
            if won {
                break;
            }
            attempts += 1;
            if attempts > self.config.acquire_retries {
                log::info!("bus acquisition failed after {} attempts", attempts);
                return Err(Error::Send);
            }
            if !self.wait_for_syn()? {
                return Err(Error::NoSignal);
            }
        }
        // arbitration won: send the remaining frame escaped, CRC last
        let mut wire = Vec::new();
        for &symbol in &master.bytes()[1..] {
            push_escaped(&mut wire, symbol);
        }
        push_escaped(&mut wire, master.crc());
        let mut tries = 0;
        loop {
            self.device.send(&wire)?;
            if !self.consume_echo(&wire)? {
                return Err(Error::Send);
            }
            if master.destination() == BROADCAST {
                return Ok(SlaveFrame::new());
            }
            match self.recv_symbol(self.config.recv_timeout)? {
                Some(ACK) => {
                    if is_master(master.destination()) {
                        return Ok(SlaveFrame::new());
                    }
                    return self.receive_slave_part();
                }
                Some(NAK) => {
                    tries += 1;
                    if tries > self.config.send_retries {
                        return Err(Error::Send);
                    }
                    log::debug!("NAK received, resending ({}/{})", tries, self.config.send_retries);
                }
                _ => return Err(Error::Timeout),
            }
        }
    }

    /// Receive the slave frame after our master part was acknowledged,
    /// acknowledging (or negative-acknowledging) it in turn.
    fn receive_slave_part(&mut self) -> Result<SlaveFrame> {
        let mut tries = 0;
        loop {
            match self.receive_slave_frame() {
                Ok(slave) => {
                    self.device.send(&[ACK])?;
                    self.consume_echo(&[ACK])?;
                    return Ok(slave);
                }
                Err(Error::InvalidArgument) => {
                    // CRC mismatch: ask the slave to repeat
                    tries += 1;
                    if tries > self.config.send_retries {
                        return Err(Error::InvalidArgument);
                    }
                    self.device.send(&[NAK])?;
                    self.consume_echo(&[NAK])?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn receive_slave_frame(&mut self) -> Result<SlaveFrame> {
        let mut slave = SlaveFrame::new();
        let length = self.recv_unescaped()?;
        if length as usize > MAX_DATA_LEN {
            return Err(Error::OutOfRange);
        }
        slave.push(length);
        for _ in 0..length {
            let symbol = self.recv_unescaped()?;
            slave.push(symbol);
        }
        let crc = self.recv_unescaped()?;
        if crc != slave.crc() {
            log::debug!("slave CRC mismatch");
            return Err(Error::InvalidArgument);
        }
        Ok(slave)
    }

    /// Receive a foreign master frame starting with the given symbol and
    /// dispatch it to the observers.
    fn receive_foreign(&mut self, first: u8) -> Result<()> {
        let mut master = MasterFrame::new();
        let mut symbol = if first == ESC {
            match self.recv_symbol(self.config.recv_timeout)? {
                Some(s) => unescape(s)?,
                None => return Ok(()),
            }
        } else {
            first
        };
        loop {
            master.push(symbol);
            if master.is_complete() {
                break;
            }
            if master.len() >= 5 && master.declared_size() > MAX_DATA_LEN {
                log::debug!("oversized frame from {:02x}", master.source());
                return Ok(());
            }
            symbol = match self.recv_unescaped() {
                Ok(symbol) => symbol,
                Err(_) => {
                    log::debug!("incomplete frame dropped: {}", master);
                    return Ok(());
                }
            };
        }
        let crc = match self.recv_unescaped() {
            Ok(crc) => crc,
            Err(_) => {
                log::debug!("frame without CRC dropped: {}", master);
                return Ok(());
            }
        };
        let own = self.handle.is_own_address(master.destination());
        if crc != master.crc() {
            log::debug!("master CRC mismatch: {}", master);
            if own && !self.config.read_only {
                self.device.send(&[NAK])?;
                self.consume_echo(&[NAK])?;
            }
            return Ok(());
        }
        if master.source() == self.handle.own_master() {
            if !self.handle.shared.conflict.swap(true, Ordering::Relaxed) {
                log::warn!("own master address {:02x} in use by another participant", master.source());
            }
        }
        self.listener.on_seen_address(master.source());
        let dst = master.destination();
        if dst == BROADCAST {
            self.raw_log_received(&master, &SlaveFrame::new());
            self.listener
                .on_message(MessageDirection::Received, &master, &SlaveFrame::new());
            return Ok(());
        }
        if own && self.handle.is_answering() && !self.config.read_only {
            return self.answer(&master);
        }
        if is_master(dst) {
            // master-master: consume the ACK of the destination
            let _ = self.recv_symbol(self.config.recv_timeout)?;
            self.raw_log_received(&master, &SlaveFrame::new());
            self.listener
                .on_message(MessageDirection::Received, &master, &SlaveFrame::new());
            return Ok(());
        }
        // master-slave of foreign participants: eavesdrop the answer
        match self.recv_symbol(self.config.recv_timeout)? {
            Some(ACK) => match self.receive_slave_frame() {
                Ok(slave) => {
                    // the master's final ACK
                    let _ = self.recv_symbol(self.config.recv_timeout)?;
                    self.listener.on_seen_address(dst);
                    self.raw_log_received(&master, &slave);
                    self.listener
                        .on_message(MessageDirection::Received, &master, &slave);
                }
                Err(e) => log::debug!("slave part of {} dropped: {}", master, e),
            },
            _ => log::debug!("missing ACK for {}", master),
        }
        Ok(())
    }

    /// Acknowledge and answer a request addressed to an own address.
    fn answer(&mut self, master: &MasterFrame) -> Result<()> {
        self.device.send(&[ACK])?;
        self.consume_echo(&[ACK])?;
        if is_master(master.destination()) {
            self.raw_log_received(master, &SlaveFrame::new());
            self.listener
                .on_message(MessageDirection::Answered, master, &SlaveFrame::new());
            return Ok(());
        }
        let answer = self
            .handle
            .find_answer(master)
            .or_else(|| self.listener.on_answer(master))
            .unwrap_or_else(|| {
                let mut empty = SlaveFrame::new();
                empty.push(0);
                empty
            });
        let mut wire = Vec::new();
        for &symbol in answer.bytes() {
            push_escaped(&mut wire, symbol);
        }
        push_escaped(&mut wire, answer.crc());
        self.device.send(&wire)?;
        self.consume_echo(&wire)?;
        // the master's ACK of our answer
        let _ = self.recv_symbol(self.config.recv_timeout)?;
        self.raw_log_received(master, &answer);
        self.listener
            .on_message(MessageDirection::Answered, master, &answer);
        Ok(())
    }

    fn raw_log_received(&self, master: &MasterFrame, slave: &SlaveFrame) {
        if self.handle.is_log_raw() {
            if slave.is_empty() {
                log::info!("< {}", master);
            } else {
                log::info!("< {} / {}", master, slave);
            }
        }
    }

    fn complete(&mut self, request: BusRequest, result: Result<()>, slave: &SlaveFrame) {
        match request {
            BusRequest::Active { waiter, .. } => {
                let _ = waiter.send(result.map(|_| slave.clone()));
            }
            other => {
                if let Some(next) = self.listener.notify_request(other, result, slave) {
                    self.pending = Some(next);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;
    use ebus::crc8;
    use std::sync::mpsc::sync_channel;

    #[derive(Default)]
    struct RecordingListener {
        seen: Vec<u8>,
        messages: Vec<(MessageDirection, String, String)>,
        idle: usize,
    }

    #[derive(Clone, Default)]
    struct SharedListener(Arc<Mutex<RecordingListener>>);

    impl ProtocolListener for SharedListener {
        fn on_status(&mut self, status: ProtocolStatus) {
            if status == ProtocolStatus::Idle {
                if let Ok(mut inner) = self.0.lock() {
                    inner.idle += 1;
                }
            }
        }

        fn on_seen_address(&mut self, address: u8) {
            if let Ok(mut inner) = self.0.lock() {
                inner.seen.push(address);
            }
        }

        fn on_message(
            &mut self,
            direction: MessageDirection,
            master: &MasterFrame,
            slave: &SlaveFrame,
        ) {
            if let Ok(mut inner) = self.0.lock() {
                inner
                    .messages
                    .push((direction, master.format_hex(), slave.format_hex()));
            }
        }

        fn notify_request(
            &mut self,
            _request: BusRequest,
            _result: Result<()>,
            _slave: &SlaveFrame,
        ) -> Option<BusRequest> {
            None
        }
    }

    fn wire_bytes(unescaped: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        for &symbol in unescaped {
            push_escaped(&mut wire, symbol);
        }
        push_escaped(&mut wire, crc8(unescaped));
        wire
    }

    fn handler(device: MockDevice, config: ProtocolConfig) -> (ProtocolHandler, SharedListener) {
        let listener = SharedListener::default();
        let mut protocol = ProtocolHandler::new(Box::new(device), config);
        protocol.set_listener(Box::new(listener.clone()));
        (protocol, listener)
    }

    #[test]
    fn send_and_receive_slave_answer() {
        let device = MockDevice::new();
        // ACK plus slave frame 03 41 42 43 with CRC
        let mut reply = vec![ACK];
        reply.extend(wire_bytes(&[0x03, 0x41, 0x42, 0x43]));
        device.push_reply(&reply);

        let (mut protocol, listener) = handler(device, ProtocolConfig::default());
        let handle = protocol.handle();
        let master = MasterFrame::parse_hex("ff08070400").unwrap();
        let (waiter, done) = sync_channel(1);
        handle
            .add_request(BusRequest::Active { master, waiter })
            .unwrap();
        // SYN arrives, transaction executes inline
        protocol.run_once().unwrap();
        let slave = done.try_recv().unwrap().unwrap();
        assert_eq!(slave.format_hex(), "03414243");
        let inner = listener.0.lock().unwrap();
        assert_eq!(inner.messages.len(), 1);
        assert_eq!(inner.messages[0].0, MessageDirection::Sent);
        assert!(inner.seen.contains(&0xff));
        assert!(inner.seen.contains(&0x08));
    }

    #[test]
    fn arbitration_retry_until_won() {
        let device = MockDevice::new();
        device.push_arbitration_loss(0x10);
        device.push_arbitration_loss(0x10);
        let mut reply = vec![ACK];
        reply.extend(wire_bytes(&[0x00]));
        device.push_reply(&reply);

        let config = ProtocolConfig {
            acquire_retries: 2,
            ..ProtocolConfig::default()
        };
        let (mut protocol, _listener) = handler(device, config);
        let handle = protocol.handle();
        let master = MasterFrame::parse_hex("ff08070400").unwrap();
        let (waiter, done) = sync_channel(1);
        handle
            .add_request(BusRequest::Active { master, waiter })
            .unwrap();
        protocol.run_once().unwrap();
        assert!(done.try_recv().unwrap().is_ok());
    }

    #[test]
    fn arbitration_gives_up_after_retries() {
        let device = MockDevice::new();
        for _ in 0..4 {
            device.push_arbitration_loss(0x10);
        }
        let config = ProtocolConfig {
            acquire_retries: 1,
            ..ProtocolConfig::default()
        };
        let (mut protocol, _listener) = handler(device, config);
        let handle = protocol.handle();
        let master = MasterFrame::parse_hex("ff08070400").unwrap();
        let (waiter, done) = sync_channel(1);
        handle
            .add_request(BusRequest::Active { master, waiter })
            .unwrap();
        protocol.run_once().unwrap();
        assert_eq!(done.try_recv().unwrap(), Err(Error::Send));
    }

    #[test]
    fn broadcast_has_no_slave_frame() {
        let device = MockDevice::new();
        let (mut protocol, listener) = handler(device, ProtocolConfig::default());
        let handle = protocol.handle();
        let master = MasterFrame::parse_hex("31fe07040ab5544950303030010064").unwrap();
        let (waiter, done) = sync_channel(1);
        handle
            .add_request(BusRequest::Active { master, waiter })
            .unwrap();
        protocol.run_once().unwrap();
        let slave = done.try_recv().unwrap().unwrap();
        assert!(slave.is_empty());
        let inner = listener.0.lock().unwrap();
        assert_eq!(inner.messages.len(), 1);
    }

    #[test]
    fn observes_foreign_broadcast() {
        let device = MockDevice::new();
        let frame = wire_bytes(&[0x31, 0xfe, 0x07, 0x04, 0x0a, 0xb5, 0x54, 0x49, 0x50, 0x30, 0x30, 0x30, 0x01, 0x00, 0x64]);
        device.push_incoming(&frame);
        let (mut protocol, listener) = handler(device.clone(), ProtocolConfig::default());
        protocol.run_once().unwrap();
        let inner = listener.0.lock().unwrap();
        assert_eq!(inner.messages.len(), 1);
        assert_eq!(inner.messages[0].0, MessageDirection::Received);
        assert_eq!(inner.messages[0].1, "31fe07040ab5544950303030010064");
        assert_eq!(inner.seen, vec![0x31]);
        // nothing was emitted on the bus
        assert!(device.written().is_empty());
    }

    #[test]
    fn observes_foreign_master_slave_exchange() {
        let device = MockDevice::new();
        let mut bytes = wire_bytes(&[0x31, 0x08, 0x07, 0x04, 0x00]);
        bytes.push(ACK);
        bytes.extend(wire_bytes(&[0x0a, 0xb5, 0x54, 0x49, 0x50, 0x30, 0x30, 0x30, 0x01, 0x00, 0x64]));
        bytes.push(ACK);
        device.push_incoming(&bytes);
        let (mut protocol, listener) = handler(device, ProtocolConfig::default());
        protocol.run_once().unwrap();
        let inner = listener.0.lock().unwrap();
        assert_eq!(inner.messages.len(), 1);
        assert_eq!(inner.messages[0].1, "3108070400");
        assert_eq!(inner.messages[0].2, "0ab5544950303030010064");
        assert!(inner.seen.contains(&0x31));
        assert!(inner.seen.contains(&0x08));
    }

    #[test]
    fn read_only_short_circuits() {
        let device = MockDevice::new();
        let config = ProtocolConfig {
            read_only: true,
            ..ProtocolConfig::default()
        };
        let (mut protocol, _listener) = handler(device.clone(), config);
        let handle = protocol.handle();
        let master = MasterFrame::parse_hex("ff08070400").unwrap();
        let (waiter, done) = sync_channel(1);
        handle
            .add_request(BusRequest::Active { master, waiter })
            .unwrap();
        protocol.run_once().unwrap();
        let slave = done.try_recv().unwrap().unwrap();
        assert!(slave.is_empty());
        assert!(device.written().is_empty());
    }

    #[test]
    fn answers_own_slave_address() {
        let device = MockDevice::new();
        // query to our own slave address 0x04 (master 0xff)
        let frame = wire_bytes(&[0x31, 0x04, 0x07, 0x04, 0x00]);
        device.push_incoming(&frame);
        let config = ProtocolConfig {
            answer: true,
            ..ProtocolConfig::default()
        };
        let (mut protocol, listener) = handler(device, config);
        let handle = protocol.handle();
        let mut answer = SlaveFrame::new();
        answer.push(0x01);
        answer.push(0x42);
        handle.set_answer(0x04, &[0x07, 0x04], answer).unwrap();
        protocol.run_once().unwrap();
        let inner = listener.0.lock().unwrap();
        assert_eq!(inner.messages.len(), 1);
        assert_eq!(inner.messages[0].0, MessageDirection::Answered);
        assert_eq!(inner.messages[0].2, "0142");
        assert!(handle.has_answer(0x04));
    }

    #[test]
    fn crc_error_drops_frame() {
        let device = MockDevice::new();
        let mut frame = wire_bytes(&[0x31, 0x15, 0x07, 0x04, 0x00]);
        let last = frame.len() - 1;
        frame[last] ^= 0xff; // corrupt the CRC
        device.push_incoming(&frame);
        let (mut protocol, listener) = handler(device, ProtocolConfig::default());
        protocol.run_once().unwrap();
        let inner = listener.0.lock().unwrap();
        assert!(inner.messages.is_empty());
    }
}
