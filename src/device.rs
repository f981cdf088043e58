//! Boundary to the physical bus access device.
//!
//! The daemon talks to a TCP tunnel (e.g. an Ethernet adapter in front
//! of the bus coupler); the raw serial driver stays outside this crate.

use crate::Result;
use ebus::{Error, SYN};
use std::{
    collections::VecDeque,
    io::{Read, Write},
    net::TcpStream,
    time::Duration,
};

/// Byte level access to the bus.
pub trait Device: Send {
    fn open(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Receive a single symbol, or `None` when nothing arrived within
    /// the timeout.
    fn recv(&mut self, timeout: Duration) -> Result<Option<u8>>;

    /// Send raw symbols to the bus.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    fn close(&mut self);
}

/// TCP tunneled device.
#[derive(Debug)]
pub struct TcpDevice {
    address: String,
    stream: Option<TcpStream>,
}

impl TcpDevice {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.into(),
            stream: None,
        }
    }
}

impl Device for TcpDevice {
    fn open(&mut self) -> Result<()> {
        self.close();
        log::debug!("connecting device {}", self.address);
        let stream = TcpStream::connect(&self.address)?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<u8>> {
        let stream = self.stream.as_mut().ok_or(Error::Io)?;
        stream.set_read_timeout(Some(timeout)).map_err(|_| Error::Io)?;
        let mut buf = [0u8; 1];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.close();
                Err(Error::Io)
            }
            Ok(_) => Ok(Some(buf[0])),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(_) => {
                self.close();
                Err(Error::Io)
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::Send)?;
        stream.write_all(data).map_err(|_| Error::Send)?;
        stream.flush().map_err(|_| Error::Send)?;
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

#[derive(Debug)]
struct MockInner {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    replies: VecDeque<Vec<u8>>,
    arbitration_losses: VecDeque<u8>,
    syn_on_idle: bool,
    open: bool,
}

/// Scripted in-memory device used by the test suites.
///
/// Sent symbols are echoed back like on the real two-wire bus. Replies
/// queued with [`MockDevice::push_reply`] are delivered after the next
/// multi-symbol send (a frame transmission); single-symbol sends model
/// arbitration or acknowledge bytes. Clones share the same state, so a
/// test can keep a handle while the protocol task owns the device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    inner: std::sync::Arc<std::sync::Mutex<MockInner>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(MockInner {
                incoming: VecDeque::new(),
                written: Vec::new(),
                replies: VecDeque::new(),
                arbitration_losses: VecDeque::new(),
                syn_on_idle: true,
                open: false,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stop delivering SYN on an empty buffer (models a dead bus).
    pub fn set_syn_on_idle(&self, enable: bool) {
        self.lock().syn_on_idle = enable;
    }

    /// Queue raw symbols as arriving from the bus.
    pub fn push_incoming(&self, data: &[u8]) {
        self.lock().incoming.extend(data);
    }

    /// Queue the wire bytes to deliver after the next frame send.
    pub fn push_reply(&self, data: &[u8]) {
        self.lock().replies.push_back(data.to_vec());
    }

    /// Let the next arbitration attempt lose against the given address.
    pub fn push_arbitration_loss(&self, winner: u8) {
        self.lock().arbitration_losses.push_back(winner);
    }

    /// All symbols sent so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn pending_incoming(&self) -> usize {
        self.lock().incoming.len()
    }
}

impl Device for MockDevice {
    fn open(&mut self) -> Result<()> {
        self.lock().open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn recv(&mut self, _timeout: Duration) -> Result<Option<u8>> {
        let mut inner = self.lock();
        if let Some(symbol) = inner.incoming.pop_front() {
            return Ok(Some(symbol));
        }
        if inner.syn_on_idle {
            Ok(Some(SYN))
        } else {
            Ok(None)
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.written.extend_from_slice(data);
        if data.len() == 1 {
            if let Some(winner) = inner.arbitration_losses.pop_front() {
                inner.incoming.push_back(winner);
                return Ok(());
            }
        }
        // bus echo
        inner.incoming.extend(data);
        if data.len() > 1 {
            if let Some(reply) = inner.replies.pop_front() {
                inner.incoming.extend(reply);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.lock().open = false;
    }
}
