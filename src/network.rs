//! Text line TCP server feeding the dispatcher's request queue.
//!
//! One thread per client connection; each line becomes a request, the
//! response is terminated by a blank line. Listening clients poll the
//! dispatcher for updates with empty requests.

use crate::{
    queue::Queue,
    request::{ListenMode, NetRequest, RequestMode},
};
use std::{
    io::{BufRead, BufReader, ErrorKind, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::sync_channel,
        Arc,
    },
    thread,
    time::Duration,
};

/// Accepts client connections and hands their lines to the dispatcher.
pub struct TextServer {
    queue: Arc<Queue<NetRequest>>,
    shutdown: Arc<AtomicBool>,
}

impl TextServer {
    pub fn new(queue: Arc<Queue<NetRequest>>, shutdown: Arc<AtomicBool>) -> Self {
        Self { queue, shutdown }
    }

    /// Bind the listen address and run the accept loop in a new thread.
    pub fn listen(self, address: &str) -> std::io::Result<thread::JoinHandle<()>> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        log::info!("listening on {}", address);
        Ok(thread::spawn(move || self.accept_loop(listener)))
    }

    fn accept_loop(self, listener: TcpListener) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("client connected from {}", peer);
                    let queue = self.queue.clone();
                    let shutdown = self.shutdown.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_client(stream, queue, shutdown) {
                            log::debug!("client {} closed: {}", peer, e);
                        }
                        log::info!("client {} disconnected", peer);
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
}

fn handle_client(
    stream: TcpStream,
    queue: Arc<Queue<NetRequest>>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut mode = RequestMode::default();
    let mut user = String::new();
    let mut since = 0u64;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut line = String::new();
        let request_line = match reader.read_line(&mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                let line = line.trim_end_matches(|c| c == '\r' || c == '\n').to_string();
                if line.is_empty() && mode.listen == ListenMode::None {
                    continue;
                }
                Some(line)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                // poll the dispatcher for streaming updates
                if mode.listen == ListenMode::None {
                    continue;
                }
                None
            }
            Err(e) => return Err(e),
        };
        let (response_tx, response_rx) = sync_channel(1);
        queue.push(NetRequest {
            line: request_line.clone().unwrap_or_default(),
            user: user.clone(),
            mode,
            since,
            response: response_tx,
        });
        let response = match response_rx.recv_timeout(Duration::from_secs(120)) {
            Ok(response) => response,
            Err(_) => {
                writer.write_all(b"ERR: shutdown\n\n")?;
                return Ok(());
            }
        };
        mode = response.mode;
        user = response.user;
        since = response.until;
        if !response.text.is_empty() || request_line.is_some() {
            writer.write_all(response.text.as_bytes())?;
            if !response.text.ends_with('\n') {
                writer.write_all(b"\n")?;
            }
            if mode.listen != ListenMode::Direct {
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        if response.disconnect {
            return Ok(());
        }
    }
}
