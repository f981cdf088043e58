//! Handling of messages on the bus: address bookkeeping, poll
//! injection, scan walks and the grab table.

use crate::{
    protocol::{MessageDirection, ProtocolHandle, ProtocolListener, ProtocolStatus},
    request::{BusRequest, PollRequest, ScanRequest},
    Result,
};
use ebus::{
    datatype::DUP, frame_key, is_master, is_valid_address, master_address, now_secs,
    slave_address, DataType, Error, FindOptions, MasterFrame, MessageCatalog, OutputFormat,
    SlaveFrame, BROADCAST, SYN,
};
use std::{
    collections::{BTreeMap, VecDeque},
    fmt::Write as _,
    sync::{
        mpsc::sync_channel, Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

/// Seen state bit: address observed on the bus.
pub const SEEN: u8 = 0x01;
/// Seen state bit: scan initiated.
pub const SCAN_INIT: u8 = 0x02;
/// Seen state bit: scan finished.
pub const SCAN_DONE: u8 = 0x04;
/// Seen state bit: configuration loading initiated.
pub const LOAD_INIT: u8 = 0x08;
/// Seen state bit: configuration loaded.
pub const LOAD_DONE: u8 = 0x10;

/// Decode the raw bytes with one data type at every fitting offset,
/// appending `hex=value` pairs behind the type label.
fn decode_type(
    data_type: &dyn DataType,
    data: &[u8],
    length: usize,
    offsets: usize,
    first_only: bool,
    out: &mut String,
) -> bool {
    let mut first = true;
    for offset in 0..=offsets {
        let mut value = String::new();
        if data_type.read(data, offset, length, &mut value).is_err() {
            continue;
        }
        if first {
            first = false;
            let label = if data_type.is_adjustable() {
                format!("{}:{}", data_type.id(), length)
            } else {
                data_type.id().to_string()
            };
            let _ = write!(out, "\n {:<5}", label);
        } else {
            out.push(',');
        }
        out.push(' ');
        for symbol in &data[offset..offset + length] {
            let _ = write!(out, "{:02x}", symbol);
        }
        if data_type.is_numeric() {
            let _ = write!(out, "={}", value);
        } else {
            let _ = write!(out, "=\"{}\"", value);
        }
        if first_only {
            // only the first offset when the maximum size is large
            return true;
        }
    }
    !first
}

/// Walk every registered data type over the remaining bytes of a
/// grabbed frame, skipping bit, ignored and duplicate types.
fn decode_all_types(catalog: &MessageCatalog, data: &[u8], out: &mut String) {
    let remain = data.len();
    if remain == 0 {
        return;
    }
    let types = catalog.types();
    for id in types.ids() {
        let data_type = match types.get(id) {
            Some(data_type) => data_type,
            None => continue,
        };
        if data_type.bit_count() % 8 != 0 || data_type.is_ignored() || data_type.has_flag(DUP) {
            continue;
        }
        let max_length = (data_type.bit_count() / 8).min(remain);
        let first_only = data_type.bit_count() / 8 >= 8;
        if data_type.is_adjustable() {
            for length in (1..=max_length).rev() {
                let decoded =
                    decode_type(data_type.as_ref(), data, length, remain - length, first_only, out);
                if decoded && first_only {
                    break;
                }
            }
        } else if max_length > 0 {
            decode_type(data_type.as_ref(), data, max_length, remain - max_length, false, out);
        }
    }
}

/// Keeps track of one grabbed message by fingerprint.
#[derive(Debug, Clone, Default)]
pub struct GrabbedMessage {
    pub last_master: MasterFrame,
    pub last_slave: SlaveFrame,
    pub last_time: u64,
    pub count: u64,
}

impl GrabbedMessage {
    fn set_last_data(&mut self, master: &MasterFrame, slave: &SlaveFrame) {
        self.last_master = master.clone();
        self.last_slave = slave.clone();
        self.last_time = now_secs();
        self.count += 1;
    }
}

#[derive(Debug)]
struct BusState {
    seen: [u8; 256],
    scan_results: BTreeMap<u8, Vec<String>>,
    grab_enabled: bool,
    grabbed: BTreeMap<u64, GrabbedMessage>,
    running_scans: u32,
    last_poll: u64,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            seen: [0; 256],
            scan_results: BTreeMap::new(),
            grab_enabled: true,
            grabbed: BTreeMap::new(),
            running_scans: 0,
            last_poll: 0,
        }
    }
}

/// Observes every frame, injects poll requests on bus idle and drives
/// scan walks. Clones share the same state; one clone serves as the
/// protocol listener, others are used by the dispatcher.
#[derive(Clone)]
pub struct BusHandler {
    catalog: Arc<RwLock<MessageCatalog>>,
    state: Arc<Mutex<BusState>>,
    protocol: ProtocolHandle,
    /// Poll cycle in seconds, 0 disables polling.
    poll_interval: u64,
}

impl BusHandler {
    pub fn new(
        catalog: Arc<RwLock<MessageCatalog>>,
        protocol: ProtocolHandle,
        poll_interval: u64,
    ) -> Self {
        Self {
            catalog,
            state: Arc::new(Mutex::new(BusState::default())),
            protocol,
            poll_interval,
        }
    }

    pub fn protocol(&self) -> &ProtocolHandle {
        &self.protocol
    }

    pub fn catalog(&self) -> &Arc<RwLock<MessageCatalog>> {
        &self.catalog
    }

    fn catalog_read(&self) -> RwLockReadGuard<'_, MessageCatalog> {
        self.catalog.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn catalog_write(&self) -> RwLockWriteGuard<'_, MessageCatalog> {
        self.catalog.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clear stored values (scan results, registered answers).
    pub fn clear(&self) {
        self.protocol.clear();
        self.state().scan_results.clear();
    }

    pub fn seen_flags(&self, address: u8) -> u8 {
        self.state().seen[address as usize]
    }

    pub fn running_scans(&self) -> u32 {
        self.state().running_scans
    }

    /// Number of master addresses seen on the bus, including the own one.
    pub fn masters_seen(&self) -> usize {
        let state = self.state();
        (0..=0xffu8)
            .filter(|&address| {
                is_master(address)
                    && (state.seen[address as usize] & SEEN != 0
                        || address == self.protocol.own_master())
            })
            .count()
    }

    pub fn scan_result(&self, address: u8) -> Option<Vec<String>> {
        self.state().scan_results.get(&address).cloned()
    }

    /// Prepare the master part, send it and wait for the answer.
    pub fn read_from_bus(&self, index: usize, input: &str, dst: u8, src: u8) -> Result<()> {
        let master = {
            let catalog = self.catalog_read();
            let message = catalog.get(index).ok_or(Error::NotFound)?;
            let own = if src == SYN { self.protocol.own_master() } else { src };
            message.prepare_master(own, dst, input)?
        };
        let slave = self.protocol.send_and_wait(master.clone())?;
        self.catalog_write().store_last_data(index, &master, &slave)
    }

    /// Record a scan result part for the slave address.
    pub fn set_scan_result(&self, address: u8, index: usize, result: &str) {
        let mut state = self.state();
        state.seen[address as usize] |= SCAN_INIT;
        if !result.is_empty() {
            state.seen[address as usize] |= SCAN_DONE;
            let entries = state.scan_results.entry(address).or_default();
            if entries.len() <= index {
                entries.resize(index + 1, String::new());
            }
            entries[index] = result.to_string();
            log::info!("scan {:02x}: {}", address, result);
        }
    }

    fn scan_finished(&self, scan: &mut ScanRequest) {
        let mut state = self.state();
        if state.running_scans > 0 {
            state.running_scans -= 1;
        }
        drop(state);
        if let Some(waiter) = scan.waiter.take() {
            let _ = waiter.send(scan.result);
        }
    }

    /// Build a scan request for one address or a full walk.
    fn prepare_scan(
        &self,
        slave: Option<u8>,
        full: bool,
        levels: &str,
        reload: &mut bool,
    ) -> Result<Option<ScanRequest>> {
        let mut catalog = self.catalog_write();
        let scan_base = catalog.scan_message();
        if catalog.get(scan_base).is_none() {
            return Err(Error::NotFound);
        }
        if self.protocol.is_read_only() {
            return Ok(None);
        }
        // secondary scan messages, the ident query is asked only once
        let mut options = FindOptions::all();
        options.circuit = "scan".into();
        options.levels = levels.to_string();
        options.only_available = true;
        let secondary: Vec<usize> = catalog
            .find_all(&options)
            .into_iter()
            .filter(|&i| {
                catalog
                    .get(i)
                    .map(|m| {
                        !(m.primary() == 0x07 && m.secondary() == 0x04)
                            && !m.direction.is_write()
                    })
                    .unwrap_or(false)
            })
            .collect();

        let mut slaves: VecDeque<u8> = VecDeque::new();
        match slave {
            Some(address) => {
                slaves.push_back(address);
                if !*reload {
                    let fresh = catalog
                        .scan_message_for(address)
                        .ok()
                        .and_then(|i| catalog.get(i))
                        .map(|m| m.last_change_time() > 0)
                        .unwrap_or(false);
                    if !fresh {
                        *reload = true;
                    }
                }
            }
            None => {
                *reload = true;
                let state = self.state();
                for address in 1..=0xffu8 {
                    if !is_valid_address(address, false) || is_master(address) {
                        continue;
                    }
                    if !full && state.seen[address as usize] & SEEN == 0 {
                        let master = master_address(address);
                        if master == SYN || state.seen[master as usize] & SEEN == 0 {
                            continue;
                        }
                    }
                    slaves.push_back(address);
                }
            }
        }
        let mut all_messages: Vec<usize> = Vec::new();
        if *reload {
            all_messages.push(scan_base);
        }
        all_messages.extend(&secondary);
        if all_messages.is_empty() || slaves.is_empty() {
            return Ok(None);
        }
        let mut messages: VecDeque<usize> = all_messages.iter().copied().collect();
        let current = match messages.pop_front() {
            Some(current) => current,
            None => return Ok(None),
        };
        let first = *slaves.front().ok_or(Error::NotFound)?;
        let master = catalog
            .get(current)
            .ok_or(Error::NotFound)?
            .prepare_master(self.protocol.own_master(), first, "")?;
        log::info!("scan {:02x} cmd: {}", first, master);
        Ok(Some(ScanRequest {
            all_messages,
            messages,
            current,
            slaves,
            master,
            notify_index: if *reload { 0 } else { 1 },
            result_index: 0,
            delete_on_finish: slave.is_none(),
            result: Err(Error::NoSignal),
            waiter: None,
        }))
    }

    /// Initiate a scan of the slave addresses.
    pub fn start_scan(&self, full: bool, levels: &str) -> Result<()> {
        if self.running_scans() > 0 {
            return Err(Error::Duplicate);
        }
        let mut reload = true;
        let request = self
            .prepare_scan(None, full, levels, &mut reload)?
            .ok_or(Error::NotFound)?;
        {
            let mut state = self.state();
            state.scan_results.clear();
            state.running_scans += 1;
        }
        self.protocol.add_request(BusRequest::Scan(request))
    }

    /// Scan a single address and block until the walk completed.
    ///
    /// Returns whether a request was actually executed; walk failures
    /// surface as errors.
    pub fn scan_and_wait(&self, address: u8, reload: bool) -> Result<bool> {
        if !is_valid_address(address, false) || is_master(address) {
            return Err(Error::InvalidAddress);
        }
        let mut reload = reload;
        let request = match self.prepare_scan(Some(address), false, "", &mut reload)? {
            None => return Ok(false),
            Some(request) => request,
        };
        {
            let mut state = self.state();
            if reload {
                state.scan_results.remove(&address);
            } else if let Some(entries) = state.scan_results.get_mut(&address) {
                entries.truncate(1);
            }
            state.running_scans += 1;
        }
        let (waiter, done) = sync_channel(1);
        let mut request = request;
        request.waiter = Some(waiter);
        self.protocol.add_request(BusRequest::Scan(request))?;
        match done.recv_timeout(Duration::from_secs(60)) {
            Ok(result) => result.map(|_| true),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// The next slave address that still needs to be scanned or loaded.
    pub fn next_scan_address(&self, last: u8, with_unfinished: bool) -> Option<u8> {
        let state = self.state();
        let mut address = last;
        loop {
            address = address.wrapping_add(1);
            if address == 0 {
                return None;
            }
            if !is_valid_address(address, false) || is_master(address) {
                continue;
            }
            let flags = state.seen[address as usize];
            if flags & (SEEN | LOAD_INIT) == SEEN
                || (with_unfinished
                    && flags & (SEEN | SCAN_DONE | LOAD_INIT) == (SEEN | LOAD_INIT))
            {
                return Some(address);
            }
            let master = master_address(address);
            if master == SYN || state.seen[master as usize] & SEEN == 0 {
                continue;
            }
            if flags & LOAD_INIT == 0
                || (with_unfinished && flags & (SCAN_DONE | LOAD_INIT) == LOAD_INIT)
            {
                return Some(address);
            }
        }
    }

    /// Mark the participant's configuration as loading/loaded.
    pub fn set_scan_config_loaded(&self, address: u8, file: Option<&str>) {
        {
            let mut state = self.state();
            state.seen[address as usize] |= LOAD_INIT;
            if file.is_some() {
                state.seen[address as usize] |= LOAD_DONE;
            }
        }
        if let Some(file) = file {
            self.catalog_write().add_loaded_file(Some(address), file, "");
        }
    }

    /// Start or stop grabbing messages, returning whether it changed.
    pub fn enable_grab(&self, enable: bool) -> bool {
        let mut state = self.state();
        if state.grab_enabled == enable {
            return false;
        }
        if !enable {
            state.grabbed.clear();
        }
        state.grab_enabled = enable;
        true
    }

    pub fn is_grab_enabled(&self) -> bool {
        self.state().grab_enabled
    }

    /// Format the grabbed messages, optionally only unknown ones within
    /// the given time window. With `decode`, the remaining bytes of each
    /// frame are additionally decoded with every registered data type.
    pub fn format_grab_result(
        &self,
        unknown_only: bool,
        direct: bool,
        since: u64,
        until: u64,
        decode: bool,
    ) -> String {
        let state = self.state();
        if !state.grab_enabled {
            return if direct { String::new() } else { "grab disabled".to_string() };
        }
        let grabbed: Vec<GrabbedMessage> = state
            .grabbed
            .values()
            .filter(|g| (since == 0 || g.last_time >= since) && (until == 0 || g.last_time < until))
            .cloned()
            .collect();
        drop(state);
        let catalog = self.catalog_read();
        let mut out = String::new();
        for grab in grabbed {
            let found = catalog.find_by_frame(&grab.last_master);
            if unknown_only && found.is_some() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            let dst = grab.last_master.destination();
            let _ = write!(out, "{}", grab.last_master);
            if dst != BROADCAST && !is_master(dst) {
                let _ = write!(out, "{}{}", if direct { " " } else { " / " }, grab.last_slave);
            }
            if !direct {
                let _ = write!(out, " = {}", grab.count);
                if let Some(index) = found {
                    if let Some(message) = catalog.get(index) {
                        let _ = write!(out, ": {} {}", message.circuit, message.name);
                    }
                }
            }
            if decode {
                let master_side =
                    dst == BROADCAST || is_master(dst) || grab.last_slave.data_size() == 0;
                let data = if master_side {
                    grab.last_master.data()
                } else {
                    grab.last_slave.data()
                };
                decode_all_types(&catalog, data, &mut out);
            }
        }
        out
    }

    /// Format the scan result of a single slave, if any.
    pub fn format_scan_result_for(&self, address: u8) -> Option<String> {
        let state = self.state();
        let entries = state.scan_results.get(&address)?;
        let mut out = format!("{:02x}", address);
        for entry in entries {
            out.push_str(entry);
        }
        Some(out)
    }

    /// Format all scan results.
    pub fn format_scan_results(&self) -> String {
        let mut out = String::new();
        let running = self.running_scans();
        if running > 0 {
            let _ = writeln!(out, "{} scan(s) still running", running);
        }
        let addresses: Vec<u8> = self.state().scan_results.keys().copied().collect();
        for address in addresses {
            if let Some(line) = self.format_scan_result_for(address) {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&line);
            }
        }
        out
    }

    /// Format information about seen participants.
    pub fn format_seen_info(&self) -> String {
        let seen = { self.state().seen };
        let catalog = self.catalog_read();
        let mut out = String::new();
        for address in 0..=0xffu8 {
            let own = self.protocol.is_own_address(address);
            if !is_valid_address(address, false) || (seen[address as usize] & SEEN == 0 && !own) {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = write!(out, "address {:02x}: ", address);
            if is_master(address) {
                let _ = write!(out, "master #{}", ebus::master_number(address));
            } else {
                out.push_str("slave");
                let master = master_address(address);
                if master != SYN {
                    let _ = write!(out, " of {:02x}", master);
                }
            }
            if own {
                out.push_str(", ebusd");
                if self.protocol.is_address_conflict() {
                    out.push_str(", conflict");
                }
            }
            if self.protocol.has_answer(address) {
                out.push_str(" (answering)");
            }
            let flags = seen[address as usize];
            if flags & SCAN_DONE != 0 {
                out.push_str(", scanned");
                if let Some(result) = self.scan_result_line(address) {
                    let _ = write!(out, " \"{}\"", result);
                }
            } else if flags & SCAN_INIT != 0 {
                out.push_str(", scanning");
            }
            let loaded = catalog.loaded_files_for(address);
            for (i, file) in loaded.iter().enumerate() {
                if i == 0 {
                    let _ = write!(out, ", loaded \"{}\"", file);
                } else {
                    let _ = write!(out, ", \"{}\"", file);
                }
            }
        }
        out
    }

    fn scan_result_line(&self, address: u8) -> Option<String> {
        let state = self.state();
        let joined: String = state.scan_results.get(&address)?.concat();
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    fn store_ident_broadcast(&self, address: u8, master: &MasterFrame) {
        let decoded = {
            let mut catalog = self.catalog_write();
            let index = match catalog.scan_message_for(address) {
                Ok(index) => index,
                Err(_) => return,
            };
            let message = match catalog.get(index) {
                Some(message) => message,
                None => return,
            };
            if message.last_update_time() != 0 && message.last_slave_data().data_size() >= 10 {
                return;
            }
            let synthesized = match message.prepare_master(self.protocol.own_master(), SYN, "") {
                Ok(frame) => frame,
                Err(e) => {
                    log::info!("store broadcast ident: {}", e);
                    return;
                }
            };
            let mut ident = SlaveFrame::new();
            ident.push(10);
            for i in 0..10 {
                ident.push(master.data_at(i));
            }
            let result = catalog
                .store_last_data(index, &synthesized, &ident)
                .and_then(|_| {
                    let mut out = String::new();
                    catalog
                        .get(index)
                        .ok_or(Error::NotFound)?
                        .decode_last_data(None, OutputFormat::NONE, &mut out)?;
                    Ok(out)
                });
            match result {
                Ok(out) => {
                    log::info!("store broadcast ident: done");
                    Some(out)
                }
                Err(e) => {
                    log::info!("store broadcast ident: {}", e);
                    None
                }
            }
        };
        if let Some(out) = decoded {
            self.set_scan_result(address, 0, &out);
        }
    }

    fn store_ident_response(&self, address: u8, master: &MasterFrame, slave: &SlaveFrame) {
        let decoded = {
            let mut catalog = self.catalog_write();
            let index = match catalog.scan_message_for(address) {
                Ok(index) => index,
                Err(_) => return,
            };
            let message = match catalog.get(index) {
                Some(message) => message,
                None => return,
            };
            if message.last_update_time() != 0 && message.last_slave_data().data_size() >= 10 {
                return;
            }
            let result = catalog.store_last_data(index, master, slave).and_then(|_| {
                let mut out = String::new();
                catalog
                    .get(index)
                    .ok_or(Error::NotFound)?
                    .decode_last_data(None, OutputFormat::NONE, &mut out)?;
                Ok(out)
            });
            match result {
                Ok(out) => {
                    log::info!("store {:02x} ident: done", address);
                    Some(out)
                }
                Err(e) => {
                    log::info!("store {:02x} ident: {}", address, e);
                    None
                }
            }
        };
        if let Some(out) = decoded {
            self.set_scan_result(address, 0, &out);
        }
    }

    fn poll_notify(&self, poll: PollRequest, result: Result<()>, slave: &SlaveFrame) {
        match result {
            Ok(()) => {
                let mut catalog = self.catalog_write();
                if let Err(e) = catalog.store_last_data(poll.message, &poll.master, slave) {
                    let (circuit, name) = catalog
                        .get(poll.message)
                        .map(|m| (m.circuit.clone(), m.name.clone()))
                        .unwrap_or_default();
                    log::error!("poll {} {} failed: {}", circuit, name, e);
                }
            }
            Err(e) => {
                let catalog = self.catalog_read();
                let (circuit, name) = catalog
                    .get(poll.message)
                    .map(|m| (m.circuit.clone(), m.name.clone()))
                    .unwrap_or_default();
                log::error!("poll {} {} failed: {}", circuit, name, e);
            }
        }
    }

    fn scan_notify(
        &self,
        mut scan: ScanRequest,
        result: Result<()>,
        slave: &SlaveFrame,
    ) -> Option<BusRequest> {
        let dst = scan.master.destination();
        self.set_scan_result(dst, 0, "");
        let mut result = result;
        if result.is_ok() {
            let decoded = {
                let mut catalog = self.catalog_write();
                if scan.current == catalog.scan_message() {
                    if let Ok(specific) = catalog.scan_message_for(dst) {
                        scan.current = specific;
                    }
                } else if catalog.get(scan.current).map(|m| m.dst) == Some(SYN) {
                    let derived = catalog
                        .get(scan.current)
                        .and_then(|m| m.derive(dst).ok());
                    if let Some(derived) = derived {
                        if let Ok(index) = catalog.add(derived) {
                            scan.current = index;
                        }
                    }
                }
                catalog
                    .store_last_data(scan.current, &scan.master, slave)
                    .and_then(|_| {
                        let mut out = String::new();
                        catalog
                            .get(scan.current)
                            .ok_or(Error::NotFound)?
                            .decode_last_data(None, OutputFormat::NONE, &mut out)?;
                        Ok(out)
                    })
            };
            match decoded {
                Ok(out) => {
                    self.set_scan_result(dst, scan.notify_index + scan.result_index, &out)
                }
                Err(e) => result = Err(e),
            }
        }
        if let Err(e) = result {
            scan.slaves.pop_front();
            if scan.delete_on_finish {
                if e == Error::Timeout {
                    log::info!("scan {:02x} timed out ({} slaves left)", dst, scan.slaves.len());
                } else {
                    log::error!("scan {:02x} failed ({} slaves left): {}", dst, scan.slaves.len(), e);
                }
            }
            scan.messages.clear();
        } else if scan.messages.is_empty() {
            scan.slaves.pop_front();
            if scan.delete_on_finish {
                log::info!("scan {:02x} completed ({} slaves left)", dst, scan.slaves.len());
            }
        }
        scan.result = result;
        if scan.slaves.is_empty() || result == Err(Error::NoSignal) {
            if scan.delete_on_finish {
                log::info!("scan finished");
            }
            self.scan_finished(&mut scan);
            return None;
        }
        if scan.messages.is_empty() {
            scan.messages = scan.all_messages.iter().copied().collect();
            scan.result_index = 0;
        } else {
            scan.result_index += 1;
        }
        scan.current = match scan.messages.pop_front() {
            Some(current) => current,
            None => {
                self.scan_finished(&mut scan);
                return None;
            }
        };
        let next = match scan.slaves.front().copied() {
            Some(next) => next,
            None => {
                self.scan_finished(&mut scan);
                return None;
            }
        };
        let prepared = {
            let catalog = self.catalog_read();
            catalog
                .get(scan.current)
                .ok_or(Error::NotFound)
                .and_then(|m| m.prepare_master(self.protocol.own_master(), next, ""))
        };
        match prepared {
            Ok(master) => {
                log::info!("scan {:02x} cmd: {}", next, master);
                scan.master = master;
                Some(BusRequest::Scan(scan))
            }
            Err(e) => {
                if e != Error::Eof {
                    scan.result = Err(e);
                }
                self.scan_finished(&mut scan);
                None
            }
        }
    }
}

impl ProtocolListener for BusHandler {
    fn on_status(&mut self, status: ProtocolStatus) {
        if status != ProtocolStatus::Idle || self.poll_interval == 0 {
            return;
        }
        let now = now_secs();
        {
            let state = self.state();
            if state.last_poll != 0 && now < state.last_poll + self.poll_interval {
                return;
            }
        }
        let request = {
            let mut catalog = self.catalog_write();
            match catalog.next_poll(now) {
                None => None,
                Some(index) => {
                    let message = match catalog.get(index) {
                        Some(message) => message,
                        None => return,
                    };
                    // skip if updated by other means within the interval
                    if message.last_update_time() != 0
                        && now < message.last_update_time() + self.poll_interval
                    {
                        None
                    } else {
                        match message.prepare_master(self.protocol.own_master(), SYN, "") {
                            Ok(master) => {
                                log::info!("poll cmd: {}", master);
                                Some(BusRequest::Poll(PollRequest { message: index, master }))
                            }
                            Err(e) => {
                                log::error!("prepare poll message: {}", e);
                                None
                            }
                        }
                    }
                }
            }
        };
        self.state().last_poll = now;
        if let Some(request) = request {
            if let Err(e) = self.protocol.add_request(request) {
                log::error!("push poll message: {}", e);
            }
        }
    }

    fn on_seen_address(&mut self, address: u8) {
        self.state().seen[address as usize] |= SEEN;
    }

    fn on_message(&mut self, direction: MessageDirection, master: &MasterFrame, slave: &SlaveFrame) {
        let src = master.source();
        let dst = master.destination();
        let dst_master = is_master(dst);
        if dst == BROADCAST {
            if master.data_size() >= 10 && master.primary() == 0x07 && master.secondary() == 0x04 {
                let address = slave_address(src);
                self.on_seen_address(address);
                self.store_ident_broadcast(address, master);
            }
        } else if !dst_master && master.primary() == 0x07 && master.secondary() == 0x04 {
            self.store_ident_response(dst, master, slave);
        }
        let found = self.catalog_read().find_by_frame(master);
        {
            let mut state = self.state();
            if state.grab_enabled {
                state
                    .grabbed
                    .entry(frame_key(master))
                    .or_default()
                    .set_last_data(master, slave);
            }
        }
        if direction == MessageDirection::Answered
            && dst_master
            && master.data_size() >= slave.data_size()
        {
            // pre-register an MS auto-answer matching the MM id split
            let id_len = master.data_size() - slave.data_size();
            let mut answer = SlaveFrame::new();
            answer.push(0);
            for i in id_len..master.data_size() {
                answer.push(master.data_at(i));
            }
            answer.adjust_header();
            let mut id = vec![master.primary(), master.secondary()];
            id.extend(&master.data()[..id_len]);
            let _ = self.protocol.set_answer(dst, &id, answer);
        }
        let index = match found {
            None => {
                if dst == BROADCAST || dst_master {
                    log::info!(
                        "{} unknown {} cmd: {}",
                        direction.label(),
                        if dst_master { "MM" } else { "BC" },
                        master
                    );
                } else {
                    log::info!("{} unknown MS cmd: {} / {}", direction.label(), master, slave);
                }
                return;
            }
            Some(index) => index,
        };
        let mut catalog = self.catalog_write();
        catalog.invalidate_cache(index);
        let stored = catalog.store_last_data(index, master, slave);
        let message = match catalog.get(index) {
            Some(message) => message,
            None => return,
        };
        let circuit = message.circuit.clone();
        let name = message.name.clone();
        let mode = if message.is_scan_message() {
            "scan-read"
        } else if message.direction.is_passive() {
            if message.direction.is_write() {
                "update-write"
            } else {
                "update-read"
            }
        } else if message.poll_priority > 0 {
            if message.direction.is_write() {
                "poll-write"
            } else {
                "poll-read"
            }
        } else if message.direction.is_write() {
            "write"
        } else {
            "read"
        };
        let decoded = stored.and_then(|_| {
            let mut out = String::new();
            message.decode_last_data(None, OutputFormat::NONE, &mut out)?;
            Ok(out)
        });
        let any_dst = message.dst == SYN;
        let any_src = message.src == SYN;
        drop(catalog);
        match decoded {
            Err(e) => log::error!(
                "unable to parse {} {} {} from {} / {}: {}",
                mode,
                circuit,
                name,
                master,
                slave,
                e
            ),
            Ok(data) => {
                if self.protocol.is_own_address(dst) {
                    log::info!(
                        "{} {} self-update {} {} QQ={:02x}: {}",
                        direction.label(),
                        mode,
                        circuit,
                        name,
                        src,
                        data
                    );
                } else if any_dst && any_src {
                    log::info!(
                        "{} {} {} {} QQ={:02x} ZZ={:02x}: {}",
                        direction.label(),
                        mode,
                        circuit,
                        name,
                        src,
                        dst,
                        data
                    );
                } else if any_dst {
                    log::info!(
                        "{} {} {} {} ZZ={:02x}: {}",
                        direction.label(),
                        mode,
                        circuit,
                        name,
                        dst,
                        data
                    );
                } else if any_src {
                    log::info!(
                        "{} {} {} {} QQ={:02x}: {}",
                        direction.label(),
                        mode,
                        circuit,
                        name,
                        src,
                        data
                    );
                } else {
                    log::info!("{} {} {} {}: {}", direction.label(), mode, circuit, name, data);
                }
            }
        }
    }

    fn notify_request(
        &mut self,
        request: BusRequest,
        result: Result<()>,
        slave: &SlaveFrame,
    ) -> Option<BusRequest> {
        match request {
            BusRequest::Poll(poll) => {
                self.poll_notify(poll, result, slave);
                None
            }
            BusRequest::Scan(scan) => self.scan_notify(scan, result, slave),
            BusRequest::Active { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::MockDevice,
        protocol::{ProtocolConfig, ProtocolHandler},
    };
    use ebus::{data::PartType, DataTypeList, Direction, Field, FieldList, Message};
    use std::collections::BTreeMap as Map;

    fn handler(poll_interval: u64) -> BusHandler {
        let catalog = Arc::new(RwLock::new(MessageCatalog::new(Arc::new(
            DataTypeList::new(),
        ))));
        let protocol = ProtocolHandler::new(
            Box::new(MockDevice::new()),
            ProtocolConfig {
                own_master: 0x31,
                ..ProtocolConfig::default()
            },
        );
        BusHandler::new(catalog, protocol.handle(), poll_interval)
    }

    fn poll_message(name: &str, priority: usize) -> Message {
        let types = DataTypeList::new();
        let field = Field::new(
            "temp",
            PartType::SlaveData,
            types.get("D2C").unwrap(),
            None,
            0,
            Map::new(),
            "",
            "",
        )
        .unwrap();
        let mut message = Message::new(
            "heat",
            name,
            Direction::Read,
            "",
            SYN,
            0x08,
            vec![0xb5, 0x09, 0x0d],
            FieldList::new(vec![field]),
        )
        .unwrap();
        message.poll_priority = priority;
        message
    }

    #[test]
    fn seen_addresses_are_marked() {
        let mut bus = handler(0);
        bus.on_seen_address(0x31);
        bus.on_seen_address(0x08);
        assert_eq!(bus.seen_flags(0x31), SEEN);
        assert_eq!(bus.seen_flags(0x08), SEEN);
        assert_eq!(bus.seen_flags(0x15), 0);
        // the own master counts even without traffic
        assert_eq!(bus.masters_seen(), 1);
    }

    #[test]
    fn idle_injects_poll_request() {
        let mut bus = handler(1);
        {
            let mut catalog = bus.catalog().write().unwrap();
            catalog.add(poll_message("flow", 1)).unwrap();
        }
        bus.on_status(crate::protocol::ProtocolStatus::Idle);
        assert_eq!(bus.protocol().pending_requests(), 1);
        // within the interval no further poll is injected
        bus.on_status(crate::protocol::ProtocolStatus::Idle);
        assert_eq!(bus.protocol().pending_requests(), 1);
    }

    #[test]
    fn idle_without_poll_messages_is_quiet() {
        let mut bus = handler(1);
        bus.on_status(crate::protocol::ProtocolStatus::Idle);
        assert_eq!(bus.protocol().pending_requests(), 0);
    }

    #[test]
    fn observed_frames_feed_the_grab_table() {
        let mut bus = handler(0);
        let master = MasterFrame::parse_hex("3108b509010d").unwrap();
        let slave = SlaveFrame::parse_hex("02410c").unwrap();
        bus.on_message(MessageDirection::Received, &master, &slave);
        bus.on_message(MessageDirection::Received, &master, &slave);
        let out = bus.format_grab_result(false, false, 0, 0, false);
        assert!(out.contains("3108b509010d"));
        assert!(out.contains("02410c"));
        assert!(out.contains("= 2"));

        // known messages are hidden from the unknown-only view
        {
            let mut catalog = bus.catalog().write().unwrap();
            catalog.add(poll_message("flow", 0)).unwrap();
        }
        let out = bus.format_grab_result(true, false, 0, 0, false);
        assert!(out.is_empty());
    }

    #[test]
    fn grab_can_be_disabled() {
        let bus = handler(0);
        assert!(!bus.enable_grab(true), "grabbing starts enabled");
        assert!(bus.enable_grab(false));
        assert_eq!(bus.format_grab_result(false, false, 0, 0, false), "grab disabled");
    }

    #[test]
    fn grab_result_decode_dumps_every_type() {
        let mut bus = handler(0);
        let master = MasterFrame::parse_hex("3108b50902410c").unwrap();
        let slave = SlaveFrame::parse_hex("02410c").unwrap();
        bus.on_message(MessageDirection::Received, &master, &slave);
        let out = bus.format_grab_result(false, false, 0, 0, true);
        // the slave bytes 41 0c decoded with every fitting type
        assert!(out.contains("D2C"));
        assert!(out.contains("410c=196.06"));
        assert!(out.contains("UCH"));
        assert!(out.contains("41=65"));
        assert!(out.contains("0c=12"));
        // adjustable types show only the longest decodable length
        assert!(out.contains("STR:2"));
        assert!(out.contains("410c=\"A\""));
        assert!(!out.contains("STR:1"));
        // bit, ignored and duplicate types are left out
        assert!(!out.contains("BI0"));
        assert!(!out.contains("IGN"));
        assert!(!out.contains("D1B"));

        // without the decode dump only the frame line shows
        let plain = bus.format_grab_result(false, false, 0, 0, false);
        assert!(!plain.contains("D2C"));
    }

    #[test]
    fn grab_result_decode_uses_master_bytes_for_broadcast() {
        let mut bus = handler(0);
        let master = MasterFrame::parse_hex("31fe0700024812").unwrap();
        bus.on_message(MessageDirection::Received, &master, &SlaveFrame::new());
        let out = bus.format_grab_result(false, false, 0, 0, true);
        // master data 48 12 decoded, e.g. as a single UCH per offset
        assert!(out.contains("UCH"));
        assert!(out.contains("48=72"));
        assert!(out.contains("12=18"));
    }

    #[test]
    fn next_scan_address_walks_seen_slaves() {
        let mut bus = handler(0);
        bus.on_seen_address(0x08);
        bus.on_seen_address(0x15);
        assert_eq!(bus.next_scan_address(0, false), Some(0x08));
        assert_eq!(bus.next_scan_address(0x08, false), Some(0x15));
        assert_eq!(bus.next_scan_address(0x15, false), None);

        // loading initiated but unfinished: only revisited with_unfinished
        bus.set_scan_config_loaded(0x08, None);
        assert_eq!(bus.next_scan_address(0, false), Some(0x15));
        assert_eq!(bus.next_scan_address(0, true), Some(0x08));
        // fully loaded addresses are skipped either way
        bus.set_scan_config_loaded(0x08, Some("vaillant/08.csv"));
        bus.set_scan_result(0x08, 0, "result");
        assert_eq!(bus.next_scan_address(0, true), Some(0x15));
    }

    #[test]
    fn broadcast_ident_is_captured_without_traffic() {
        let mut bus = handler(0);
        let master =
            MasterFrame::parse_hex("31fe07040ab5544950303030010064").unwrap();
        bus.on_message(MessageDirection::Received, &master, &SlaveFrame::new());
        // derived slave address of master 0x31
        assert_ne!(bus.seen_flags(0x36) & SEEN, 0);
        assert_ne!(bus.seen_flags(0x36) & SCAN_DONE, 0);
        let results = bus.scan_result(0x36).unwrap();
        assert_eq!(results[0], "Vaillant;TIP00;3001;0064");
    }
}
