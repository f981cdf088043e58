//! The long-lived dispatcher loop: services the request queue, runs the
//! periodic housekeeping (signal watchdog, scan progress, update check,
//! data sink notifications) and serializes external command execution.

use crate::{
    bushandler::BusHandler,
    protocol::{ProtocolHandle, RECONNECT_MISSING_SIGNAL},
    queue::Queue,
    request::{ListenMode, NetRequest, NetResponse, RequestMode},
    scan::ScanHelper,
    Result,
};
use ebus::{
    data::PartType, filereader, is_master, is_valid_address, now_secs, Error, Field, FieldList,
    FindOptions, MasterFrame, Message, OutputFormat, BROADCAST, SYN,
};
use std::{collections::HashMap, fmt::Write as _, sync::Arc, time::Duration};

/// The delay between update checks.
const CHECK_DELAY: u64 = 24 * 3600;

/// The initial grace period before the first update check.
const CHECK_INITIAL_DELAY: u64 = 2 * 60;

/// The number of completed scan sweeps after which to retry failed ones.
const SCAN_REPEAT_COUNT: u32 = 6;

/// Default maximum age for answering a read from the cache.
const DEFAULT_MAX_AGE: u64 = 5 * 60;

/// Progress of the configuration scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    None,
    Running,
    Finished,
}

/// The configured initial scan behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialScan {
    None,
    /// Send the broadcast query-existence message once.
    Broadcast,
    /// Scan all valid slave addresses.
    Full,
    /// Scan a single address.
    Single(u8),
}

/// Consumer of message updates, e.g. an MQTT or KNX bridge.
pub trait DataSink: Send {
    fn notify_update(&mut self, message: &Message, changed: bool);

    fn notify_scan_status(&mut self, status: ScanStatus);

    fn notify_update_check(&mut self, result: &str);
}

/// External collaborator performing the update check call.
pub trait UpdateChecker: Send {
    /// Post the status body, returning the version verdict.
    fn check(&mut self, body: &str) -> Result<String>;
}

/// One entry of the access control list.
#[derive(Debug, Clone, Default)]
pub struct UserEntry {
    pub secret: String,
    pub levels: String,
}

/// Parse an ACL file with `user:secret:levels` lines.
pub fn parse_access_list(content: &str) -> HashMap<String, UserEntry> {
    let mut users = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ':');
        let user = parts.next().unwrap_or("").to_string();
        let secret = parts.next().unwrap_or("").to_string();
        let levels = parts.next().unwrap_or("").to_string();
        if !user.is_empty() {
            users.insert(user, UserEntry { secret, levels });
        }
    }
    users
}

/// Settings of the dispatcher.
pub struct DispatcherConfig {
    pub scan_config: bool,
    pub initial_scan: InitialScan,
    pub scan_retries: u32,
    pub polling: bool,
    pub enable_hex: bool,
    pub enable_define: bool,
    pub users: HashMap<String, UserEntry>,
    pub default_levels: String,
    pub dump_file: Option<String>,
    pub dump_size: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            scan_config: false,
            initial_scan: InitialScan::None,
            scan_retries: 2,
            polling: false,
            enable_hex: false,
            enable_define: false,
            users: HashMap::new(),
            default_levels: String::new(),
            dump_file: None,
            dump_size: 100 * 1024 * 1024,
        }
    }
}

struct ExecOutcome {
    text: String,
    disconnect: bool,
    user: String,
    reload: bool,
}

/// Serializes all external command execution against the bus and the
/// catalog.
pub struct Dispatcher {
    bus: BusHandler,
    protocol: ProtocolHandle,
    scan_helper: ScanHelper,
    queue: Arc<Queue<NetRequest>>,
    config: DispatcherConfig,
    data_sinks: Vec<Box<dyn DataSink>>,
    update_checker: Option<Box<dyn UpdateChecker>>,
    update_result: String,
    scan_status: ScanStatus,
    reconnect_count: u32,
    start_time: u64,
    dump_active: bool,
}

impl Dispatcher {
    pub fn new(
        bus: BusHandler,
        scan_helper: ScanHelper,
        queue: Arc<Queue<NetRequest>>,
        config: DispatcherConfig,
    ) -> Self {
        let protocol = bus.protocol().clone();
        Self {
            bus,
            protocol,
            scan_helper,
            queue,
            config,
            data_sinks: Vec::new(),
            update_checker: None,
            update_result: String::new(),
            scan_status: ScanStatus::None,
            reconnect_count: 0,
            start_time: now_secs(),
            dump_active: false,
        }
    }

    pub fn add_data_sink(&mut self, sink: Box<dyn DataSink>) {
        self.data_sinks.push(sink);
    }

    pub fn set_update_checker(&mut self, checker: Box<dyn UpdateChecker>) {
        self.update_checker = Some(checker);
    }

    fn user_levels(&self, user: &str) -> String {
        if user.is_empty() {
            return self.config.default_levels.clone();
        }
        self.config
            .users
            .get(user)
            .map(|entry| entry.levels.clone())
            .unwrap_or_else(|| self.config.default_levels.clone())
    }

    /// The dispatcher loop; returns on shutdown.
    pub fn run(&mut self) {
        let mut reload = true;
        let mut task_delay = Duration::from_secs(5);
        let mut last_task_run = now_secs();
        let mut last_signal = 0u64;
        let mut sink_since = now_secs();
        let mut next_check_run = now_secs() + CHECK_INITIAL_DELAY;
        let mut last_scan_address = 0u8;
        let mut last_scan_status = self.scan_status;
        let mut scan_completed = 0u32;
        let mut scan_retry = 0u32;
        while !self.protocol.is_shutdown() {
            let request = self.queue.pop(task_delay);
            let now = now_secs();
            if now >= last_task_run + task_delay.as_secs() {
                log::debug!("performing regular tasks");
                if self.protocol.has_signal() {
                    last_signal = now;
                } else if last_signal != 0 && now > last_signal + RECONNECT_MISSING_SIGNAL {
                    last_signal = 0;
                    self.protocol.reconnect();
                    self.reconnect_count += 1;
                }
                if self.config.scan_config && scan_retry <= self.config.scan_retries {
                    let mut load_delay = false;
                    if self.config.initial_scan != InitialScan::None
                        && reload
                        && self.protocol.has_signal()
                    {
                        load_delay = true;
                        match self.run_initial_scan() {
                            Ok(()) => reload = false,
                            Err(e) => log::error!("initial scan failed: {}", e),
                        }
                    }
                    if !load_delay && self.protocol.has_signal() {
                        let with_unfinished = scan_completed >= SCAN_REPEAT_COUNT;
                        match self.bus.next_scan_address(last_scan_address, with_unfinished) {
                            None => {
                                task_delay = Duration::from_secs(5);
                                last_scan_address = 0;
                                self.scan_status = ScanStatus::Finished;
                                scan_completed += 1;
                                if scan_completed > SCAN_REPEAT_COUNT {
                                    scan_completed = 0;
                                    scan_retry += 1;
                                    log::info!(
                                        "scan completed {} time(s), {}",
                                        scan_retry,
                                        if scan_retry <= self.config.scan_retries {
                                            "check again"
                                        } else {
                                            "end"
                                        }
                                    );
                                }
                            }
                            Some(address) => {
                                self.scan_status = ScanStatus::Running;
                                last_scan_address = address;
                                let result = self.scan_and_load(address);
                                task_delay = if result == Err(Error::NoSignal) {
                                    Duration::from_secs(10)
                                } else {
                                    Duration::from_secs(1)
                                };
                                match result {
                                    Ok(()) => {
                                        log::info!("scan config {:02x} message received", address);
                                        next_check_run = now + CHECK_INITIAL_DELAY;
                                    }
                                    Err(e) => {
                                        log::error!("scan config {:02x}: {}", address, e)
                                    }
                                }
                            }
                        }
                    }
                    if last_scan_status != self.scan_status {
                        last_scan_status = self.scan_status;
                        for sink in &mut self.data_sinks {
                            sink.notify_scan_status(last_scan_status);
                        }
                    }
                } else if reload && self.protocol.has_signal() {
                    reload = false;
                    let _ = self.scan_helper.execute_instructions(&self.bus);
                    {
                        let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
                        if catalog.condition_count() > 0 && !self.config.polling {
                            log::error!("conditions require a poll interval > 0");
                        }
                    }
                    for sink in &mut self.data_sinks {
                        sink.notify_scan_status(ScanStatus::Finished);
                    }
                }
                if self.update_checker.is_some() && now > next_check_run {
                    next_check_run = self.run_update_check(now);
                }
                last_task_run = now_secs();
            }
            let now = now_secs();
            if !self.data_sinks.is_empty() {
                self.notify_data_sinks(sink_since, now);
                sink_since = now;
            }
            let request = match request {
                Some(request) => request,
                None => continue,
            };
            if self.protocol.is_shutdown() {
                let _ = request.response.send(NetResponse {
                    text: "ERR: shutdown".into(),
                    mode: request.mode,
                    user: request.user,
                    disconnect: true,
                    until: now,
                });
                break;
            }
            let mut mode = request.mode;
            let since = if mode.listen == ListenMode::None {
                now
            } else {
                request.since
            };
            let outcome = if request.line.is_empty() {
                ExecOutcome {
                    text: String::new(),
                    disconnect: false,
                    user: request.user.clone(),
                    reload: false,
                }
            } else {
                log::debug!(">>> {}", request.line);
                self.execute_line(&request.line, &request.user, &mut mode)
            };
            if outcome.reload && !reload {
                reload = true;
                scan_retry = 0;
            }
            let mut text = outcome.text;
            match mode.listen {
                ListenMode::Listen => {
                    if !mode.only_unknown {
                        let levels = self.user_levels(&outcome.user);
                        text.push_str(&self.format_listen_updates(&levels, since, now, mode.format));
                    }
                    if mode.with_unknown || mode.only_unknown {
                        if self.bus.is_grab_enabled() {
                            let grabbed = self.bus.format_grab_result(true, true, since, now, false);
                            if !grabbed.is_empty() {
                                if !text.is_empty() && !text.ends_with('\n') {
                                    text.push('\n');
                                }
                                text.push_str(&grabbed);
                            }
                        } else {
                            self.bus.enable_grab(true);
                        }
                    }
                }
                ListenMode::Direct => {
                    if self.bus.is_grab_enabled() {
                        let grabbed = self.bus.format_grab_result(false, true, since, now, false);
                        if !grabbed.is_empty() {
                            if !text.is_empty() && !text.ends_with('\n') {
                                text.push('\n');
                            }
                            text.push_str(&grabbed);
                        }
                    }
                }
                ListenMode::None => {}
            }
            if !text.is_empty() {
                let short: String = text.chars().take(100).collect();
                log::debug!("<<< {}", short);
            }
            let _ = request.response.send(NetResponse {
                text,
                mode,
                user: outcome.user,
                disconnect: outcome.disconnect,
                until: now,
            });
        }
    }

    fn format_listen_updates(&self, levels: &str, since: u64, until: u64, format: OutputFormat) -> String {
        let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
        let mut options = FindOptions::all();
        options.levels = levels.to_string();
        options.updated_since = since;
        options.updated_until = until;
        options.only_with_data = true;
        let mut out = String::new();
        for index in catalog.find_all(&options) {
            let message = match catalog.get(index) {
                Some(message) => message,
                None => continue,
            };
            let mut value = String::new();
            if message.decode_last_data(None, format, &mut value).is_ok() {
                let _ = writeln!(out, "{} {} = {}", message.circuit, message.name, value);
            }
        }
        out
    }

    fn notify_data_sinks(&mut self, since: u64, until: u64) {
        let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
        let mut options = FindOptions::all();
        options.updated_since = since;
        options.updated_until = until;
        options.only_with_data = true;
        for index in catalog.find_all(&options) {
            if let Some(message) = catalog.get(index) {
                let changed = message.last_change_time() >= since;
                for sink in &mut self.data_sinks {
                    sink.notify_update(message, changed);
                }
            }
        }
    }

    fn run_initial_scan(&mut self) -> Result<()> {
        match self.config.initial_scan {
            InitialScan::None => Ok(()),
            InitialScan::Full => {
                log::info!("starting initial full scan");
                self.bus.start_scan(true, "*")?;
                self.scan_status = ScanStatus::Running;
                Ok(())
            }
            InitialScan::Broadcast => {
                log::info!("starting initial broadcast scan");
                let mut master = MasterFrame::new();
                master.push(self.protocol.own_master());
                master.push(BROADCAST);
                master.push(0x07);
                master.push(0xfe);
                master.adjust_header();
                self.protocol.send_and_wait(master).map(|_| ())
            }
            InitialScan::Single(address) => {
                log::info!("starting initial scan for {:02x}", address);
                self.scan_and_load(address)?;
                if let Some(result) = self.bus.format_scan_result_for(address) {
                    log::info!("initial scan result: {}", result);
                }
                self.scan_status = ScanStatus::Running;
                Ok(())
            }
        }
    }

    /// Scan one address synchronously and load the matching definition
    /// files; repeated once when loading added further scan messages.
    fn scan_and_load(&mut self, address: u8) -> Result<()> {
        let had_additional = {
            let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
            catalog.has_additional_scan_messages()
        };
        let executed = self.bus.scan_and_wait(address, false);
        let (executed, mut result) = match executed {
            Ok(executed) => (executed, Ok(())),
            Err(e) => (true, Err(e)),
        };
        let timed_out = result == Err(Error::Timeout);
        let mut load_failed = false;
        let mut file = None;
        if timed_out || result.is_ok() {
            // try to load even if a message timed out
            match self.scan_helper.load_scan_config(address) {
                Ok(loaded) => {
                    file = Some(loaded);
                    result = Ok(());
                }
                Err(e) => {
                    load_failed = true;
                    if !timed_out {
                        result = Err(e);
                    }
                }
            }
        }
        if result.is_ok() {
            let _ = self.scan_helper.execute_instructions(&self.bus);
            self.bus.set_scan_config_loaded(address, file.as_deref());
            let has_additional = {
                let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
                catalog.has_additional_scan_messages()
            };
            if !had_additional && has_additional {
                // harvest the newly available extended ident fields
                let _ = self.bus.scan_and_wait(address, false);
            }
        } else if load_failed || (executed && timed_out) || result == Err(Error::NotAuthorized) {
            self.bus.set_scan_config_loaded(address, None);
        }
        result
    }

    fn run_update_check(&mut self, now: u64) -> u64 {
        let mut body = String::new();
        let _ = write!(
            body,
            "{{\"v\":\"{}\",\"u\":{},\"s\":{},\"rc\":{},\"m\":{}}}",
            env!("CARGO_PKG_VERSION"),
            now - self.start_time,
            self.protocol.max_symbol_rate(),
            self.reconnect_count,
            self.bus.catalog().read().map(|c| c.len()).unwrap_or(0)
        );
        let checker = match self.update_checker.as_mut() {
            Some(checker) => checker,
            None => return now + CHECK_DELAY,
        };
        match checker.check(&body) {
            Ok(response) => {
                self.update_result = if response.is_empty() {
                    "unknown".to_string()
                } else {
                    response.clone()
                };
                log::info!("update check: {}", self.update_result);
                let notify = if response == "OK" { "" } else { &self.update_result };
                for sink in &mut self.data_sinks {
                    sink.notify_update_check(notify);
                }
                now + CHECK_DELAY
            }
            Err(e) => {
                log::error!("update check error: {}", e);
                now + CHECK_INITIAL_DELAY
            }
        }
    }

    /// Execute a single command line.
    fn execute_line(&mut self, line: &str, user: &str, mode: &mut RequestMode) -> ExecOutcome {
        let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let cmd = args.first().map(|s| s.to_lowercase()).unwrap_or_default();
        let levels = self.user_levels(user);
        let mut outcome = ExecOutcome {
            text: String::new(),
            disconnect: false,
            user: user.to_string(),
            reload: false,
        };
        if mode.listen == ListenMode::Direct && cmd != "stop" {
            outcome.text = self.execute_direct_line(line, mode);
            return outcome;
        }
        let result = match cmd.as_str() {
            "r" | "read" => self.execute_read(&args, &levels),
            "w" | "write" => self.execute_write(&args, &levels),
            "hex" => self.execute_hex(&args),
            "f" | "find" => self.execute_find(&args, &levels),
            "l" | "listen" => self.execute_listen(&args, mode),
            "direct" => self.execute_direct(&args, mode),
            "state" => self.execute_state(),
            "g" | "grab" => self.execute_grab(&args),
            "def" | "define" => self.execute_define(&args),
            "d" | "decode" => self.execute_decode(&args),
            "e" | "encode" => self.execute_encode(&args),
            "scan" => self.execute_scan(&args, &levels),
            "log" => self.execute_log(&args),
            "raw" => self.execute_raw(&args),
            "dump" => self.execute_dump(&args),
            "reload" => {
                outcome.reload = true;
                self.execute_reload()
            }
            "auth" => match self.execute_auth(&args) {
                Ok(user) => {
                    outcome.user = user;
                    Ok("done".to_string())
                }
                Err(e) => Err(e),
            },
            "i" | "info" => self.execute_info(user),
            "q" | "quit" => {
                outcome.disconnect = true;
                Ok("connection closed".to_string())
            }
            "h" | "help" | "?" => Ok(help_text().to_string()),
            "stop" => {
                mode.listen = ListenMode::None;
                Ok("done".to_string())
            }
            _ => Err(Error::NotFound),
        };
        outcome.text = match result {
            Ok(text) => {
                if text.is_empty() {
                    "done".to_string()
                } else {
                    text
                }
            }
            Err(e) => format!("ERR: {}", e),
        };
        outcome
    }

    /// In direct mode every line is sent as a hex master message.
    fn execute_direct_line(&mut self, line: &str, mode: &mut RequestMode) -> String {
        if line.trim().eq_ignore_ascii_case("stop") {
            mode.listen = ListenMode::None;
            return "direct mode stopped".to_string();
        }
        match self.send_hex(line.trim()) {
            Ok(text) => text,
            Err(e) => format!("ERR: {}", e),
        }
    }

    fn send_hex(&self, text: &str) -> Result<String> {
        let master = MasterFrame::parse_hex_with_source(self.protocol.own_master(), text)?;
        if !is_valid_address(master.destination(), true) {
            return Err(Error::InvalidAddress);
        }
        let slave = self.protocol.send_and_wait(master.clone())?;
        if master.destination() == BROADCAST || is_master(master.destination()) {
            Ok("done".to_string())
        } else {
            Ok(slave.format_hex())
        }
    }

    fn execute_read(&mut self, args: &[String], levels: &str) -> Result<String> {
        let mut pos = 1;
        let mut hex = false;
        let mut verbosity = OutputFormat::NONE;
        let mut max_age = DEFAULT_MAX_AGE;
        let mut circuit = String::new();
        let mut params = String::new();
        let mut src = SYN;
        let mut dst = SYN;
        let mut poll_priority = 0usize;
        while pos < args.len() && args[pos].starts_with('-') {
            match args[pos].as_str() {
                "-h" => hex = true,
                "-f" => max_age = 0,
                "-m" => {
                    pos += 1;
                    max_age = args
                        .get(pos)
                        .and_then(|a| a.parse().ok())
                        .ok_or(Error::InvalidNumber)?;
                }
                "-v" => verbosity |= OutputFormat::NAMES,
                "-vv" => verbosity |= OutputFormat::NAMES | OutputFormat::UNITS,
                "-vvv" | "-V" => {
                    verbosity |= OutputFormat::NAMES | OutputFormat::UNITS | OutputFormat::COMMENTS
                }
                "-n" => verbosity |= OutputFormat::NUMERIC,
                "-N" => verbosity |= OutputFormat::VALUE_NAME,
                "-c" => {
                    pos += 1;
                    circuit = args.get(pos).ok_or(Error::InvalidArgument)?.clone();
                }
                "-s" | "-d" => {
                    let dest = args[pos] == "-d";
                    pos += 1;
                    let address = args
                        .get(pos)
                        .and_then(|a| u8::from_str_radix(a, 16).ok())
                        .ok_or(Error::InvalidAddress)?;
                    if !is_valid_address(address, dest) || (dest == is_master(address)) {
                        return Err(Error::InvalidAddress);
                    }
                    if dest {
                        dst = address;
                    } else {
                        src = address;
                    }
                }
                "-p" => {
                    pos += 1;
                    poll_priority = args
                        .get(pos)
                        .and_then(|a| a.parse().ok())
                        .filter(|p| (1..=9).contains(p))
                        .ok_or(Error::InvalidNumber)?;
                }
                "-i" => {
                    pos += 1;
                    params = args.get(pos).ok_or(Error::InvalidArgument)?.clone();
                }
                _ => return Ok(read_usage().to_string()),
            }
            pos += 1;
        }
        if pos >= args.len() {
            return Ok(read_usage().to_string());
        }
        let now = now_secs();
        if hex {
            let mut text = String::new();
            for arg in &args[pos..] {
                text.push_str(arg);
            }
            let master = MasterFrame::parse_hex_with_source(
                if src == SYN { self.protocol.own_master() } else { src },
                &text,
            )?;
            if master.destination() == BROADCAST || is_master(master.destination()) {
                return Err(Error::InvalidArgument);
            }
            log::info!("read hex cmd: {}", master);
            let (index, cached) = {
                let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
                let index = catalog.find_by_frame(&master).ok_or(Error::NotFound)?;
                let message = catalog.get(index).ok_or(Error::NotFound)?;
                if !message.has_level(levels) {
                    return Err(Error::NotAuthorized);
                }
                if message.direction.is_write() {
                    return Err(Error::InvalidArgument);
                }
                if !circuit.is_empty() && !message.circuit.eq_ignore_ascii_case(&circuit) {
                    return Err(Error::InvalidArgument);
                }
                let fresh = message.last_update_time() + max_age > now
                    || (message.direction.is_passive() && message.last_update_time() != 0);
                let cached = if src == SYN && fresh {
                    Some(message.last_slave_data().format_hex())
                } else {
                    None
                };
                (index, cached)
            };
            if let Some(cached) = cached {
                return Ok(cached);
            }
            let slave = self.protocol.send_and_wait(master.clone())?;
            let mut catalog = self.bus.catalog().write().unwrap_or_else(|p| p.into_inner());
            let _ = catalog.store_last_data(index, &master, &slave);
            return Ok(slave.format_hex());
        }
        let name = args[pos].clone();
        let field_filter = args.get(pos + 1).map(|field| {
            match field.rsplit_once('.') {
                Some((base, index)) if index.parse::<usize>().is_ok() => {
                    (base.to_string(), index.parse::<isize>().unwrap_or(-1))
                }
                _ => (field.clone(), -1),
            }
        });
        let allow_cache = src == SYN && dst == SYN && max_age > 0 && params.is_empty();
        let (message_index, cached_text) = {
            let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
            let message = catalog.find_by_name(&circuit, &name, levels, false);
            let cache = if allow_cache {
                catalog.find_cache_pendant(&circuit, &name, levels, false)
            } else {
                None
            };
            let best_cache = match (message, cache) {
                (Some(m), Some(c)) => {
                    let m_time = catalog.get(m).map(|x| x.last_update_time()).unwrap_or(0);
                    let c_time = catalog.get(c).map(|x| x.last_update_time()).unwrap_or(0);
                    Some(if m_time > c_time { m } else { c })
                }
                (Some(m), None) if allow_cache => Some(m),
                (None, Some(c)) => Some(c),
                _ => None,
            };
            let cached_text = best_cache.and_then(|index| {
                let cached = catalog.get(index)?;
                let fresh = cached.last_update_time() != 0
                    && (cached.last_update_time() + max_age > now
                        || cached.direction.is_passive());
                if !fresh {
                    return None;
                }
                let mut out = String::new();
                if verbosity.contains(OutputFormat::NAMES) {
                    let _ = write!(out, "{} {} ", cached.circuit, cached.name);
                }
                let filter = field_filter
                    .as_ref()
                    .map(|(field, index)| (field.as_str(), *index));
                match cached.decode_last_data(filter, verbosity, &mut out) {
                    Ok(()) => Some(Ok(out)),
                    Err(e) => Some(Err(e)),
                }
            });
            (message, cached_text)
        };
        if poll_priority > 0 {
            if let Some(index) = message_index {
                let mut catalog = self.bus.catalog().write().unwrap_or_else(|p| p.into_inner());
                if let Some(message) = catalog.get_mut(index) {
                    message.set_poll_priority(poll_priority);
                }
            }
        }
        if let Some(cached) = cached_text {
            let text = cached?;
            log::info!("read {} cached: {}", name, text);
            return Ok(text);
        }
        let index = message_index.ok_or(Error::NotFound)?;
        {
            let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
            let message = catalog.get(index).ok_or(Error::NotFound)?;
            if message.dst == SYN && dst == SYN {
                return Err(Error::InvalidAddress);
            }
        }
        self.bus.read_from_bus(index, &params, dst, src)?;
        let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
        let message = catalog.get(index).ok_or(Error::NotFound)?;
        let mut out = String::new();
        if verbosity.contains(OutputFormat::NAMES) {
            let _ = write!(out, "{} {} ", message.circuit, message.name);
        }
        let filter = field_filter
            .as_ref()
            .map(|(field, index)| (field.as_str(), *index));
        message.decode_last_data(filter, verbosity, &mut out)?;
        log::info!("read {} {}: {}", message.circuit, message.name, out);
        Ok(out)
    }

    fn execute_write(&mut self, args: &[String], levels: &str) -> Result<String> {
        let mut pos = 1;
        let mut hex = false;
        let mut circuit = String::new();
        let mut src = SYN;
        let mut dst = SYN;
        while pos < args.len() && args[pos].starts_with('-') {
            match args[pos].as_str() {
                "-h" => hex = true,
                "-c" => {
                    pos += 1;
                    circuit = args.get(pos).ok_or(Error::InvalidArgument)?.clone();
                }
                "-s" | "-d" => {
                    let dest = args[pos] == "-d";
                    pos += 1;
                    let address = args
                        .get(pos)
                        .and_then(|a| u8::from_str_radix(a, 16).ok())
                        .ok_or(Error::InvalidAddress)?;
                    if !is_valid_address(address, dest) || (!dest && !is_master(address)) {
                        return Err(Error::InvalidAddress);
                    }
                    if dest {
                        dst = address;
                    } else {
                        src = address;
                    }
                }
                _ => return Ok(write_usage().to_string()),
            }
            pos += 1;
        }
        if hex {
            let mut text = String::new();
            for arg in &args[pos..] {
                text.push_str(arg);
            }
            if text.is_empty() {
                return Ok(write_usage().to_string());
            }
            return self.send_hex(&text);
        }
        if pos >= args.len() || circuit.is_empty() {
            return Ok(write_usage().to_string());
        }
        let name = args[pos].clone();
        let value = args.get(pos + 1).cloned().unwrap_or_default();
        let index = {
            let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
            let index = catalog
                .find_by_name(&circuit, &name, levels, true)
                .ok_or(Error::NotFound)?;
            let message = catalog.get(index).ok_or(Error::NotFound)?;
            if message.dst == SYN && dst == SYN {
                return Err(Error::InvalidAddress);
            }
            index
        };
        self.bus.read_from_bus(index, &value, dst, src)?;
        let text = {
            let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
            let message = catalog.get(index).ok_or(Error::NotFound)?;
            let mut out = String::new();
            let _ = message.decode_last_data(None, OutputFormat::NONE, &mut out);
            out
        };
        // the read pendant may alias the written value
        {
            let mut catalog = self.bus.catalog().write().unwrap_or_else(|p| p.into_inner());
            catalog.invalidate_cache(index);
        }
        log::info!("write {} {}: {}", circuit, name, if text.is_empty() { "done" } else { &text });
        Ok(text)
    }

    fn execute_hex(&mut self, args: &[String]) -> Result<String> {
        if !self.config.enable_hex {
            return Err(Error::NotAuthorized);
        }
        if args.len() < 2 {
            return Ok("usage: hex ZZPBSBNN[DD]*\n Send arbitrary data in hex.".to_string());
        }
        let mut text = String::new();
        for arg in &args[1..] {
            text.push_str(arg);
        }
        self.send_hex(&text)
    }

    fn execute_find(&mut self, args: &[String], levels: &str) -> Result<String> {
        let mut pos = 1;
        let mut with_read = true;
        let mut with_write = true;
        let mut with_passive = true;
        let mut only_with_data = false;
        let mut circuit = String::new();
        let mut format = OutputFormat::NONE;
        while pos < args.len() && args[pos].starts_with('-') {
            match args[pos].as_str() {
                "-r" => {
                    with_write = false;
                    with_passive = false;
                }
                "-w" => {
                    with_read = false;
                    with_passive = false;
                }
                "-p" => {
                    with_read = false;
                    with_write = false;
                }
                "-d" => only_with_data = true,
                "-v" => format |= OutputFormat::NAMES,
                "-c" => {
                    pos += 1;
                    circuit = args.get(pos).ok_or(Error::InvalidArgument)?.clone();
                }
                _ => {
                    return Ok(
                        "usage: find [-r] [-w] [-p] [-d] [-c CIRCUIT] [NAME]\n Find message(s)."
                            .to_string(),
                    )
                }
            }
            pos += 1;
        }
        let name = args.get(pos).cloned().unwrap_or_default();
        let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
        let mut options = FindOptions::all();
        options.circuit = circuit;
        options.name = name;
        options.levels = levels.to_string();
        options.with_read = with_read;
        options.with_write = with_write;
        options.with_passive = with_passive;
        options.only_with_data = only_with_data;
        options.only_available = true;
        let mut out = String::new();
        for index in catalog.find_all(&options) {
            let message = match catalog.get(index) {
                Some(message) => message,
                None => continue,
            };
            if message.is_scan_message() && message.last_update_time() == 0 {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = write!(out, "{} {} = ", message.circuit, message.name);
            if message.last_update_time() == 0 {
                out.push_str("no data stored");
            } else {
                let mut value = String::new();
                match message.decode_last_data(None, format, &mut value) {
                    Ok(()) => out.push_str(&value),
                    Err(e) => {
                        let _ = write!(out, "unable to decode: {}", e);
                    }
                }
            }
        }
        if out.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(out)
    }

    fn execute_listen(&mut self, args: &[String], mode: &mut RequestMode) -> Result<String> {
        let mut format = OutputFormat::NONE;
        let mut with_unknown = false;
        let mut only_unknown = false;
        let mut stop = false;
        for arg in &args[1..] {
            match arg.as_str() {
                "-v" => format |= OutputFormat::NAMES,
                "-vv" => format |= OutputFormat::NAMES | OutputFormat::UNITS,
                "-vvv" | "-V" => {
                    format |= OutputFormat::NAMES | OutputFormat::UNITS | OutputFormat::COMMENTS
                }
                "-n" => format |= OutputFormat::NUMERIC,
                "-N" => format |= OutputFormat::VALUE_NAME,
                "-u" => with_unknown = true,
                "-U" => only_unknown = true,
                "stop" => stop = true,
                _ => {
                    return Ok(
                        "usage: listen [-v|-V] [-n|-N] [-u|-U] [stop]\n Listen for updates."
                            .to_string(),
                    )
                }
            }
        }
        if stop {
            mode.listen = ListenMode::None;
            return Ok("listen stopped".to_string());
        }
        mode.listen = ListenMode::Listen;
        mode.format = format;
        mode.with_unknown = with_unknown;
        mode.only_unknown = only_unknown;
        Ok("listen started".to_string())
    }

    fn execute_direct(&mut self, args: &[String], mode: &mut RequestMode) -> Result<String> {
        if args.len() > 1 && args[1] == "stop" {
            mode.listen = ListenMode::None;
            return Ok("direct mode stopped".to_string());
        }
        if !self.config.enable_hex {
            return Err(Error::NotAuthorized);
        }
        mode.listen = ListenMode::Direct;
        Ok("direct mode started".to_string())
    }

    fn execute_state(&mut self) -> Result<String> {
        if self.protocol.has_signal() {
            Ok(format!(
                "signal acquired, {} symbols/sec ({} max), {} reconnects",
                self.protocol.symbol_rate(),
                self.protocol.max_symbol_rate(),
                self.reconnect_count
            ))
        } else {
            Ok("no signal".to_string())
        }
    }

    fn execute_grab(&mut self, args: &[String]) -> Result<String> {
        match args.get(1).map(String::as_str) {
            None => {
                if self.bus.enable_grab(true) {
                    Ok("done".to_string())
                } else {
                    Err(Error::Duplicate)
                }
            }
            Some("stop") => {
                if self.bus.enable_grab(false) {
                    Ok("done".to_string())
                } else {
                    Err(Error::Duplicate)
                }
            }
            Some("result") => {
                let mut all = false;
                let mut decode = false;
                for arg in &args[2..] {
                    match arg.as_str() {
                        "all" => all = true,
                        "decode" => decode = true,
                        _ => return Ok(grab_usage().to_string()),
                    }
                }
                Ok(self.bus.format_grab_result(!all, false, 0, 0, decode))
            }
            _ => Ok(grab_usage().to_string()),
        }
    }

    fn execute_define(&mut self, args: &[String]) -> Result<String> {
        if !self.config.enable_define {
            return Err(Error::NotAuthorized);
        }
        if args.len() < 2 {
            return Ok("usage: define DEFINITION\n Define a new message.".to_string());
        }
        let definition = args[1..].join(" ");
        let templates = self.scan_helper.templates_for("").clone();
        let mut catalog = self.bus.catalog().write().unwrap_or_else(|p| p.into_inner());
        filereader::load_definitions(&mut catalog, &templates, &definition, "define", None)?;
        Ok("done".to_string())
    }

    fn parse_field_specs(&self, spec: &str) -> Result<FieldList> {
        let catalog = self.bus.catalog().read().unwrap_or_else(|p| p.into_inner());
        let types = catalog.types();
        let mut fields = FieldList::default();
        for (i, part) in spec.split(';').enumerate() {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (type_spec, length) = match part.split_once(':') {
                Some((base, len)) => (base, Some(len.parse().map_err(|_| Error::InvalidNumber)?)),
                None => (part, None),
            };
            let data_type = types.get(type_spec).ok_or(Error::NotFound)?;
            let field = Field::new(
                &format!("field{}", i),
                PartType::SlaveData,
                data_type,
                length,
                0,
                Default::default(),
                "",
                "",
            )?;
            fields.push(field);
        }
        if fields.is_empty() {
            return Err(Error::InvalidArgument);
        }
        Ok(fields)
    }

    fn execute_decode(&mut self, args: &[String]) -> Result<String> {
        if args.len() < 3 {
            return Ok("usage: decode DEFINITION DD[DD]*\n Decode field(s) from hex data.".to_string());
        }
        let fields = self.parse_field_specs(&args[1])?;
        let data = args[2..].join("");
        let mut bytes = Vec::new();
        let data: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        if data.len() % 2 != 0 {
            return Err(Error::InvalidArgument);
        }
        for i in (0..data.len()).step_by(2) {
            bytes.push(u8::from_str_radix(&data[i..i + 2], 16).map_err(|_| Error::InvalidArgument)?);
        }
        let mut out = String::new();
        fields.decode(&[], &bytes, None, OutputFormat::NONE, &mut out)?;
        Ok(out)
    }

    fn execute_encode(&mut self, args: &[String]) -> Result<String> {
        if args.len() < 3 {
            return Ok("usage: encode DEFINITION VALUE[;VALUE]*\n Encode field(s) to hex data.".to_string());
        }
        let fields = self.parse_field_specs(&args[1])?;
        let mut bytes = Vec::new();
        fields.encode(PartType::SlaveData, &args[2..].join(" "), &mut bytes)?;
        let mut out = String::new();
        for byte in bytes {
            let _ = write!(out, "{:02x}", byte);
        }
        Ok(out)
    }

    fn execute_scan(&mut self, args: &[String], levels: &str) -> Result<String> {
        match args.get(1).map(String::as_str) {
            None => {
                self.bus.start_scan(false, levels)?;
                Ok("scan initiated".to_string())
            }
            Some("full") => {
                self.bus.start_scan(true, levels)?;
                Ok("scan initiated".to_string())
            }
            Some("result") => match self.scan_status {
                ScanStatus::None if self.bus.running_scans() == 0 => {
                    Ok(self.bus.format_scan_results())
                }
                _ => Ok(self.bus.format_scan_results()),
            },
            Some(addr) => {
                let address = u8::from_str_radix(addr, 16).map_err(|_| Error::InvalidAddress)?;
                self.bus.scan_and_wait(address, true)?;
                self.bus
                    .format_scan_result_for(address)
                    .ok_or(Error::NotFound)
            }
        }
    }

    fn execute_log(&mut self, args: &[String]) -> Result<String> {
        match args.get(1) {
            None => Ok(format!("{}", log::max_level())),
            Some(level) => {
                let filter = match level.to_lowercase().as_str() {
                    "error" => log::LevelFilter::Error,
                    "warn" => log::LevelFilter::Warn,
                    "notice" | "info" => log::LevelFilter::Info,
                    "debug" => log::LevelFilter::Debug,
                    "trace" => log::LevelFilter::Trace,
                    "none" | "off" => log::LevelFilter::Off,
                    _ => return Err(Error::InvalidArgument),
                };
                log::set_max_level(filter);
                Ok("done".to_string())
            }
        }
    }

    fn execute_raw(&mut self, _args: &[String]) -> Result<String> {
        let enable = !self.protocol.is_log_raw();
        self.protocol.set_log_raw(enable);
        Ok(if enable { "raw output enabled" } else { "raw output disabled" }.to_string())
    }

    fn execute_dump(&mut self, args: &[String]) -> Result<String> {
        let stop = args.get(1).map(String::as_str) == Some("stop")
            || (args.len() == 1 && self.dump_active);
        if stop {
            self.protocol.set_dump(None, 0)?;
            self.dump_active = false;
            return Ok("dump stopped".to_string());
        }
        let path = self
            .config
            .dump_file
            .clone()
            .ok_or(Error::InvalidArgument)?;
        self.protocol.set_dump(Some(&path), self.config.dump_size)?;
        self.dump_active = true;
        Ok("dump started".to_string())
    }

    fn execute_reload(&mut self) -> Result<String> {
        self.scan_helper.load_config_files()?;
        Ok("done".to_string())
    }

    fn execute_auth(&mut self, args: &[String]) -> Result<String> {
        if args.len() != 3 {
            return Err(Error::InvalidArgument);
        }
        let entry = self.config.users.get(&args[1]).ok_or(Error::NotAuthorized)?;
        if entry.secret != args[2] {
            return Err(Error::NotAuthorized);
        }
        Ok(args[1].clone())
    }

    fn execute_info(&mut self, user: &str) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(out, "version: ebusd {}", env!("CARGO_PKG_VERSION"));
        if !self.update_result.is_empty() {
            let _ = writeln!(out, "update check: {}", self.update_result);
        }
        if self.protocol.has_signal() {
            let _ = writeln!(out, "signal: acquired");
            let _ = writeln!(out, "symbol rate: {}", self.protocol.symbol_rate());
            let _ = writeln!(out, "max symbol rate: {}", self.protocol.max_symbol_rate());
        } else {
            let _ = writeln!(out, "signal: no signal");
        }
        let _ = writeln!(out, "reconnects: {}", self.reconnect_count);
        let _ = writeln!(out, "masters: {}", self.bus.masters_seen());
        let messages = self
            .bus
            .catalog()
            .read()
            .map(|c| c.len())
            .unwrap_or(0);
        let _ = writeln!(out, "messages: {}", messages);
        if !user.is_empty() {
            let _ = writeln!(out, "user: {}", user);
        }
        out.push_str(&self.bus.format_seen_info());
        Ok(out)
    }
}

fn read_usage() -> &'static str {
    "usage: read [-f] [-m SECONDS] [-s QQ] [-d ZZ] [-c CIRCUIT] [-p PRIO] [-v|-V] [-n|-N] [-i VALUE[;VALUE]*] NAME [FIELD[.N]]\n\
     \x20 or:  read [-f] [-m SECONDS] [-s QQ] [-c CIRCUIT] -h ZZPBSBNN[DD]*\n\
     \x20Read value(s) or hex message."
}

fn write_usage() -> &'static str {
    "usage: write [-s QQ] [-d ZZ] -c CIRCUIT NAME [VALUE[;VALUE]*]\n\
     \x20 or:  write [-s QQ] -h ZZPBSBNN[DD]*\n\
     \x20Write value(s) or hex message."
}

fn grab_usage() -> &'static str {
    "usage: grab [stop]\n\
     \x20 or:  grab result [all] [decode]\n\
     \x20Grab messages; decode dumps the data with every known field type."
}

fn help_text() -> &'static str {
    "usage:\n\
     \x20read|r    Read value(s):         read [-f] [-m SECONDS] [-c CIRCUIT] NAME [FIELD[.N]]\n\
     \x20write|w   Write value(s):        write -c CIRCUIT NAME [VALUE[;VALUE]*]\n\
     \x20hex       Send hex data:         hex ZZPBSBNN[DD]*\n\
     \x20find|f    Find message(s):       find [-r] [-w] [-p] [-d] [-c CIRCUIT] [NAME]\n\
     \x20listen|l  Listen for updates:    listen [-v|-V] [-n|-N] [-u|-U] [stop]\n\
     \x20direct    Enter direct mode:     direct [stop]\n\
     \x20state     Report bus state\n\
     \x20grab|g    Grab messages:         grab [stop]  /  grab result [all] [decode]\n\
     \x20define    Define a new message:  define DEFINITION\n\
     \x20decode|d  Decode field(s):       decode DEFINITION DD[DD]*\n\
     \x20encode|e  Encode field(s):       encode DEFINITION VALUE[;VALUE]*\n\
     \x20scan      Scan slaves:           scan [full|ZZ|result]\n\
     \x20log       Set log level:         log [LEVEL]\n\
     \x20raw       Toggle raw logging\n\
     \x20dump      Toggle dump file:      dump [stop]\n\
     \x20reload    Reload configuration\n\
     \x20auth      Authenticate:          auth USER SECRET\n\
     \x20info|i    Report daemon state\n\
     \x20quit|q    Close connection\n\
     \x20help|h    Print help"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_list_parsing() {
        let users = parse_access_list("# comment\ninstaller:secret:install;service\n\nbad\n");
        assert_eq!(users.len(), 2);
        let entry = &users["installer"];
        assert_eq!(entry.secret, "secret");
        assert_eq!(entry.levels, "install;service");
        assert!(users.contains_key("bad"));
    }
}
