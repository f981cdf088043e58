//! Message definitions and the in-memory catalog.

use crate::{
    data::{Field, FieldList, PartType},
    manufacturer::manufacturer_values,
    symbol::{self, MasterFrame, SlaveFrame, BROADCAST, MAX_DATA_LEN, SYN},
    DataTypeList, Error, OutputFormat, Result,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Seconds since the epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Transfer direction of a message definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    PassiveRead,
    PassiveWrite,
    Scan,
}

impl Direction {
    pub fn is_write(self) -> bool {
        matches!(self, Direction::Write | Direction::PassiveWrite)
    }

    pub fn is_passive(self) -> bool {
        matches!(self, Direction::PassiveRead | Direction::PassiveWrite)
    }

    /// Parse a type token like `r`, `r5`, `w`, `u`, `uw` or `scan`,
    /// returning the direction and the poll priority.
    pub fn parse(token: &str) -> Result<(Self, usize)> {
        let token = token.trim().to_lowercase();
        match token.as_str() {
            "r" => Ok((Direction::Read, 0)),
            "w" => Ok((Direction::Write, 0)),
            "u" => Ok((Direction::PassiveRead, 0)),
            "uw" => Ok((Direction::PassiveWrite, 0)),
            "scan" => Ok((Direction::Scan, 0)),
            _ => {
                if let Some(prio) = token.strip_prefix('r') {
                    let prio: usize = prio.parse().map_err(|_| Error::InvalidArgument)?;
                    if !(1..=9).contains(&prio) {
                        return Err(Error::OutOfRange);
                    }
                    return Ok((Direction::Read, prio));
                }
                Err(Error::InvalidArgument)
            }
        }
    }
}

/// Fingerprint of an observed master frame: destination, command bytes
/// and the first data bytes (one for broadcast, up to four otherwise).
pub fn frame_key(frame: &MasterFrame) -> u64 {
    let max = if frame.destination() == BROADCAST { 1 } else { 4 };
    let count = max.min(frame.data_size());
    let mut key = (count as u64) << 56
        | (frame.destination() as u64) << 48
        | (frame.primary() as u64) << 40
        | (frame.secondary() as u64) << 32;
    for i in 0..count {
        key |= (frame.data_at(i) as u64) << (24 - 8 * i);
    }
    key
}

/// One message definition with its last-value cache.
#[derive(Debug, Clone)]
pub struct Message {
    pub circuit: String,
    pub name: String,
    pub direction: Direction,
    pub level: String,
    pub comment: String,
    /// Source address filter, `SYN` for any master.
    pub src: u8,
    /// Destination address filter, `SYN` for any.
    pub dst: u8,
    /// Command bytes: PB SB plus further id bytes.
    id: Vec<u8>,
    pub fields: FieldList,
    pub poll_priority: usize,
    /// Index of the gating condition, if any.
    pub condition: Option<usize>,
    /// Whether the definition is currently active.
    pub available: bool,
    index: usize,
    last_master: MasterFrame,
    last_slave: SlaveFrame,
    create_time: u64,
    last_update_time: u64,
    last_change_time: u64,
    last_poll_time: u64,
    update_count: u64,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        circuit: &str,
        name: &str,
        direction: Direction,
        level: &str,
        src: u8,
        dst: u8,
        id: Vec<u8>,
        fields: FieldList,
    ) -> Result<Self> {
        if id.len() < 2 || id.len() - 2 > MAX_DATA_LEN {
            return Err(Error::InvalidArgument);
        }
        if src != SYN && !symbol::is_master(src) {
            return Err(Error::InvalidAddress);
        }
        if dst != SYN && !symbol::is_valid_address(dst, true) {
            return Err(Error::InvalidAddress);
        }
        Ok(Self {
            circuit: circuit.into(),
            name: name.into(),
            direction,
            level: level.into(),
            comment: String::new(),
            src,
            dst,
            id,
            fields,
            poll_priority: 0,
            condition: None,
            available: true,
            index: 0,
            last_master: MasterFrame::new(),
            last_slave: SlaveFrame::new(),
            create_time: now_secs(),
            last_update_time: 0,
            last_change_time: 0,
            last_poll_time: 0,
            update_count: 0,
        })
    }

    pub fn primary(&self) -> u8 {
        self.id[0]
    }

    pub fn secondary(&self) -> u8 {
        self.id[1]
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// The id bytes past PB SB.
    pub fn id_data(&self) -> &[u8] {
        &self.id[2..]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_scan_message(&self) -> bool {
        self.direction == Direction::Scan
    }

    /// Check the semicolon separated access levels against the message
    /// level. An empty message level is unrestricted, `*` matches any.
    pub fn has_level(&self, levels: &str) -> bool {
        if self.level.is_empty() {
            return true;
        }
        levels
            .split(';')
            .any(|token| token == "*" || token.eq_ignore_ascii_case(&self.level))
    }

    /// Whether the wire bytes of the frame select this definition.
    pub fn matches_frame(&self, frame: &MasterFrame) -> bool {
        if frame.primary() != self.primary() || frame.secondary() != self.secondary() {
            return false;
        }
        if self.src != SYN && self.src != frame.source() {
            return false;
        }
        if self.dst != SYN && self.dst != frame.destination() {
            return false;
        }
        let id_data = self.id_data();
        if frame.data_size() < id_data.len() {
            return false;
        }
        frame.data().starts_with(id_data)
    }

    /// Build the master frame for sending this message.
    pub fn prepare_master(&self, own_master: u8, dst_override: u8, input: &str) -> Result<MasterFrame> {
        let src = if self.src == SYN { own_master } else { self.src };
        let dst = if dst_override != SYN { dst_override } else { self.dst };
        if dst == SYN {
            return Err(Error::InvalidAddress);
        }
        if !symbol::is_master(src) {
            return Err(Error::InvalidAddress);
        }
        let mut master = MasterFrame::new();
        master.push(src);
        master.push(dst);
        master.push(self.primary());
        master.push(self.secondary());
        master.push(0);
        for &sym in self.id_data() {
            master.push(sym);
        }
        let mut data = Vec::new();
        self.fields.encode(PartType::MasterData, input, &mut data)?;
        for sym in data {
            master.push(sym);
        }
        master.adjust_header();
        if master.data_size() > MAX_DATA_LEN {
            return Err(Error::OutOfRange);
        }
        Ok(master)
    }

    /// Store the observed frames, advancing the update and change times.
    pub fn store_last_data(&mut self, master: &MasterFrame, slave: &SlaveFrame) -> Result<()> {
        self.store_last_data_at(master, slave, now_secs())
    }

    pub fn store_last_data_at(
        &mut self,
        master: &MasterFrame,
        slave: &SlaveFrame,
        now: u64,
    ) -> Result<()> {
        if !master.is_empty() && !master.is_complete() {
            return Err(Error::InvalidArgument);
        }
        if !slave.is_empty() && !slave.is_complete() {
            return Err(Error::InvalidArgument);
        }
        let changed = self.last_update_time == 0
            || self.last_master.data() != master.data()
            || self.last_slave.data() != slave.data();
        self.last_master = master.clone();
        self.last_slave = slave.clone();
        self.last_update_time = now;
        if changed {
            self.last_change_time = now;
        }
        self.update_count += 1;
        Ok(())
    }

    /// Render the cached bytes through the field list.
    pub fn decode_last_data(
        &self,
        field_filter: Option<(&str, isize)>,
        format: OutputFormat,
        out: &mut String,
    ) -> Result<()> {
        if self.last_update_time == 0 {
            return Err(Error::NotFound);
        }
        self.fields.decode(
            self.last_master.data(),
            self.last_slave.data(),
            field_filter,
            format,
            out,
        )
    }

    pub fn last_master_data(&self) -> &MasterFrame {
        &self.last_master
    }

    pub fn last_slave_data(&self) -> &SlaveFrame {
        &self.last_slave
    }

    pub fn create_time(&self) -> u64 {
        self.create_time
    }

    pub fn last_update_time(&self) -> u64 {
        self.last_update_time
    }

    pub fn last_change_time(&self) -> u64 {
        self.last_change_time
    }

    pub fn last_poll_time(&self) -> u64 {
        self.last_poll_time
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Drop the cached data so the next read goes to the bus.
    pub fn invalidate(&mut self) {
        self.last_update_time = 0;
    }

    /// Change the poll priority, returning whether it changed.
    pub fn set_poll_priority(&mut self, priority: usize) -> bool {
        if priority == self.poll_priority || priority > 9 {
            return false;
        }
        self.poll_priority = priority;
        true
    }

    /// Clone this definition for a concrete destination address.
    pub fn derive(&self, dst: u8) -> Result<Self> {
        if !symbol::is_valid_address(dst, true) {
            return Err(Error::InvalidAddress);
        }
        let mut derived = self.clone();
        derived.dst = dst;
        derived.last_master = MasterFrame::new();
        derived.last_slave = SlaveFrame::new();
        derived.create_time = now_secs();
        derived.last_update_time = 0;
        derived.last_change_time = 0;
        derived.last_poll_time = 0;
        derived.update_count = 0;
        Ok(derived)
    }
}

/// A boolean condition gating a message definition's activity.
#[derive(Debug, Clone)]
pub struct Condition {
    pub name: String,
    pub circuit: String,
    pub message: String,
    pub field: String,
    /// Accepted numeric ranges; empty means "has data at all".
    pub ranges: Vec<(i64, i64)>,
    pub string_values: Vec<String>,
    pub active: bool,
}

impl Condition {
    pub fn new(name: &str, circuit: &str, message: &str, field: &str, values: &str) -> Result<Self> {
        let mut ranges = Vec::new();
        let mut string_values = Vec::new();
        for token in values.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some((from, to)) = token.split_once('-').and_then(|(a, b)| {
                a.trim().parse::<i64>().ok().zip(b.trim().parse::<i64>().ok())
            }) {
                ranges.push((from, to));
            } else if let Ok(value) = token.parse::<i64>() {
                ranges.push((value, value));
            } else {
                string_values.push(token.to_string());
            }
        }
        Ok(Self {
            name: name.into(),
            circuit: circuit.into(),
            message: message.into(),
            field: field.into(),
            ranges,
            string_values,
            active: false,
        })
    }
}

/// A deferred on-load instruction.
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Read the message from the bus once after loading.
    Read { circuit: String, name: String },
}

/// Options for walking the catalog.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub circuit: String,
    pub name: String,
    pub levels: String,
    pub with_read: bool,
    pub with_write: bool,
    pub with_passive: bool,
    pub only_available: bool,
    /// Only messages updated at or after this time (0 for all).
    pub updated_since: u64,
    /// Only messages updated before this time (0 for all).
    pub updated_until: u64,
    pub only_with_data: bool,
}

impl FindOptions {
    pub fn all() -> Self {
        Self {
            levels: "*".into(),
            with_read: true,
            with_write: true,
            with_passive: true,
            ..Self::default()
        }
    }
}

/// In-memory registry of message definitions with the last-value cache.
#[derive(Debug)]
pub struct MessageCatalog {
    types: Arc<DataTypeList>,
    messages: Vec<Message>,
    by_pbsb: HashMap<(u8, u8), Vec<usize>>,
    by_name: HashMap<(String, String, bool), Vec<usize>>,
    conditions: Vec<Condition>,
    instructions: Vec<Instruction>,
    scan_message: usize,
    scan_by_addr: HashMap<u8, usize>,
    poll_tick: u64,
    loaded_files: Vec<(String, String)>,
    loaded_by_addr: HashMap<u8, Vec<String>>,
    conditions_dirty: bool,
}

impl MessageCatalog {
    pub fn new(types: Arc<DataTypeList>) -> Self {
        let mut catalog = Self {
            types,
            messages: Vec::new(),
            by_pbsb: HashMap::new(),
            by_name: HashMap::new(),
            conditions: Vec::new(),
            instructions: Vec::new(),
            scan_message: 0,
            scan_by_addr: HashMap::new(),
            poll_tick: 0,
            loaded_files: Vec::new(),
            loaded_by_addr: HashMap::new(),
            conditions_dirty: false,
        };
        catalog.register_scan_message();
        catalog
    }

    pub fn types(&self) -> &Arc<DataTypeList> {
        &self.types
    }

    fn build_scan_message(types: &DataTypeList) -> Result<Message> {
        let mut fields = FieldList::default();
        let manufacturer_map: BTreeMap<u32, String> = manufacturer_values().into_iter().collect();
        let uch = types.get("UCH").ok_or(Error::NotFound)?;
        let str_type = types.get("STR").ok_or(Error::NotFound)?;
        let pin = types.get("PIN").ok_or(Error::NotFound)?;
        for field in [
            Field::new("mf", PartType::SlaveData, uch, None, 0, manufacturer_map, "", "")?,
            Field::new("id", PartType::SlaveData, str_type, Some(5), 0, BTreeMap::new(), "", "")?,
            Field::new("sw", PartType::SlaveData, pin.clone(), None, 0, BTreeMap::new(), "", "")?,
            Field::new("hw", PartType::SlaveData, pin, None, 0, BTreeMap::new(), "", "")?,
        ] {
            fields.push(field);
        }
        Message::new("scan", "id", Direction::Scan, "", SYN, SYN, vec![0x07, 0x04], fields)
    }

    fn register_scan_message(&mut self) {
        self.scan_message = usize::MAX;
        match Self::build_scan_message(&self.types) {
            Ok(message) => {
                if let Ok(index) = self.add_internal(message, true) {
                    self.scan_message = index;
                }
            }
            Err(e) => log::warn!("unable to register scan message: {}", e),
        }
    }

    /// Number of definitions, including derived scan clones.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn poll_count(&self) -> usize {
        self.messages.iter().filter(|m| m.poll_priority > 0).count()
    }

    pub fn passive_count(&self) -> usize {
        self.messages.iter().filter(|m| m.direction.is_passive()).count()
    }

    pub fn conditional_count(&self) -> usize {
        self.messages.iter().filter(|m| m.condition.is_some()).count()
    }

    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Message> {
        self.messages.get_mut(index)
    }

    fn add_internal(&mut self, mut message: Message, allow_scan: bool) -> Result<usize> {
        if message.is_scan_message() && !allow_scan && message.id() == [0x07, 0x04] {
            return Err(Error::Duplicate);
        }
        let name_key = (
            message.circuit.to_lowercase(),
            message.name.to_lowercase(),
            message.direction.is_write(),
        );
        if message.condition.is_none() {
            if let Some(existing) = self.by_name.get(&name_key) {
                let duplicate = existing.iter().any(|&i| {
                    let m = &self.messages[i];
                    m.direction == message.direction && m.condition.is_none() && m.dst == message.dst
                });
                if duplicate {
                    return Err(Error::Duplicate);
                }
            }
        }
        let index = self.messages.len();
        message.index = index;
        if message.condition.is_some() {
            message.available = false;
            self.conditions_dirty = true;
        }
        self.by_pbsb
            .entry((message.primary(), message.secondary()))
            .or_default()
            .push(index);
        self.by_name.entry(name_key).or_default().push(index);
        self.messages.push(message);
        Ok(index)
    }

    /// Register a definition.
    pub fn add(&mut self, message: Message) -> Result<usize> {
        self.add_internal(message, false)
    }

    pub fn add_condition(&mut self, condition: Condition) -> usize {
        self.conditions_dirty = true;
        self.conditions.push(condition);
        self.conditions.len() - 1
    }

    pub fn add_instruction(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Locate the most specific active definition matching the frame.
    ///
    /// Exact source/destination beats "any", a longer id prefix beats a
    /// shorter one, an active conditional beats an unconditional one;
    /// first-loaded wins remaining ties.
    pub fn find_by_frame(&self, frame: &MasterFrame) -> Option<usize> {
        let candidates = self.by_pbsb.get(&(frame.primary(), frame.secondary()))?;
        let mut best: Option<(usize, (u8, usize, bool))> = None;
        for &index in candidates {
            let message = &self.messages[index];
            if !message.available || !message.matches_frame(frame) {
                continue;
            }
            let exact = (message.src != SYN) as u8 + (message.dst != SYN) as u8;
            let score = (exact, message.id_data().len(), message.condition.is_some());
            match &best {
                Some((_, best_score)) if score <= *best_score => {}
                _ => best = Some((index, score)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Textual lookup filtered by access levels.
    pub fn find_by_name(
        &self,
        circuit: &str,
        name: &str,
        levels: &str,
        is_write: bool,
    ) -> Option<usize> {
        self.find_named(circuit, name, levels, is_write, false)
    }

    /// Lookup of the cached pendant: any definition with matching
    /// write-ness that carries data, most recently updated first.
    pub fn find_cache_pendant(
        &self,
        circuit: &str,
        name: &str,
        levels: &str,
        is_write: bool,
    ) -> Option<usize> {
        self.find_named(circuit, name, levels, is_write, true)
    }

    fn find_named(
        &self,
        circuit: &str,
        name: &str,
        levels: &str,
        is_write: bool,
        cached: bool,
    ) -> Option<usize> {
        let mut best: Option<(usize, (bool, bool, u64))> = None;
        for (index, message) in self.messages.iter().enumerate() {
            if message.is_scan_message() && !circuit.eq_ignore_ascii_case("scan") {
                continue;
            }
            if !message.available
                || !message.name.eq_ignore_ascii_case(name)
                || message.direction.is_write() != is_write
                || !message.has_level(levels)
            {
                continue;
            }
            if !circuit.is_empty() && !message.circuit.eq_ignore_ascii_case(circuit) {
                continue;
            }
            if cached && message.last_update_time == 0 {
                continue;
            }
            let score = (
                !circuit.is_empty() || !message.circuit.is_empty(),
                !message.direction.is_passive(),
                if cached { message.last_update_time } else { 0 },
            );
            match &best {
                Some((_, best_score)) if score <= *best_score => {}
                _ => best = Some((index, score)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Walk the catalog with the given filter options.
    pub fn find_all(&self, options: &FindOptions) -> Vec<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                if m.is_scan_message() && !options.circuit.eq_ignore_ascii_case("scan") {
                    return false;
                }
                if !options.circuit.is_empty() && !m.circuit.eq_ignore_ascii_case(&options.circuit) {
                    return false;
                }
                if !options.name.is_empty() && !m.name.eq_ignore_ascii_case(&options.name) {
                    return false;
                }
                if !m.has_level(&options.levels) {
                    return false;
                }
                if options.only_available && !m.available {
                    return false;
                }
                let dir_ok = if m.direction.is_passive() {
                    options.with_passive
                } else if m.direction.is_write() {
                    options.with_write
                } else {
                    options.with_read
                };
                if !dir_ok && !m.is_scan_message() {
                    return false;
                }
                if options.only_with_data && m.last_update_time == 0 {
                    return false;
                }
                if options.updated_since > 0 && m.last_update_time < options.updated_since {
                    return false;
                }
                if options.updated_until > 0 && m.last_update_time >= options.updated_until {
                    return false;
                }
                true
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// The built-in scan pseudo message, optionally specialized to a
    /// destination address.
    pub fn scan_message(&self) -> usize {
        self.scan_message
    }

    pub fn scan_message_for(&mut self, address: u8) -> Result<usize> {
        if let Some(&index) = self.scan_by_addr.get(&address) {
            return Ok(index);
        }
        let derived = self
            .messages
            .get(self.scan_message)
            .ok_or(Error::NotFound)?
            .derive(address)?;
        let index = self.add_internal(derived, true)?;
        self.scan_by_addr.insert(address, index);
        Ok(index)
    }

    /// Whether definitions beyond the built-in ident query exist for the
    /// scan circuit.
    pub fn has_additional_scan_messages(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.is_scan_message() && m.id() != [0x07, 0x04])
    }

    /// Priority-fair poll selection.
    ///
    /// Each call advances the tick; a message with priority P is eligible
    /// every P-th tick, the longest-unpolled eligible message wins.
    pub fn next_poll(&mut self, now: u64) -> Option<usize> {
        self.poll_tick += 1;
        let tick = self.poll_tick;
        let best = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.available && m.poll_priority > 0 && tick % m.poll_priority as u64 == 0
            })
            .min_by_key(|(index, m)| (m.last_poll_time, *index))
            .map(|(index, _)| index)?;
        self.messages[best].last_poll_time = now;
        Some(best)
    }

    /// Store observed frames into the definition's cache.
    pub fn store_last_data(
        &mut self,
        index: usize,
        master: &MasterFrame,
        slave: &SlaveFrame,
    ) -> Result<()> {
        self.conditions_dirty = true;
        self.messages
            .get_mut(index)
            .ok_or(Error::NotFound)?
            .store_last_data(master, slave)
    }

    /// Clear derived caches of aliasing definitions after a write.
    pub fn invalidate_cache(&mut self, index: usize) {
        let (circuit, name) = match self.messages.get(index) {
            Some(m) => (m.circuit.to_lowercase(), m.name.to_lowercase()),
            None => return,
        };
        for message in &mut self.messages {
            if message.index != index
                && message.circuit.to_lowercase() == circuit
                && message.name.to_lowercase() == name
            {
                message.invalidate();
            }
        }
        self.conditions_dirty = true;
    }

    /// Evaluate all conditions against current cache values and adjust
    /// definition availability. Idempotent.
    pub fn resolve_conditions(&mut self) -> Result<()> {
        self.conditions_dirty = false;
        // fixed point, bounded by the condition count
        for _ in 0..=self.conditions.len() {
            let mut changed = false;
            for ci in 0..self.conditions.len() {
                let condition = self.conditions[ci].clone();
                let target = self.find_named(&condition.circuit, &condition.message, "*", false, false);
                let active = match target {
                    None => false,
                    Some(index) => {
                        let message = &self.messages[index];
                        if message.last_update_time == 0 {
                            false
                        } else if condition.ranges.is_empty() && condition.string_values.is_empty() {
                            true
                        } else {
                            let mut value = String::new();
                            let filter = if condition.field.is_empty() {
                                None
                            } else {
                                Some((condition.field.as_str(), -1))
                            };
                            match message.decode_last_data(filter, OutputFormat::NUMERIC, &mut value)
                            {
                                Err(_) => false,
                                Ok(()) => {
                                    let value = value.split(crate::data::FIELD_SEPARATOR).next().unwrap_or("");
                                    if let Ok(number) = value.parse::<f64>() {
                                        condition
                                            .ranges
                                            .iter()
                                            .any(|&(from, to)| number >= from as f64 && number <= to as f64)
                                    } else {
                                        condition.string_values.iter().any(|s| s == value)
                                    }
                                }
                            }
                        }
                    }
                };
                if self.conditions[ci].active != active {
                    self.conditions[ci].active = active;
                    changed = true;
                }
            }
            for message in &mut self.messages {
                if let Some(ci) = message.condition {
                    let active = self.conditions.get(ci).map_or(false, |c| c.active);
                    if message.available != active {
                        message.available = active;
                        changed = true;
                    }
                }
            }
            if !changed {
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn conditions_dirty(&self) -> bool {
        self.conditions_dirty
    }

    /// Process deferred on-load instructions through the callback.
    pub fn execute_instructions<F: FnMut(&str, &str)>(&mut self, mut read: F) -> Result<()> {
        let instructions = std::mem::take(&mut self.instructions);
        for instruction in instructions {
            match instruction {
                Instruction::Read { circuit, name } => read(&circuit, &name),
            }
        }
        Ok(())
    }

    pub fn add_loaded_file(&mut self, address: Option<u8>, file: &str, comment: &str) {
        if let Some(address) = address {
            self.loaded_by_addr
                .entry(address)
                .or_default()
                .push(file.to_string());
        }
        if !self.loaded_files.iter().any(|(f, _)| f == file) {
            self.loaded_files.push((file.to_string(), comment.to_string()));
        }
    }

    pub fn loaded_files(&self) -> &[(String, String)] {
        &self.loaded_files
    }

    pub fn loaded_files_for(&self, address: u8) -> &[String] {
        self.loaded_by_addr
            .get(&address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop all loaded definitions, conditions and caches; the built-in
    /// scan message is re-created.
    pub fn clear(&mut self) {
        let types = self.types.clone();
        *self = Self::new(types);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FIELD_SEPARATOR;

    fn catalog() -> MessageCatalog {
        MessageCatalog::new(Arc::new(DataTypeList::new()))
    }

    fn temp_message(circuit: &str, name: &str, direction: Direction) -> Message {
        let types = DataTypeList::new();
        let field = Field::new(
            "temp",
            PartType::SlaveData,
            types.get("D2C").unwrap(),
            None,
            0,
            BTreeMap::new(),
            "°C",
            "",
        )
        .unwrap();
        Message::new(
            circuit,
            name,
            direction,
            "",
            SYN,
            0x08,
            vec![0xb5, 0x09, 0x0d],
            FieldList::new(vec![field]),
        )
        .unwrap()
    }

    #[test]
    fn store_and_find_by_name() {
        let mut catalog = catalog();
        let index = catalog.add(temp_message("heat", "flow", Direction::Read)).unwrap();
        let master = MasterFrame::parse_hex("3108b509010d").unwrap();
        let slave = SlaveFrame::parse_hex("02410c").unwrap();
        catalog.store_last_data(index, &master, &slave).unwrap();

        let found = catalog.find_by_name("heat", "flow", "*", false).unwrap();
        assert_eq!(found, index);
        let message = catalog.get(found).unwrap();
        assert_eq!(message.last_master_data(), &master);
        assert_eq!(message.last_slave_data(), &slave);
        let mut out = String::new();
        message.decode_last_data(None, OutputFormat::NONE, &mut out).unwrap();
        assert_eq!(out, "196.06");
    }

    #[test]
    fn duplicate_rejected() {
        let mut catalog = catalog();
        catalog.add(temp_message("heat", "flow", Direction::Read)).unwrap();
        assert_eq!(
            catalog.add(temp_message("heat", "flow", Direction::Read)),
            Err(Error::Duplicate)
        );
        // a write pendant is fine
        catalog.add(temp_message("heat", "flow", Direction::Write)).unwrap();
    }

    #[test]
    fn frame_lookup_prefers_specific() {
        let mut catalog = catalog();
        let types = catalog.types().clone();
        let make = |src: u8, dst: u8, id: Vec<u8>| {
            let field = Field::new(
                "x",
                PartType::SlaveData,
                types.get("UCH").unwrap(),
                None,
                0,
                BTreeMap::new(),
                "",
                "",
            )
            .unwrap();
            Message::new(
                "c",
                &format!("m{:02x}{}", dst, id.len()),
                Direction::Read,
                "",
                src,
                dst,
                id,
                FieldList::new(vec![field]),
            )
            .unwrap()
        };
        let any = catalog.add(make(SYN, SYN, vec![0xb5, 0x09])).unwrap();
        let long_id = catalog.add(make(SYN, SYN, vec![0xb5, 0x09, 0x0d])).unwrap();
        let exact_dst = catalog.add(make(SYN, 0x08, vec![0xb5, 0x09])).unwrap();

        let frame = MasterFrame::parse_hex("3108b509010d").unwrap();
        // exact destination beats the longer id
        assert_eq!(catalog.find_by_frame(&frame), Some(exact_dst));

        let frame = MasterFrame::parse_hex("3115b509010d").unwrap();
        // no exact-destination candidate: longer id wins
        assert_eq!(catalog.find_by_frame(&frame), Some(long_id));

        let frame = MasterFrame::parse_hex("3115b5090100").unwrap();
        assert_eq!(catalog.find_by_frame(&frame), Some(any));
    }

    #[test]
    fn poll_rotor_fairness() {
        let mut catalog = catalog();
        let mut a = temp_message("c", "a", Direction::Read);
        a.poll_priority = 1;
        let mut b = temp_message("c", "b", Direction::Read);
        b.poll_priority = 5;
        let a = catalog.add(a).unwrap();
        let b = catalog.add(b).unwrap();

        let mut selected = Vec::new();
        for tick in 1..=25u64 {
            let index = catalog.next_poll(tick).unwrap();
            selected.push((tick, index));
        }
        let b_ticks: Vec<u64> = selected.iter().filter(|(_, i)| *i == b).map(|(t, _)| *t).collect();
        assert_eq!(b_ticks, vec![5, 10, 15, 20, 25]);
        assert!(b_ticks.windows(2).all(|w| w[1] - w[0] >= 5));
        assert_eq!(selected.iter().filter(|(_, i)| *i == a).count(), 20);
    }

    #[test]
    fn scan_message_derivation() {
        let mut catalog = catalog();
        let base = catalog.scan_message();
        let derived = catalog.scan_message_for(0x08).unwrap();
        assert_ne!(base, derived);
        assert_eq!(catalog.scan_message_for(0x08).unwrap(), derived);
        assert_eq!(catalog.get(derived).unwrap().dst, 0x08);

        // ident response decodes manufacturer, id, sw, hw
        let master = MasterFrame::parse_hex("3108070400").unwrap();
        let slave = SlaveFrame::parse_hex("0ab5544950303030010064").unwrap();
        catalog.store_last_data(derived, &master, &slave).unwrap();
        let mut out = String::new();
        catalog
            .get(derived)
            .unwrap()
            .decode_last_data(None, OutputFormat::NONE, &mut out)
            .unwrap();
        let parts: Vec<&str> = out.split(FIELD_SEPARATOR).collect();
        assert_eq!(parts, vec!["Vaillant", "TIP00", "3001", "0064"]);
    }

    #[test]
    fn conditions_gate_availability() {
        let mut catalog = catalog();
        let gate = catalog.add(temp_message("heat", "mode", Direction::PassiveRead)).unwrap();
        let ci = catalog.add_condition(
            Condition::new("hot", "heat", "mode", "", "190-200").unwrap(),
        );
        let mut conditional = temp_message("heat", "flow", Direction::Read);
        conditional.condition = Some(ci);
        let conditional = catalog.add(conditional).unwrap();

        catalog.resolve_conditions().unwrap();
        assert!(!catalog.get(conditional).unwrap().available);

        // 0x0c41/16 = 196.06 -> within 190-200
        let master = MasterFrame::parse_hex("3108b509010d").unwrap();
        let slave = SlaveFrame::parse_hex("02410c").unwrap();
        catalog.store_last_data(gate, &master, &slave).unwrap();
        catalog.resolve_conditions().unwrap();
        assert!(catalog.get(conditional).unwrap().available);

        // out of range again
        let slave = SlaveFrame::parse_hex("020001").unwrap();
        catalog.store_last_data(gate, &master, &slave).unwrap();
        catalog.resolve_conditions().unwrap();
        assert!(!catalog.get(conditional).unwrap().available);
    }

    #[test]
    fn prepare_master_builds_frame() {
        let catalog = catalog();
        let _ = catalog;
        let message = temp_message("heat", "flow", Direction::Read);
        let master = message.prepare_master(0x31, SYN, "").unwrap();
        assert_eq!(master.format_hex(), "3108b509010d");
        assert!(master.is_complete());
    }

    #[test]
    fn invalidate_cache_clears_pendant() {
        let mut catalog = catalog();
        let read = catalog.add(temp_message("heat", "flow", Direction::Read)).unwrap();
        let write = catalog.add(temp_message("heat", "flow", Direction::Write)).unwrap();
        let master = MasterFrame::parse_hex("3108b509010d").unwrap();
        let slave = SlaveFrame::parse_hex("02410c").unwrap();
        catalog.store_last_data(read, &master, &slave).unwrap();
        assert!(catalog.get(read).unwrap().last_update_time() > 0);
        catalog.invalidate_cache(write);
        assert_eq!(catalog.get(read).unwrap().last_update_time(), 0);
    }

    #[test]
    fn frame_key_fingerprint() {
        let frame = MasterFrame::parse_hex("3108b509010d").unwrap();
        let other = MasterFrame::parse_hex("3115b509010d").unwrap();
        assert_ne!(frame_key(&frame), frame_key(&other));
        // broadcast uses a single data byte
        let bc1 = MasterFrame::parse_hex("31fe070402b554").unwrap();
        let bc2 = MasterFrame::parse_hex("31fe070402b555").unwrap();
        assert_eq!(frame_key(&bc1), frame_key(&bc2));
    }
}
