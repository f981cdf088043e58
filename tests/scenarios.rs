//! End to end scenarios driving the protocol state machine, the bus
//! handler and the dispatcher against a scripted device.

use ebus::{
    crc8, now_secs, symbol::push_escaped, DataTypeList, FieldTemplates, MasterFrame,
    MessageCatalog, SlaveFrame,
};
use ebusd::{
    bushandler::{BusHandler, SCAN_DONE, SCAN_INIT, SEEN},
    device::MockDevice,
    mainloop::{Dispatcher, DispatcherConfig},
    protocol::{ProtocolConfig, ProtocolHandler, ProtocolListener},
    queue::Queue,
    request::{NetRequest, RequestMode},
    scan::{LocalSource, ScanHelper},
};
use std::{
    sync::{mpsc::sync_channel, Arc, RwLock},
    thread,
    time::{Duration, Instant},
};

fn wire_bytes(unescaped: &[u8]) -> Vec<u8> {
    let mut wire = Vec::new();
    for &symbol in unescaped {
        push_escaped(&mut wire, symbol);
    }
    push_escaped(&mut wire, crc8(unescaped));
    wire
}

fn slave_reply(unescaped: &[u8]) -> Vec<u8> {
    let mut reply = vec![0x00]; // ACK
    reply.extend(wire_bytes(unescaped));
    reply
}

struct Harness {
    device: MockDevice,
    bus: BusHandler,
    catalog: Arc<RwLock<MessageCatalog>>,
    protocol_thread: Option<thread::JoinHandle<()>>,
}

impl Harness {
    fn new(own_master: u8) -> Self {
        let device = MockDevice::new();
        let catalog = Arc::new(RwLock::new(MessageCatalog::new(Arc::new(
            DataTypeList::new(),
        ))));
        let config = ProtocolConfig {
            own_master,
            ..ProtocolConfig::default()
        };
        let mut protocol = ProtocolHandler::new(Box::new(device.clone()), config);
        let handle = protocol.handle();
        let bus = BusHandler::new(catalog.clone(), handle, 0);
        protocol.set_listener(Box::new(bus.clone()));
        let protocol_thread = thread::spawn(move || protocol.run());
        Self {
            device,
            bus,
            catalog,
            protocol_thread: Some(protocol_thread),
        }
    }

    fn wait_until<F: Fn() -> bool>(&self, what: &str, check: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timeout waiting for {}", what);
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.bus.protocol().shutdown();
        if let Some(thread) = self.protocol_thread.take() {
            thread.join().ok();
        }
    }
}

#[test]
fn scan_ident_single_slave() {
    let harness = Harness::new(0x31);
    harness
        .device
        .push_reply(&slave_reply(&[0x0a, 0xb5, 0x54, 0x49, 0x50, 0x30, 0x30, 0x30, 0x01, 0x00, 0x64]));

    let executed = harness.bus.scan_and_wait(0x08, true).unwrap();
    assert!(executed);

    let flags = harness.bus.seen_flags(0x08);
    assert_eq!(flags & (SEEN | SCAN_INIT | SCAN_DONE), SEEN | SCAN_INIT | SCAN_DONE);
    let results = harness.bus.scan_result(0x08).expect("scan result recorded");
    assert!(!results.is_empty());
    assert_eq!(results[0], "Vaillant;TIP00;3001;0064");

    // the query went out exactly once: arbitration byte plus frame
    let written = harness.device.written();
    assert_eq!(written[0], 0x31);
    assert!(written
        .windows(5)
        .any(|w| w == [0x08, 0x07, 0x04, 0x00, crc8(&[0x31, 0x08, 0x07, 0x04, 0x00])]));
}

#[test]
fn scan_walk_continues_after_timeout() {
    let harness = Harness::new(0x31);
    // mark the slaves as seen so the non-full walk covers them
    let mut listener = harness.bus.clone();
    listener.on_seen_address(0x08);
    listener.on_seen_address(0x15);
    listener.on_seen_address(0x18);

    harness
        .device
        .push_reply(&slave_reply(&[0x0a, 0xb5, 0x54, 0x49, 0x50, 0x30, 0x30, 0x30, 0x01, 0x00, 0x64]));
    harness.device.push_reply(&[]); // 0x15 does not answer
    harness
        .device
        .push_reply(&slave_reply(&[0x0a, 0xb5, 0x45, 0x48, 0x50, 0x30, 0x30, 0x30, 0x02, 0x00, 0x32]));

    harness.bus.start_scan(false, "*").unwrap();
    harness.wait_until("scan walk to finish", || harness.bus.running_scans() == 0);

    assert!(harness.bus.scan_result(0x08).is_some());
    assert!(harness.bus.scan_result(0x18).is_some());
    assert_eq!(harness.bus.seen_flags(0x15) & SCAN_DONE, 0);
    assert_ne!(harness.bus.seen_flags(0x15) & SCAN_INIT, 0);
}

#[test]
fn broadcast_ident_observation() {
    let harness = Harness::new(0xff);
    let frame = wire_bytes(&[
        0x31, 0xfe, 0x07, 0x04, 0x0a, 0xb5, 0x54, 0x49, 0x50, 0x30, 0x30, 0x30, 0x01, 0x00, 0x64,
    ]);
    harness.device.push_incoming(&frame);

    // the derived slave address of master 0x31 is 0x36
    harness.wait_until("broadcast ident to be stored", || {
        harness.bus.seen_flags(0x36) & SCAN_DONE != 0
    });
    assert_ne!(harness.bus.seen_flags(0x31) & SEEN, 0);
    assert_ne!(harness.bus.seen_flags(0x36) & SEEN, 0);
    let results = harness.bus.scan_result(0x36).expect("scan result recorded");
    assert_eq!(results[0], "Vaillant;TIP00;3001;0064");
    // observation only, nothing was emitted on the bus
    assert!(harness.device.written().is_empty());
}

#[test]
fn arbitration_retry_completes_request() {
    let harness = Harness::new(0xff);
    harness.device.push_arbitration_loss(0x10);
    harness.device.push_arbitration_loss(0x10);
    harness.device.push_reply(&slave_reply(&[0x01, 0x42]));

    harness.wait_until("signal", || harness.bus.protocol().has_signal());
    let master = MasterFrame::parse_hex("ff08070400").unwrap();
    let slave = harness.bus.protocol().send_and_wait(master).unwrap();
    assert_eq!(slave.format_hex(), "0142");
    assert_eq!(slave.data(), &[0x42]);

    // three arbitration attempts were needed
    let written = harness.device.written();
    let attempts = written.iter().filter(|&&b| b == 0xff).count();
    assert!(attempts >= 3);
}

#[test]
fn cached_read_answers_without_bus_traffic() {
    let harness = Harness::new(0x31);
    // define the message and store its last value
    {
        let mut catalog = harness.catalog.write().unwrap();
        let templates = FieldTemplates::new();
        ebus::filereader::load_definitions(
            &mut catalog,
            &templates,
            "r,heat,,flow,,,08,b509,0d,temp,s,D2C,,°C,\n",
            "test.csv",
            None,
        )
        .unwrap();
        let index = catalog.find_by_name("heat", "flow", "*", false).unwrap();
        let master = MasterFrame::parse_hex("3108b509010d").unwrap();
        let slave = SlaveFrame::parse_hex("02410c").unwrap();
        catalog.store_last_data(index, &master, &slave).unwrap();
    }
    let queue = Arc::new(Queue::new());
    let scan_helper = ScanHelper::new(
        harness.catalog.clone(),
        Box::new(LocalSource::new("/nonexistent")),
        false,
    );
    let mut dispatcher = Dispatcher::new(
        harness.bus.clone(),
        scan_helper,
        queue.clone(),
        DispatcherConfig::default(),
    );
    let dispatcher_thread = thread::spawn(move || dispatcher.run());

    let (response_tx, response_rx) = sync_channel(1);
    queue.push(NetRequest {
        line: "read -m 60 -c heat flow".into(),
        user: String::new(),
        mode: RequestMode::default(),
        since: now_secs(),
        response: response_tx,
    });
    let response = response_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(response.text, "196.06");
    // answered from the cache, no bus transaction
    assert!(harness.device.written().is_empty());

    harness.bus.protocol().shutdown();
    queue.notify();
    dispatcher_thread.join().ok();
}

#[test]
fn forced_read_goes_to_bus() {
    let harness = Harness::new(0x31);
    {
        let mut catalog = harness.catalog.write().unwrap();
        let templates = FieldTemplates::new();
        ebus::filereader::load_definitions(
            &mut catalog,
            &templates,
            "r,heat,,flow,,,08,b509,0d,temp,s,D2C,,°C,\n",
            "test.csv",
            None,
        )
        .unwrap();
    }
    harness.device.push_reply(&slave_reply(&[0x02, 0x41, 0x0c]));
    harness.wait_until("signal", || harness.bus.protocol().has_signal());
    let queue = Arc::new(Queue::new());
    let scan_helper = ScanHelper::new(
        harness.catalog.clone(),
        Box::new(LocalSource::new("/nonexistent")),
        false,
    );
    let mut dispatcher = Dispatcher::new(
        harness.bus.clone(),
        scan_helper,
        queue.clone(),
        DispatcherConfig::default(),
    );
    let dispatcher_thread = thread::spawn(move || dispatcher.run());

    let (response_tx, response_rx) = sync_channel(1);
    queue.push(NetRequest {
        line: "read -f -c heat flow".into(),
        user: String::new(),
        mode: RequestMode::default(),
        since: now_secs(),
        response: response_tx,
    });
    let response = response_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(response.text, "196.06");
    // the master frame went out on the bus
    assert!(!harness.device.written().is_empty());

    harness.bus.protocol().shutdown();
    queue.notify();
    dispatcher_thread.join().ok();
}

#[test]
fn grab_result_decode_dumps_unknown_frame() {
    let harness = Harness::new(0xff);
    // eavesdrop an unknown master-slave exchange
    let mut bytes = wire_bytes(&[0x31, 0x08, 0xb5, 0x09, 0x02, 0x41, 0x0c]);
    bytes.push(0x00); // slave ACK
    bytes.extend(wire_bytes(&[0x02, 0x41, 0x0c]));
    bytes.push(0x00); // master ACK
    harness.device.push_incoming(&bytes);
    harness.wait_until("frame to be grabbed", || {
        !harness.bus.format_grab_result(false, false, 0, 0, false).is_empty()
    });

    let queue = Arc::new(Queue::new());
    let scan_helper = ScanHelper::new(
        harness.catalog.clone(),
        Box::new(LocalSource::new("/nonexistent")),
        false,
    );
    let mut dispatcher = Dispatcher::new(
        harness.bus.clone(),
        scan_helper,
        queue.clone(),
        DispatcherConfig::default(),
    );
    let dispatcher_thread = thread::spawn(move || dispatcher.run());

    let (response_tx, response_rx) = sync_channel(1);
    queue.push(NetRequest {
        line: "grab result decode".into(),
        user: String::new(),
        mode: RequestMode::default(),
        since: 0,
        response: response_tx,
    });
    let response = response_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(response.text.contains("3108b50902410c / 02410c = 1"));
    // the slave bytes decoded with every fitting type
    assert!(response.text.contains("D2C"));
    assert!(response.text.contains("410c=196.06"));
    assert!(response.text.contains("41=65"));

    // without the token only the frame lines show
    let (response_tx, response_rx) = sync_channel(1);
    queue.push(NetRequest {
        line: "grab result".into(),
        user: String::new(),
        mode: RequestMode::default(),
        since: 0,
        response: response_tx,
    });
    let response = response_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!response.text.contains("D2C"));

    harness.bus.protocol().shutdown();
    queue.notify();
    dispatcher_thread.join().ok();
}

#[test]
fn unknown_command_yields_error_line() {
    let harness = Harness::new(0x31);
    let queue = Arc::new(Queue::new());
    let scan_helper = ScanHelper::new(
        harness.catalog.clone(),
        Box::new(LocalSource::new("/nonexistent")),
        false,
    );
    let mut dispatcher = Dispatcher::new(
        harness.bus.clone(),
        scan_helper,
        queue.clone(),
        DispatcherConfig::default(),
    );
    let dispatcher_thread = thread::spawn(move || dispatcher.run());

    let (response_tx, response_rx) = sync_channel(1);
    queue.push(NetRequest {
        line: "bogus".into(),
        user: String::new(),
        mode: RequestMode::default(),
        since: 0,
        response: response_tx,
    });
    let response = response_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(response.text.starts_with("ERR: "));

    harness.bus.protocol().shutdown();
    queue.notify();
    dispatcher_thread.join().ok();
}
