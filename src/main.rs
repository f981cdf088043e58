use anyhow::Context as _;
use clap::Parser;
use ebusd::{
    bushandler::BusHandler,
    device::TcpDevice,
    mainloop::{parse_access_list, Dispatcher, DispatcherConfig, InitialScan},
    network::TextServer,
    protocol::{ProtocolConfig, ProtocolHandler},
    queue::Queue,
    scan::{LocalSource, ScanHelper},
};
use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    thread,
    time::Duration,
};

fn parse_address(text: &str) -> Result<u8, String> {
    let address = u8::from_str_radix(text, 16).map_err(|e| e.to_string())?;
    if !ebus::is_master(address) {
        return Err(format!("{:02x} is no master address", address));
    }
    Ok(address)
}

/// Daemon for communication with eBUS heating systems.
#[derive(Parser, Debug)]
#[clap(name = "ebusd", version, about)]
struct Args {
    /// Device to connect to (host:port of a bus tunnel)
    #[clap(short, long, env = "EBUSD_DEVICE", default_value = "127.0.0.1:9999")]
    device: String,

    /// Own master bus address in hex
    #[clap(short, long, env = "EBUSD_ADDRESS", default_value = "ff", parse(try_from_str = parse_address))]
    address: u8,

    /// Port for the text line client interface
    #[clap(short, long, env = "EBUSD_PORT", default_value_t = 8888)]
    port: u16,

    /// Path of the message definition files
    #[clap(short, long, env = "EBUSD_CONFIGPATH", default_value = "/etc/ebusd")]
    configpath: String,

    /// Pick up definitions by scanning: none, broadcast, full or a hex address
    #[clap(long, env = "EBUSD_SCANCONFIG")]
    scanconfig: Option<String>,

    /// Poll cycle in seconds, 0 to disable polling
    #[clap(long, env = "EBUSD_POLLINTERVAL", default_value_t = 5)]
    pollinterval: u64,

    /// Bus acquisition timeout in milliseconds
    #[clap(long, env = "EBUSD_ACQUIRETIMEOUT", default_value_t = 10)]
    acquiretimeout: u64,

    /// Number of retries for bus acquisition
    #[clap(long, env = "EBUSD_ACQUIRERETRIES", default_value_t = 3)]
    acquireretries: usize,

    /// Number of retries for sending a frame
    #[clap(long, env = "EBUSD_SENDRETRIES", default_value_t = 2)]
    sendretries: usize,

    /// Receive timeout in milliseconds
    #[clap(long, env = "EBUSD_RECEIVETIMEOUT", default_value_t = 50)]
    receivetimeout: u64,

    /// Number of retries for scanning a slave
    #[clap(long, env = "EBUSD_SCANRETRIES", default_value_t = 2)]
    scanretries: u32,

    /// Only observe the bus, never send
    #[clap(long, env = "EBUSD_READONLY")]
    readonly: bool,

    /// Answer requests to the own addresses
    #[clap(long, env = "EBUSD_ANSWER")]
    answer: bool,

    /// Enable the hex and direct commands
    #[clap(long, env = "EBUSD_ENABLEHEX")]
    enablehex: bool,

    /// Enable the define command
    #[clap(long, env = "EBUSD_ENABLEDEFINE")]
    enabledefine: bool,

    /// File with access control entries (user:secret:levels)
    #[clap(long, env = "EBUSD_ACLFILE")]
    aclfile: Option<String>,

    /// Default access levels for unauthenticated clients
    #[clap(long, env = "EBUSD_ACCESSLEVEL", default_value = "")]
    accesslevel: String,

    /// File to dump received bytes to (via the dump command)
    #[clap(long, env = "EBUSD_DUMPFILE")]
    dumpfile: Option<String>,

    /// Maximum size of the dump file in kB before rollover
    #[clap(long, env = "EBUSD_DUMPSIZE", default_value_t = 100_000)]
    dumpsize: u64,

    /// Log filter (error, warn, info, debug, trace or module=level)
    #[clap(long, env = "EBUSD_LOGLEVEL", default_value = "info")]
    loglevel: String,

    /// Stay in the foreground (always on; kept for compatibility)
    #[clap(short, long, env = "EBUSD_FOREGROUND")]
    foreground: bool,
}

fn parse_initial_scan(value: &str) -> Result<InitialScan, String> {
    match value {
        "none" => Ok(InitialScan::None),
        "broadcast" => Ok(InitialScan::Broadcast),
        "full" => Ok(InitialScan::Full),
        _ => {
            let address = u8::from_str_radix(value, 16).map_err(|e| e.to_string())?;
            if ebus::is_master(address) || !ebus::is_valid_address(address, false) {
                return Err(format!("{:02x} is no slave address", address));
            }
            Ok(InitialScan::Single(address))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .parse_filters(&args.loglevel)
        .init();
    let initial_scan = match args.scanconfig.as_deref() {
        None => None,
        Some(value) => match parse_initial_scan(value) {
            Ok(scan) => Some(scan),
            Err(e) => {
                log::error!("invalid scanconfig: {}", e);
                std::process::exit(22);
            }
        },
    };
    if !args.foreground {
        log::debug!("running in foreground, daemonizing is left to the service manager");
    }

    // the data type registry is read-only after this point
    let types = Arc::new(ebus::DataTypeList::new());
    let catalog = Arc::new(RwLock::new(ebus::MessageCatalog::new(types)));
    let mut scan_helper = ScanHelper::new(
        catalog.clone(),
        Box::new(LocalSource::new(&args.configpath)),
        false,
    );
    if let Err(e) = scan_helper.load_config_files() {
        log::error!("error loading config files from {}: {}", args.configpath, e);
    }

    let protocol_config = ProtocolConfig {
        own_master: args.address,
        acquire_timeout: Duration::from_millis(args.acquiretimeout),
        acquire_retries: args.acquireretries,
        send_retries: args.sendretries,
        recv_timeout: Duration::from_millis(args.receivetimeout),
        read_only: args.readonly,
        answer: args.answer,
    };
    let device = TcpDevice::new(&args.device);
    let mut protocol = ProtocolHandler::new(Box::new(device), protocol_config);
    let handle = protocol.handle();
    let poll_interval = if args.readonly { 0 } else { args.pollinterval };
    let bus = BusHandler::new(catalog, handle.clone(), poll_interval);
    protocol.set_listener(Box::new(bus.clone()));

    let users = match &args.aclfile {
        None => Default::default(),
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("unable to read ACL file {}", path))?;
            parse_access_list(&content)
        }
    };
    let dispatcher_config = DispatcherConfig {
        scan_config: initial_scan.is_some(),
        initial_scan: if args.readonly {
            InitialScan::None
        } else {
            initial_scan.unwrap_or(InitialScan::None)
        },
        scan_retries: args.scanretries,
        polling: poll_interval > 0,
        enable_hex: args.enablehex,
        enable_define: args.enabledefine,
        users,
        default_levels: args.accesslevel.clone(),
        dump_file: args.dumpfile.clone(),
        dump_size: args.dumpsize * 1024,
    };
    let queue = Arc::new(Queue::new());
    let mut dispatcher = Dispatcher::new(bus, scan_helper, queue.clone(), dispatcher_config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let server = TextServer::new(queue.clone(), shutdown.clone());
    server
        .listen(&format!("0.0.0.0:{}", args.port))
        .with_context(|| format!("unable to listen on port {}", args.port))?;

    {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        let queue = queue.clone();
        ctrlc::set_handler(move || {
            log::info!("shutting down");
            shutdown.store(true, Ordering::Relaxed);
            handle.shutdown();
            queue.notify();
        })
        .context("unable to install signal handler")?;
    }

    let protocol_thread = thread::spawn(move || protocol.run());
    dispatcher.run();
    shutdown.store(true, Ordering::Relaxed);
    handle.shutdown();
    protocol_thread
        .join()
        .map_err(|_| anyhow::anyhow!("protocol task panicked"))?;
    Ok(())
}
