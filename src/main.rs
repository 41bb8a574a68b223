use anyhow::Context;
use bt_host_core::domain::packets::{CommandPacket, OpCode};
use bt_host_core::domain::settings::{Settings, SettingsService, SnoopMode, TransportKind};
use bt_host_core::hci::HciLayer;
use bt_host_core::infrastructure::hal::{BtSnoopLogger, CaptureSink, H4SocketBackend, HciHal};
use bt_host_core::infrastructure::logging::init_logger;
use bt_host_core::stack::{Handler, ModuleList, ModuleRegistry, StackManager, Thread};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

fn open_transport(settings: &Settings) -> anyhow::Result<H4SocketBackend> {
    let transport = &settings.transport;
    let backend = match transport.kind {
        TransportKind::Tcp => H4SocketBackend::connect_tcp(&transport.host, transport.port),
        TransportKind::LocalSocket => H4SocketBackend::connect_local(&transport.socket_name),
    };
    backend.context("Failed to open the controller transport")
}

fn open_capture(settings: &Settings) -> Arc<dyn CaptureSink> {
    match settings.snoop.mode {
        SnoopMode::Disabled => Arc::new(BtSnoopLogger::disabled()),
        SnoopMode::Full => match BtSnoopLogger::create(&settings.snoop.path) {
            Ok(logger) => Arc::new(logger),
            Err(e) => {
                warn!("btsnoop capture disabled: {}", e);
                Arc::new(BtSnoopLogger::disabled())
            }
        },
    }
}

/// Reset the controller and log its address.
fn identify_controller(hci: &HciLayer, client: &Handler) {
    hci.enqueue_command_with_complete(
        CommandPacket::new(OpCode::RESET, vec![]),
        |complete| match complete.status() {
            Some(0x00) => info!("Controller reset"),
            status => warn!("HCI_Reset returned status {:?}", status),
        },
        client,
    );
    hci.enqueue_command_with_complete(
        CommandPacket::new(OpCode::READ_BD_ADDR, vec![]),
        |complete| {
            let params = &complete.return_parameters;
            if params.len() < 7 || params[0] != 0x00 {
                warn!("HCI_Read_BD_ADDR failed: {:02x?}", params);
                return;
            }
            let address: Vec<String> = params[1..7].iter().rev().map(|b| format!("{:02X}", b)).collect();
            info!("Controller address {}", address.join(":"));
        },
        client,
    );
}

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Bluetooth host core");
    info!("Settings loaded from {}", settings_service.path().display());

    let backend = open_transport(&settings)?;
    let capture = open_capture(&settings);

    let registry = ModuleRegistry::with_stop_timeout(Duration::from_millis(settings.module_stop_timeout_ms));
    let manager = StackManager::with_registry(
        registry,
        Duration::from_millis(settings.stack_start_timeout_ms),
        Duration::from_millis(settings.stack_stop_timeout_ms),
    )?;
    manager.registry().inject(HciHal::new(backend, capture));
    manager
        .registry()
        .inject(HciLayer::with_data_queue_capacity(settings.data_queue_capacity));

    let stack_thread = Arc::new(Thread::new("stack_thread")?);
    let mut modules = ModuleList::new();
    modules.add::<HciLayer>();
    manager.start_up(modules, Arc::clone(&stack_thread))?;

    let client_thread = Thread::new("client_thread")?;
    let client = Handler::new(&client_thread);
    let hci = manager
        .get_instance::<HciLayer>()
        .context("HciLayer did not start")?;
    identify_controller(&hci, &client);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    info!("Stack running; press Ctrl-C to stop");
    if let Err(e) = rt.block_on(tokio::signal::ctrl_c()) {
        error!("Failed to wait for Ctrl-C: {}", e);
    }

    // Let callbacks already in flight finish before the stack goes away.
    if !client.wait_until_stopped(Duration::from_millis(settings.module_stop_timeout_ms)) {
        warn!("Client callbacks still running at shutdown");
    }
    drop(hci);
    manager.shut_down()?;
    stack_thread.stop();
    client_thread.stop();
    info!("Bluetooth host core stopped");
    Ok(())
}
