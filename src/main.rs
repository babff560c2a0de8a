use anyhow::Result;
use gatt_scanner::domain::models::{
    AppEvent, DispatchedEvent, MessageSeverity, Peer, SessionState,
};
use gatt_scanner::domain::settings::{Settings, SettingsService};
use gatt_scanner::infrastructure::bluetooth::capability::Capabilities;
use gatt_scanner::infrastructure::bluetooth::protocol::{self, decode_text};
use gatt_scanner::infrastructure::bluetooth::service::ServiceConfig;
use gatt_scanner::infrastructure::bluetooth::simulated::{SimulatedPeripheral, SimulatedRadio};
use gatt_scanner::infrastructure::bluetooth::{BluetoothService, ServiceHandle};
use gatt_scanner::infrastructure::logging;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEMO_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
const DEMO_NAME: &str = "Arduino Nano 33 BLE";

#[tokio::main]
async fn main() -> Result<()> {
    let mut settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = logging::init_logger(&settings.log_settings)?;
    info!("Starting GATT scanner");
    info!("Settings: {}", settings_service.path().display());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let notifier = tokio::spawn(log_app_events(event_rx));
    let (handle, service_task) = start_service(&settings, event_tx).await?;

    handle.start_scan().await?;
    tokio::time::sleep(Duration::from_millis(settings.scan_duration_ms)).await;
    handle.stop_scan();

    let devices = handle.devices();
    info!("Found {} device(s)", devices.len());
    for (i, peer) in devices.iter().enumerate() {
        info!("  [{}] {}", i, peer);
    }

    if let Some(peer) = choose_peer(&devices, settings.auto_connect_address.as_deref()) {
        info!("Connecting to {}", peer);
        handle.select_device(peer.address.clone()).await?;
        settings_service.set_auto_connect_address(Some(peer.address.to_string()))?;
        stream_until_interrupted(&handle).await;
        handle.disconnect().await?;
    } else {
        warn!("No devices found");
    }

    handle.shutdown();
    service_task.await?;
    notifier.abort();
    info!("GATT scanner stopped");
    Ok(())
}

/// Prefer the remembered device, else the first one seen
fn choose_peer(devices: &[Peer], remembered: Option<&str>) -> Option<Peer> {
    remembered
        .and_then(|address| devices.iter().find(|p| p.address.as_str() == address))
        .or_else(|| devices.first())
        .cloned()
}

async fn start_service(
    settings: &Settings,
    event_tx: mpsc::UnboundedSender<AppEvent>,
) -> Result<(ServiceHandle, JoinHandle<()>)> {
    let config = ServiceConfig::from_settings(settings)?;
    let capabilities = Capabilities::granted_all();

    #[cfg(feature = "btleplug")]
    if !settings.use_simulated_radio {
        use gatt_scanner::infrastructure::bluetooth::btleplug_backend::BtleplugRadio;
        use gatt_scanner::infrastructure::bluetooth::transport::radio_channels;

        let (senders, events) = radio_channels();
        let radio = BtleplugRadio::new(senders).await?;
        let (service, handle) =
            BluetoothService::new(radio.clone(), radio, events, capabilities, event_tx, config);
        return Ok((handle, service.spawn()));
    }

    info!("Using simulated radio");
    let (radio, events) = SimulatedRadio::auto();
    radio.add_peripheral(SimulatedPeripheral::sensor_node(Peer::new(
        DEMO_ADDRESS,
        Some(DEMO_NAME.to_string()),
    )));
    let _feed = spawn_sensor_feed(radio.clone(), Duration::from_secs(1));

    let (service, handle) =
        BluetoothService::new(radio.clone(), radio, events, capabilities, event_tx, config);
    Ok((handle, service.spawn()))
}

/// Push a "temperature,humidity" reading to every open simulated link
fn spawn_sensor_feed(radio: SimulatedRadio, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        let mut tick: u32 = 0;
        loop {
            interval.tick().await;
            tick = tick.wrapping_add(1);
            let reading = format!("{:.1},{}", 22.0 + (tick % 30) as f32 * 0.1, 55 + tick % 10);
            for link in radio.active_links() {
                radio.notify(link, protocol::TARGET_CHAR_UUID, reading.as_bytes());
            }
        }
    })
}

async fn stream_until_interrupted(handle: &ServiceHandle) {
    let dispatcher = handle.dispatcher();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = dispatcher.next() => match event {
                Some(DispatchedEvent::Notification(n)) => {
                    info!(characteristic = %n.characteristic_uuid, origin = ?n.origin, "{}", decode_text(&n.payload));
                }
                Some(DispatchedEvent::StateChanged(change)) => {
                    info!("Session {}: {} -> {}", change.session, change.from, change.to);
                    if change.to == SessionState::Disconnected {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

async fn log_app_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::DeviceFound(peer) => info!("Device found: {}", peer),
            AppEvent::ConnectionStatus(state) => info!("Connection status: {}", state),
            AppEvent::DataReceived(_) => {}
            AppEvent::LogMessage(msg) => {
                let title = msg.title.as_deref().unwrap_or("Bluetooth");
                match msg.severity {
                    MessageSeverity::Error => error!("{}: {}", title, msg.message),
                    MessageSeverity::Warning => warn!("{}: {}", title, msg.message),
                    MessageSeverity::Info | MessageSeverity::Success => {
                        info!("{}: {}", title, msg.message)
                    }
                }
            }
        }
    }
}
