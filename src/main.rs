use ble_command_bridge::domain::settings::SettingsService;
use ble_command_bridge::infrastructure::bluetooth::simulated::SimulatedPeripheral;
use ble_command_bridge::infrastructure::logging::init_logger;
use ble_command_bridge::{
    AppEvent, BluetoothService, ConnectionStatus, MessageSeverity, ScannedDevice, ServiceConfig,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One line typed at the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConsoleCommand {
    Scan,
    StopScan,
    Filter(String),
    Devices,
    Connect(usize),
    Disconnect,
    Send(String),
    Help,
    Quit,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "scan" => Ok(Self::Scan),
            "stop" => Ok(Self::StopScan),
            "filter" => Ok(Self::Filter(rest.to_string())),
            "devices" => Ok(Self::Devices),
            "connect" => rest
                .parse()
                .map(Self::Connect)
                .map_err(|_| format!("Expected a device number, got {:?}", rest)),
            "disconnect" => Ok(Self::Disconnect),
            "send" if !rest.is_empty() => Ok(Self::Send(rest.to_string())),
            "send" => Err("Nothing to send".to_string()),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("Unknown command {:?}, try 'help'", other)),
        }
    }
}

const HELP: &str = "\
scan              start scanning (again to stop)
stop              stop scanning
filter <names>    only list devices with one of these names (blank: all)
devices           list found devices
connect <n>       connect to device number n
disconnect        close the connection
send <text>       send a command and print the reply
quit              disconnect and exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = match SettingsService::new() {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Failed to locate settings, using defaults: {}", e);
            SettingsService::with_path("settings.json")
        }
    };

    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting BLE Command Bridge");
    let config = ServiceConfig::from_settings(settings_service.get())?;

    let peripheral = Arc::new(SimulatedPeripheral::new(vec![
        ScannedDevice::new("MyESP32", "24:0A:C4:00:00:01"),
        ScannedDevice::new("Thermostat", "24:0A:C4:00:00:02"),
    ]));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let service = Arc::new(BluetoothService::new(
        peripheral.clone(),
        peripheral,
        event_tx,
        config,
    ));

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(event);
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };

        match command {
            ConsoleCommand::Scan => {
                service.start_scan();
            }
            ConsoleCommand::StopScan => service.stop_scan(),
            ConsoleCommand::Filter(names) => service.set_filter_name(&names),
            ConsoleCommand::Devices => {
                for (index, device) in service.devices().iter().enumerate() {
                    println!("{:>3}  {:<20} {}", index, device.display_name(), device.address);
                }
            }
            ConsoleCommand::Connect(index) => {
                let Some(device) = service.devices().get(index).cloned() else {
                    println!("No device {}, run 'scan' and 'devices' first", index);
                    continue;
                };
                if service.connect_to_device(&device).await {
                    if let Err(e) = settings_service.add_known_address(&device.address) {
                        warn!("Failed to save settings: {}", e);
                    }
                }
            }
            ConsoleCommand::Disconnect => service.disconnect_from_device().await,
            ConsoleCommand::Send(text) => {
                if !service.send_command(text) {
                    println!("A command is already running");
                }
            }
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => break,
        }
    }

    service.shutdown().await;
    tokio::task::yield_now().await;
    printer.abort();
    info!("Exiting");
    Ok(())
}

fn print_event(event: AppEvent) {
    match event {
        AppEvent::ConnectionStatus(status) => {
            let label = match status {
                ConnectionStatus::Disconnected => "disconnected",
                ConnectionStatus::Connecting => "connecting",
                ConnectionStatus::Connected => "connected",
                ConnectionStatus::Error => "error",
            };
            println!("[status] {}", label);
        }
        AppEvent::ScanningChanged(scanning) => {
            println!("[scan] {}", if scanning { "running" } else { "stopped" });
        }
        AppEvent::DevicesChanged(devices) => {
            if let Some(device) = devices.last() {
                println!("[scan] {} device(s), latest {}", devices.len(), device.display_name());
            }
        }
        AppEvent::CommandBusy(_) => {}
        AppEvent::CommandResult(reply) => println!("{}", reply.trim_end()),
        AppEvent::LogMessage(message) => {
            let tag = match message.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Success => "ok",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "error",
            };
            println!("[{}] {}", tag, message.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("scan"), Ok(ConsoleCommand::Scan));
        assert_eq!(ConsoleCommand::parse(" connect 2 "), Ok(ConsoleCommand::Connect(2)));
        assert_eq!(
            ConsoleCommand::parse("send get"),
            Ok(ConsoleCommand::Send("get".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("filter MyESP32 Gateway"),
            Ok(ConsoleCommand::Filter("MyESP32 Gateway".to_string()))
        );
        assert_eq!(ConsoleCommand::parse("filter"), Ok(ConsoleCommand::Filter(String::new())));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ConsoleCommand::parse("connect x").is_err());
        assert!(ConsoleCommand::parse("send").is_err());
        assert!(ConsoleCommand::parse("reboot").is_err());
    }
}
