use std::time::Duration;

use meshcoord::util::init_tracing;
use meshcoord::{ChannelListener, Controller, ControllerConfig, Event};
use tracing::Level;

#[tokio::main]
async fn main() {
    init_tracing(Level::INFO);

    // serial device, or host:port of a bridge
    let port = std::env::args().nth(1).unwrap_or_else(|| "/dev/ttyACM0".to_string());
    let mut config = ControllerConfig::with_port(port);
    config.store_dir = std::env::temp_dir().join("meshcoord");
    config.response_timeout = Duration::from_secs(3);

    let controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return;
        }
    };
    let (listener, mut events) = ChannelListener::new();
    controller.add_listener(listener);

    if let Err(e) = controller.connect().await {
        eprintln!("Failed to connect: {}", e);
        return;
    }
    println!("Connected to {}, press Ctrl-C to stop", controller.config().port);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(Event::NetworkInitialized(own)) => {
                    let info = controller.controller_info();
                    println!("Network {:08X} ready, controller is node {} ({})", info.home_id, own, info.version);
                    for node in controller.nodes() {
                        println!(
                            "  node {:>3}: {:?}, {} classes, {}",
                            node.id(),
                            node.stage(),
                            node.command_classes().count(),
                            if node.name.is_empty() { "unnamed" } else { node.name.as_str() }
                        );
                    }
                }
                Some(Event::CommandClassValue { node, endpoint, command_class, value }) => {
                    println!("node {} endpoint {}: {} = {}", node, endpoint, command_class, value);
                }
                Some(Event::NodeStatusChanged { node, status }) => println!("node {} is {:?}", node, status),
                Some(_) => {}
                None => break,
            },
        }
    }

    let stats = controller.stats();
    println!(
        "Frames: {} received, {} acked, {} naks, {} timeouts",
        stats.sof, stats.ack, stats.nak, stats.timeouts
    );
    controller.disconnect().await;
}
