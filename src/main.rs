use meterlink2mqtt::{
    agent::{Agent, AgentExit, ShutdownSignals, EXIT_GRACE, EXIT_NO_METERS, EXIT_STARTUP},
    config::{config_read, config_write, ConfigBases},
    get_config_or_panic,
    mqtt::{announce_roster, internal_commands::CommandHandler, publish_uptime, MqttManager},
    roster, Catalog,
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use std::time::Duration;
use log::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("M2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    /* Before anything else, a SIGTERM must reach the agent as a clean shutdown */
    let mut signals = match ShutdownSignals::install() {
        Ok(s) => s,
        Err(e) => {
            error!("Signal handlers can not be installed: {e}");
            std::process::exit(EXIT_STARTUP);
        }
    };

    let link = get_config_or_panic!("link", ConfigBases::Link);
    let mqtt_config = get_config_or_panic!("mqtt", ConfigBases::Mqtt);

    // we need a channel for the agent to send metering data to the handler
    let (mut mqtt, tx) = MqttManager::new(&mqtt_config);
    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    let catalog = Catalog::build();
    let meters = roster::build(&config_read().get_devices(), &catalog);
    if meters.is_empty() {
        error!("Meter list is empty, nothing to poll");
        tokio::time::sleep(EXIT_GRACE).await;
        std::process::exit(EXIT_NO_METERS);
    }
    info!("{} meters in the roster", meters.len());
    announce_roster(&tx, &meters, &mqtt_config).await;

    let (agent, handle) = match Agent::new(link, meters, tx.clone()) {
        Ok(a) => a,
        Err(e) => {
            error!("{e}");
            tokio::time::sleep(EXIT_GRACE).await;
            std::process::exit(e.exit_code());
        }
    };
    let mut agent_task = tokio::spawn(agent.run());

    /* Rebuild the roster whenever the device tree changes */
    let mut changes = config_read().get_change_receiver();
    let reload_handle = handle.clone();
    let reload_sender = tx.clone();
    let reload_mqtt = mqtt_config.clone();
    threads.push(tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) if change.base != "devices" => continue,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Missed {n} configuration changes, rebuilding anyway"),
                Err(RecvError::Closed) => return,
            }

            let meters = roster::build(&config_read().get_devices(), &catalog);
            if meters.is_empty() {
                error!("Meter list is empty after the update, keeping the current one");
                continue;
            }

            info!("Device tree changed, {} meters in the new roster", meters.len());
            announce_roster(&reload_sender, &meters, &reload_mqtt).await;
            if let Err(e) = reload_handle.reload(meters).await {
                error!("Roster not handed to the agent: {e}");
                return;
            }
        }
    }));

    /* Make sure to handle the dirty flag of the configuration */
    threads.push(tokio::spawn(async move {
        loop {
            let _ = tokio::time::sleep(Duration::from_secs(60)).await;
            let mut c = config_write();
            if c.is_dirty() {
                if let Err(e) = c.save() {
                    error!("Saving configuration failed: {e}");
                }
            }
        }
    }));

    /* Periodic uptime publishing */
    let uptime_sender = tx.clone();
    let uptime_base = mqtt_config.base_topic.clone();
    threads.push(tokio::spawn(async move {
        // Publish immediately on startup
        publish_uptime(&uptime_sender, &uptime_base).await;

        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.tick().await; // Skip first immediate tick since we already published

        loop {
            interval.tick().await;
            publish_uptime(&uptime_sender, &uptime_base).await;
        }
    }));

    /* Last but not least start our command handling */
    let command = CommandHandler::new(tx, mqtt_config.base_topic.clone());
    threads.push(tokio::spawn(async move {
        command.start_thread().await;
    }));

    info!("All modules started, now waiting for a signal to exit");
    let mut check = tokio::time::interval(Duration::from_secs(10));
    let exit = loop {
        tokio::select! {
            res = &mut agent_task => {
                break match res {
                    Ok(exit) => exit,
                    Err(e) => AgentExit { code: EXIT_STARTUP, reason: format!("Agent task failed: {e}") },
                };
            }
            name = signals.recv() => {
                let _ = handle.shutdown(format!("{name} received"), 0).await;
            }
            _ = check.tick() => {
                if threads.iter().any(|t| t.is_finished()) {
                    let _ = handle.shutdown("Service task ended, shutting down".to_string(), 0).await;
                }
            }
        }
    };

    for task in threads.iter_mut() {
        task.abort();
    }

    info!("Exit with code {}: {}", exit.code, exit.reason);
    std::process::exit(exit.code);
}
