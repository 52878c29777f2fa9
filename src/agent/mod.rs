use std::time::Duration;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{io::{AsyncReadExt, AsyncWriteExt}, net::{tcp::OwnedWriteHalf, TcpStream}, sync::mpsc::{self, error::TrySendError, Receiver, Sender}, time::{Instant, MissedTickBehavior}};

use crate::config::LinkConfig;
use crate::models::Roster;
use crate::mqtt::Transmission;
use crate::protocol::ProtocolError;

pub mod scheduler;
pub mod signals;

pub use scheduler::{PollScheduler, Request, DEFAULT_MAX_TIMEOUTS};
pub use signals::ShutdownSignals;

pub const EXIT_TRANSPORT: i32 = 1;
pub const EXIT_STARTUP: i32 = 2;
pub const EXIT_NO_METERS: i32 = 3;
pub const EXIT_CONFIG: i32 = 17;
pub const EXIT_LIVENESS: i32 = 99;

/// Time granted to the socket to flush before the process goes away
pub const EXIT_GRACE: Duration = Duration::from_millis(300);
const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);
const READ_BUFFER_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Meter list is empty, nothing to poll")]
    EmptyRoster,
    #[error("TCP client: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Not found meter with long address {0}")]
    UnknownMeter(u32),
    #[error("Meter {0} answered without an outstanding request")]
    UnexpectedReply(u32),
    #[error("Timeout error! Number of errors = {0}")]
    Liveness(u32),
    #[error("Agent is stopped")]
    Stopped,
}

impl AgentError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::EmptyRoster => EXIT_NO_METERS,
            AgentError::Transport(_) => EXIT_TRANSPORT,
            AgentError::Liveness(_) => EXIT_LIVENESS,
            _ => EXIT_STARTUP,
        }
    }
}

pub enum AgentCommand {
    Reload(Roster),
    Shutdown { reason: String, code: i32 },
}

/// Why and how the agent finished, the caller turns this into the process exit
#[derive(Debug, Clone, PartialEq)]
pub struct AgentExit {
    pub code: i32,
    pub reason: String,
}

/// Cheap handle to talk to a running agent from other tasks
#[derive(Clone)]
pub struct AgentHandle {
    commands: Sender<AgentCommand>,
}

impl AgentHandle {
    pub async fn reload(&self, roster: Roster) -> Result<(), AgentError> {
        if roster.is_empty() {
            return Err(AgentError::EmptyRoster);
        }
        self.commands.send(AgentCommand::Reload(roster)).await.map_err(|_| AgentError::Stopped)
    }

    pub async fn shutdown(&self, reason: String, code: i32) -> Result<(), AgentError> {
        self.commands.send(AgentCommand::Shutdown { reason, code }).await.map_err(|_| AgentError::Stopped)
    }
}

/// Owns the TCP link to the meter gateway and drives the poll scheduler.
///
/// Socket events, the watchdog, the pacing delay and commands are all served
/// by one task, so the scheduler never sees two of them at once.
pub struct Agent {
    link: LinkConfig,
    scheduler: PollScheduler,
    sender: Sender<Transmission>,
    commands: Receiver<AgentCommand>,
    stopped: bool,
}

impl Agent {
    pub fn new(link: LinkConfig, roster: Roster, sender: Sender<Transmission>) -> Result<(Self, AgentHandle), AgentError> {
        let scheduler = PollScheduler::new(roster, Duration::from_millis(link.timeout_ms), link.max_timeouts)?;
        let (tx, rx) = mpsc::channel(8);

        Ok((
            Agent { link, scheduler, sender, commands: rx, stopped: false },
            AgentHandle { commands: tx },
        ))
    }

    pub async fn run(mut self) -> AgentExit {
        let target = format!("{}:{}", self.link.host, self.link.port);
        info!("Try connect to {target}");

        let stream = match TcpStream::connect(&target).await {
            Ok(s) => s,
            Err(e) => {
                return self.finish(None, EXIT_TRANSPORT, format!("TCP client: connection error to {target}: {e}")).await;
            }
        };
        let _ = stream.set_nodelay(true);
        info!("TCP client connected to {target}, polling {} meters", self.scheduler.roster().len());

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let poll_delay = Duration::from_millis(self.link.poll_delay_ms);
        let mut pacing: Option<Instant> = None;
        let mut commands_open = true;

        let mut watchdog = tokio::time::interval(WATCHDOG_PERIOD);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Err(e) = self.send_next(&mut writer).await {
            return self.finish(Some(writer), e.exit_code(), e.to_string()).await;
        }

        let (code, reason) = loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break (EXIT_TRANSPORT, format!("TCP client disconnected from {target}")),
                    Ok(n) => {
                        self.on_data(&buf[..n]);
                        pacing = Some(Instant::now() + poll_delay);
                    }
                    Err(e) => break (EXIT_TRANSPORT, format!("TCP client: connection error: {e}")),
                },

                _ = watchdog.tick() => match self.scheduler.check_timeout(std::time::Instant::now()) {
                    Ok(Some(request)) => {
                        if let Err(e) = self.write(&mut writer, request).await {
                            break (e.exit_code(), e.to_string());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => break (e.exit_code(), format!("{target} {e}! STOP!")),
                },

                _ = tokio::time::sleep_until(pacing.unwrap_or_else(Instant::now)), if pacing.is_some() => {
                    pacing = None;
                    if let Err(e) = self.send_next(&mut writer).await {
                        break (e.exit_code(), e.to_string());
                    }
                }

                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(AgentCommand::Reload(roster)) => {
                        if let Err(e) = self.scheduler.reload(roster) {
                            error!("Meter list not replaced: {e}");
                        }
                    }
                    Some(AgentCommand::Shutdown { reason, code }) => break (code, reason),
                    None => {
                        debug!("All agent handles dropped");
                        commands_open = false;
                    }
                },
            }
        };

        self.finish(Some(writer), code, reason).await
    }

    fn on_data(&mut self, data: &[u8]) {
        debug!("=> {}", hex::encode(data));

        match self.scheduler.handle_response(data) {
            Ok(Some(batch)) => {
                debug!("{}: {} values decoded", batch.meter_name, batch.records.len());
                match self.sender.try_send(Transmission::Metering(batch)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("Metering queue is full, values dropped"),
                    Err(TrySendError::Closed(_)) => warn!("Metering queue is closed, values dropped"),
                }
            }
            Ok(None) => {}
            Err(e) => error!("Incoming message {}: {e}", hex::encode(data)),
        }
    }

    async fn send_next(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), AgentError> {
        if self.stopped {
            return Ok(());
        }

        match self.scheduler.next_request(std::time::Instant::now()) {
            Some(request) => self.write(writer, request).await,
            None => Ok(()),
        }
    }

    async fn write(&mut self, writer: &mut OwnedWriteHalf, request: Request) -> Result<(), AgentError> {
        if self.stopped {
            return Ok(());
        }

        debug!("{} <= {}", request.meter_name, hex::encode(&request.frame));
        writer.write_all(&request.frame).await.map_err(|e| AgentError::Transport(format!("write to {} failed: {e}", request.address)))
    }

    async fn finish(&mut self, writer: Option<OwnedWriteHalf>, code: i32, reason: String) -> AgentExit {
        self.stopped = true;
        match code {
            0 => info!("{reason}"),
            _ => error!("{reason}"),
        }

        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        tokio::time::sleep(EXIT_GRACE).await;

        AgentExit { code, reason }
    }
}
