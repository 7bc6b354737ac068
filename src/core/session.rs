//! Session management for the modem link
//!
//! A session is one open port. While it is open a background task reads the
//! channel, splits the input into lines and feeds them to the state machine.
//! File transfers run on their own task and take the read lease, which
//! parks the line reader until the transfer ends.

use super::codec::{LineClassifier, LineEnding, DEFAULT_MAX_LINE_LENGTH};
use super::notify::{LogCategory, NotificationSink};
use super::state_machine::{Capabilities, ModemCommand, ModemEvent, ModemStateMachine, Reaction, SessionState};
use super::transfer::{
    TransferDirection, TransferError, TransferOutcome, TransferRequest, TransferSummary, XmodemConfig, XmodemEngine,
};
use super::transport::{ByteChannel, ChannelError, PortOpener};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

const READ_CHUNK: usize = 256;

/// Session behaviour settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Read timeout of the line receive loop
    pub poll_interval_ms: u64,
    /// Terminator appended to every command
    pub line_ending: LineEnding,
    /// Permit transfers before CONNECT (direct cable, no modem)
    pub allow_transfer_in_command_mode: bool,
    /// Longest line held back waiting for a newline
    pub max_line_length: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            line_ending: LineEnding::CrLf,
            allow_transfer_in_command_mode: false,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl SessionSettings {
    /// Receive loop read timeout
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Session error types
#[derive(Error, Debug)]
pub enum SessionError {
    /// No open session
    #[error("Not connected")]
    NotConnected,

    /// A session is already open
    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    /// A transfer owns the channel
    #[error("A file transfer is in progress")]
    TransferInProgress,

    /// Transfers need an established call
    #[error("No connection established with the remote side")]
    NotInDataMode,

    /// Channel failure
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Shared state of one open session
struct ActiveSession {
    id: Uuid,
    port: String,
    channel: Arc<dyn ByteChannel>,
    machine: Mutex<ModemStateMachine>,
    sink: Arc<dyn NotificationSink>,
    /// Held by whoever reads the channel: the receive loop per poll, a transfer for its whole run
    read_lease: Arc<tokio::sync::Mutex<()>>,
    transfer_active: AtomicBool,
    shutdown: CancellationToken,
}

impl ActiveSession {
    fn state(&self) -> SessionState {
        self.machine.lock().state()
    }

    async fn apply(&self, event: ModemEvent) -> Result<(), ChannelError> {
        let reactions = self.machine.lock().handle(event);
        self.carry_out(reactions).await
    }

    async fn carry_out(&self, reactions: Vec<Reaction>) -> Result<(), ChannelError> {
        for reaction in reactions {
            match reaction {
                Reaction::Write(bytes) => {
                    self.channel.write(&bytes).await?;
                }
                Reaction::Log { text, category } => self.sink.on_log(&text, category),
                Reaction::StateChanged(state) => self.sink.on_state_change(state),
                Reaction::CloseChannel => {
                    self.shutdown.cancel();
                    self.channel.close().await;
                }
            }
        }
        Ok(())
    }

    /// Treat a channel failure as the end of the session
    async fn fail(&self, reason: String) {
        error!(port = %self.port, reason = %reason, "channel failed");
        let reactions = self.machine.lock().handle(ModemEvent::ChannelFailed(reason));
        // Failure reactions never write
        let _ = self.carry_out(reactions).await;
    }
}

/// Routes operator actions to the modem session and runs the background
/// receive loop and file transfers.
pub struct SessionController {
    settings: SessionSettings,
    xmodem: XmodemConfig,
    opener: Arc<dyn PortOpener>,
    sink: Arc<dyn NotificationSink>,
    active: Mutex<Option<Arc<ActiveSession>>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl SessionController {
    /// Create a controller with no open session
    pub fn new(
        settings: SessionSettings,
        xmodem: XmodemConfig,
        opener: Arc<dyn PortOpener>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            settings,
            xmodem,
            opener,
            sink,
            active: Mutex::new(None),
            receive_task: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Open `port` and start the receive loop
    pub async fn connect(&self, port: &str, baud_rate: u32) -> Result<(), SessionError> {
        let _guard = self.lifecycle.lock().await;

        if let Some(active) = self.current() {
            if active.state().is_open() {
                return Err(SessionError::AlreadyConnected(active.port.clone()));
            }
        }
        self.reap().await;

        let channel = match self.opener.open(port, baud_rate).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(port, error = %e, "connect failed");
                self.sink.on_log(&format!("Connection failed: {e}"), LogCategory::Error);
                return Err(e.into());
            }
        };

        let session = Arc::new(ActiveSession {
            id: Uuid::new_v4(),
            port: port.to_string(),
            channel,
            machine: Mutex::new(ModemStateMachine::new(self.settings.line_ending)),
            sink: self.sink.clone(),
            read_lease: Arc::new(tokio::sync::Mutex::new(())),
            transfer_active: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        session
            .apply(ModemEvent::Opened {
                port: port.to_string(),
            })
            .await?;
        info!(session = %session.id, port, baud_rate, "session opened");

        let span = tracing::info_span!("session", id = %session.id, port);
        let classifier = LineClassifier::with_max_length(self.settings.max_line_length);
        let task = tokio::spawn(receive_loop(session.clone(), classifier, self.settings.poll_interval()).instrument(span));

        *self.active.lock() = Some(session);
        *self.receive_task.lock() = Some(task);
        Ok(())
    }

    /// Close the session and wait for the receive loop to stop.
    ///
    /// A running transfer is not joined; it fails with a closed channel.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let _guard = self.lifecycle.lock().await;

        let Some(session) = self.active.lock().take() else {
            return Err(SessionError::NotConnected);
        };
        let was_open = session.state().is_open();

        session.apply(ModemEvent::Disconnect).await?;
        // Also covers a session that already failed
        session.shutdown.cancel();
        session.channel.close().await;

        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "receive loop ended abnormally");
            }
        }
        info!(session = %session.id, "session closed");

        if was_open {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Dial `number` (`ATD<number>`)
    pub async fn dial(&self, number: &str) -> Result<(), SessionError> {
        self.command(ModemCommand::Dial(number.to_string())).await
    }

    /// Answer an incoming call (`ATA`)
    pub async fn answer(&self) -> Result<(), SessionError> {
        self.command(ModemCommand::Answer).await
    }

    /// Hang up (`ATH`); the state changes only when NO CARRIER arrives
    pub async fn hangup(&self) -> Result<(), SessionError> {
        self.command(ModemCommand::Hangup).await
    }

    /// Send a line verbatim. Empty text is ignored.
    pub async fn send_line(&self, text: &str) -> Result<(), SessionError> {
        if text.is_empty() {
            return Ok(());
        }
        self.command(ModemCommand::SendLine(text.to_string())).await
    }

    /// Start a transfer on its own task.
    ///
    /// Rejected when no session is open, when a transfer is already running,
    /// or before CONNECT unless the settings allow it. While the transfer
    /// runs, commands fail with [`SessionError::TransferInProgress`].
    pub fn start_transfer(&self, request: TransferRequest) -> Result<JoinHandle<TransferOutcome>, SessionError> {
        let session = self.open_session()?;
        if !session.state().is_data_mode() && !self.settings.allow_transfer_in_command_mode {
            return Err(SessionError::NotInDataMode);
        }
        if session
            .transfer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::TransferInProgress);
        }

        let progress_sink = session.sink.clone();
        let engine = XmodemEngine::new(self.xmodem.clone())
            .file_name(request.file_name())
            .on_progress(move |progress| progress_sink.on_transfer_progress(progress));

        let span = tracing::info_span!("transfer", session = %session.id, direction = %request.direction);
        Ok(tokio::spawn(run_transfer(session, engine, request).instrument(span)))
    }

    /// Current state (`Closed` without a session)
    pub fn state(&self) -> SessionState {
        self.current().map(|s| s.state()).unwrap_or(SessionState::Closed)
    }

    /// Operator actions allowed right now
    pub fn capabilities(&self) -> Capabilities {
        let Some(session) = self.current() else {
            return Capabilities::default();
        };
        let mut caps = session.state().capabilities();
        if session.transfer_active.load(Ordering::Acquire) {
            caps = Capabilities::default();
        } else if self.settings.allow_transfer_in_command_mode && session.state().is_open() {
            caps.transfer = true;
        }
        caps
    }

    /// True while a transfer owns the channel
    pub fn transfer_active(&self) -> bool {
        self.current()
            .map(|s| s.transfer_active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Name of the open port
    pub fn port_name(&self) -> Option<String> {
        self.current().filter(|s| s.state().is_open()).map(|s| s.port.clone())
    }

    /// Id of the current session
    pub fn session_id(&self) -> Option<Uuid> {
        self.current().map(|s| s.id)
    }

    fn current(&self) -> Option<Arc<ActiveSession>> {
        self.active.lock().clone()
    }

    fn open_session(&self) -> Result<Arc<ActiveSession>, SessionError> {
        match self.current() {
            Some(session) if session.state().is_open() => Ok(session),
            _ => Err(SessionError::NotConnected),
        }
    }

    async fn command(&self, command: ModemCommand) -> Result<(), SessionError> {
        let session = self.open_session()?;
        if session.transfer_active.load(Ordering::Acquire) {
            return Err(SessionError::TransferInProgress);
        }

        if let Err(e) = session.apply(ModemEvent::Command(command)).await {
            session.fail(e.to_string()).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop a session that closed on its own
    async fn reap(&self) {
        let stale = self.active.lock().take();
        let task = self.receive_task.lock().take();
        if let Some(session) = stale {
            session.shutdown.cancel();
            session.channel.close().await;
        }
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            session.shutdown.cancel();
        }
    }
}

async fn receive_loop(session: Arc<ActiveSession>, mut classifier: LineClassifier, poll: Duration) {
    debug!("receive loop started");

    loop {
        if session.shutdown.is_cancelled() {
            break;
        }
        if session.transfer_active.load(Ordering::Acquire) {
            // A partial line read before the transfer began is protocol noise
            classifier.reset();
            tokio::select! {
                _ = session.shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => continue,
            }
        }

        let lease = tokio::select! {
            _ = session.shutdown.cancelled() => break,
            lease = session.read_lease.lock() => lease,
        };
        if session.transfer_active.load(Ordering::Acquire) {
            classifier.reset();
            continue;
        }
        let result = session.channel.read(READ_CHUNK, poll).await;
        drop(lease);

        match result {
            Ok(data) => {
                for line in classifier.push(&data) {
                    trace!(line = line.text(), kind = ?line.kind(), "line received");
                    if let Err(e) = session.apply(ModemEvent::Line(line)).await {
                        session.fail(e.to_string()).await;
                        return;
                    }
                }
            }
            Err(_) if session.shutdown.is_cancelled() => break,
            Err(e) => {
                session.fail(e.to_string()).await;
                break;
            }
        }
    }

    debug!("receive loop stopped");
}

async fn run_transfer(session: Arc<ActiveSession>, engine: XmodemEngine, request: TransferRequest) -> TransferOutcome {
    let lease = session.read_lease.clone().lock_owned().await;
    session.sink.on_log(
        &format!("Starting XMODEM {} of {}", request.direction, request.file_name()),
        LogCategory::Transfer,
    );

    let channel = session.channel.as_ref();
    let result = match request.direction {
        TransferDirection::Send => send_file(&engine, channel, &request.path).await,
        TransferDirection::Receive => receive_file(&engine, channel, &request.path).await,
    };

    drop(lease);
    session.transfer_active.store(false, Ordering::Release);

    let outcome = TransferOutcome::from(result);
    match &outcome {
        TransferOutcome::Success(summary) => session.sink.on_log(
            &format!(
                "Transfer complete: {} ({} blocks, {} bytes)",
                request.file_name(),
                summary.blocks,
                summary.bytes
            ),
            LogCategory::Transfer,
        ),
        TransferOutcome::Failure(e) => session.sink.on_log(&format!("Transfer failed: {e}"), LogCategory::Error),
    }
    session.sink.on_transfer_outcome(request.direction, &outcome);

    if let Some(TransferError::Channel(e)) = outcome.error() {
        session.fail(e.to_string()).await;
    }
    outcome
}

async fn send_file(engine: &XmodemEngine, channel: &dyn ByteChannel, path: &Path) -> Result<TransferSummary, TransferError> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    engine.send(channel, &mut reader).await
}

/// Receive into `<target>.part` and rename it onto `target` on success
async fn receive_file(
    engine: &XmodemEngine,
    channel: &dyn ByteChannel,
    target: &Path,
) -> Result<TransferSummary, TransferError> {
    let part = part_path(target);
    let file = tokio::fs::File::create(&part).await?;
    let mut writer = tokio::io::BufWriter::new(file);
    let result = engine.receive(channel, &mut writer).await;
    drop(writer);

    let committed = match result {
        Ok(summary) => tokio::fs::rename(&part, target).await.map(|_| summary).map_err(TransferError::from),
        Err(e) => Err(e),
    };
    if committed.is_err() {
        if let Err(e) = tokio::fs::remove_file(&part).await {
            debug!(path = %part.display(), error = %e, "could not remove partial file");
        }
    }
    committed
}

/// `<path>.part`
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
