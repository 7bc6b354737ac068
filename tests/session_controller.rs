//! Session controller tests against a scripted modem on a loopback channel

use async_trait::async_trait;
use mockall::predicate::eq;
use mockall::{mock, Sequence};
use modemlink_core::core::transfer::xmodem::{CAN, NAK};
use modemlink_core::core::transfer::BLOCK_SIZE;
use modemlink_core::{
    ByteChannel, ChannelError, EventSink, LogCategory, NotificationSink, PortOpener, SessionController, SessionError,
    SessionEvent, SessionSettings, SessionState, StreamChannel, TransferDirection, TransferError, TransferOutcome,
    TransferProgress, TransferRequest, XmodemConfig, XmodemEngine,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc::UnboundedReceiver;

type Modem = StreamChannel<DuplexStream>;

/// Hands out one end of a loopback pair and keeps the other as the "modem"
#[derive(Default)]
struct LoopbackOpener {
    modems: Mutex<Vec<Modem>>,
}

impl LoopbackOpener {
    fn take_modem(&self) -> Modem {
        self.modems.lock().unwrap().pop().expect("no port opened")
    }
}

#[async_trait]
impl PortOpener for LoopbackOpener {
    async fn open(&self, port: &str, _baud_rate: u32) -> Result<Arc<dyn ByteChannel>, ChannelError> {
        if port == "missing" {
            return Err(ChannelError::PortNotFound(port.to_string()));
        }
        let (local, modem) = StreamChannel::loopback(port, "modem", 4096);
        self.modems.lock().unwrap().push(modem);
        Ok(Arc::new(local))
    }
}

fn xmodem_config() -> XmodemConfig {
    XmodemConfig {
        retry_limit: 5,
        block_timeout_ms: 1_000,
        start_timeout_ms: 5_000,
        start_nak_interval_ms: 500,
        purge_quiet_ms: 50,
        pad_byte: 0x00,
    }
}

fn controller_with(settings: SessionSettings, sink: Arc<dyn NotificationSink>) -> (SessionController, Arc<LoopbackOpener>) {
    let opener = Arc::new(LoopbackOpener::default());
    let controller = SessionController::new(settings, xmodem_config(), opener.clone(), sink);
    (controller, opener)
}

async fn connected() -> (SessionController, Modem, UnboundedReceiver<SessionEvent>) {
    let (sink, events) = EventSink::channel();
    let (controller, opener) = controller_with(SessionSettings::default(), Arc::new(sink));
    controller.connect("COM1", 9600).await.unwrap();
    (controller, opener.take_modem(), events)
}

async fn in_data_mode() -> (SessionController, Modem, UnboundedReceiver<SessionEvent>) {
    let (controller, modem, mut events) = connected().await;
    modem.write(b"CONNECT 33600\r\n").await.unwrap();
    wait_for_state(&controller, SessionState::DataMode).await;
    while next_log(&mut events).await.0 != "Connection established" {}
    drain(&mut events);
    (controller, modem, events)
}

async fn wait_for_state(controller: &SessionController, state: SessionState) {
    for _ in 0..100 {
        if controller.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("state stayed {} instead of {}", controller.state(), state);
}

/// Wait for the next log line, skipping other events
async fn next_log(events: &mut UnboundedReceiver<SessionEvent>) -> (String, LogCategory) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("no log line arrived")
            .expect("event channel closed");
        if let SessionEvent::Log { text, category } = event {
            return (text, category);
        }
    }
}

fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

async fn read_line(modem: &Modem) -> Vec<u8> {
    let mut buf = Vec::new();
    while !buf.ends_with(b"\r\n") {
        let data = modem.read(64, Duration::from_secs(2)).await.unwrap();
        assert!(!data.is_empty(), "nothing written to the modem, got {buf:?}");
        buf.extend_from_slice(&data);
    }
    buf
}

#[tokio::test]
async fn connect_enters_command_mode() {
    let (controller, _modem, mut events) = connected().await;

    assert_eq!(controller.state(), SessionState::CommandMode);
    assert_eq!(controller.port_name().as_deref(), Some("COM1"));
    assert!(controller.capabilities().dial);
    assert!(!controller.capabilities().transfer);

    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::StateChanged(SessionState::CommandMode)
    );
    assert_eq!(next_log(&mut events).await, ("Connected to COM1".to_string(), LogCategory::Info));

    assert!(matches!(
        controller.connect("COM2", 9600).await,
        Err(SessionError::AlreadyConnected(port)) if port == "COM1"
    ));
}

#[tokio::test]
async fn dial_then_connect() {
    let (controller, modem, mut events) = connected().await;
    drain(&mut events);

    controller.dial("5551234").await.unwrap();
    assert_eq!(read_line(&modem).await, b"ATD5551234\r\n");
    assert_eq!(next_log(&mut events).await, ("Sent: ATD5551234".to_string(), LogCategory::Sent));
    // Dialing alone does not change the mode
    assert_eq!(controller.state(), SessionState::CommandMode);

    modem.write(b"\r\nCONNECT 33600\r\n").await.unwrap();
    wait_for_state(&controller, SessionState::DataMode).await;

    let caps = controller.capabilities();
    assert!(caps.transfer && caps.hangup);
    assert_eq!(next_log(&mut events).await, ("Connection established".to_string(), LogCategory::Info));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let logged: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Log { text, .. } => Some(text),
            _ => None,
        })
        .collect();
    assert!(logged.iter().all(|t| !t.contains("CONNECT")), "{logged:?}");
}

#[tokio::test]
async fn modem_lines_are_labelled_by_mode() {
    let (controller, modem, mut events) = connected().await;
    drain(&mut events);

    modem.write(b"OK\r\n").await.unwrap();
    assert_eq!(next_log(&mut events).await, ("Received: OK".to_string(), LogCategory::ModemResponse));

    modem.write(b"CONNECT\r\n").await.unwrap();
    wait_for_state(&controller, SessionState::DataMode).await;
    assert_eq!(next_log(&mut events).await.0, "Connection established");

    modem.write(b"hello operator\r\n").await.unwrap();
    assert_eq!(
        next_log(&mut events).await,
        ("Remote: hello operator".to_string(), LogCategory::RemoteChat)
    );
}

#[tokio::test]
async fn hangup_waits_for_no_carrier() {
    let (controller, modem, mut events) = in_data_mode().await;

    controller.hangup().await.unwrap();
    assert_eq!(read_line(&modem).await, b"ATH\r\n");
    assert_eq!(controller.state(), SessionState::DataMode);

    modem.write(b"NO CARRIER\r\n").await.unwrap();
    wait_for_state(&controller, SessionState::CommandMode).await;
    assert_eq!(next_log(&mut events).await.0, "Sent: ATH");
    assert_eq!(next_log(&mut events).await, ("Connection dropped".to_string(), LogCategory::Info));
    assert!(!controller.capabilities().transfer);
}

#[tokio::test]
async fn send_line_and_answer() {
    let (controller, modem, _events) = connected().await;

    controller.send_line("ATZ").await.unwrap();
    assert_eq!(read_line(&modem).await, b"ATZ\r\n");

    controller.send_line("").await.unwrap();
    controller.answer().await.unwrap();
    assert_eq!(read_line(&modem).await, b"ATA\r\n");
}

#[tokio::test]
async fn transfer_requires_data_mode() {
    let (controller, _modem, _events) = connected().await;
    assert!(matches!(
        controller.start_transfer(TransferRequest::send("whatever.bin")),
        Err(SessionError::NotInDataMode)
    ));
}

#[tokio::test]
async fn direct_link_allows_transfer_in_command_mode() {
    let (sink, _events) = EventSink::channel();
    let settings = SessionSettings {
        allow_transfer_in_command_mode: true,
        ..SessionSettings::default()
    };
    let (controller, opener) = controller_with(settings, Arc::new(sink));
    controller.connect("COM1", 9600).await.unwrap();
    let modem = opener.take_modem();
    assert!(controller.capabilities().transfer);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");
    std::fs::write(&path, b"direct").unwrap();

    let handle = controller.start_transfer(TransferRequest::send(&path)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut received = Vec::new();
    XmodemEngine::new(xmodem_config()).receive(&modem, &mut received).await.unwrap();

    assert!(handle.await.unwrap().is_success());
    assert_eq!(&received[..6], b"direct");
}

#[tokio::test]
async fn send_transfer_blocks_commands_until_done() {
    let (controller, modem, mut events) = in_data_mode().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.txt");
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 200) as u8).collect();
    std::fs::write(&path, &data).unwrap();

    let handle = controller.start_transfer(TransferRequest::send(&path)).unwrap();
    assert!(controller.transfer_active());
    assert!(matches!(controller.dial("1").await, Err(SessionError::TransferInProgress)));
    assert!(matches!(controller.send_line("hi").await, Err(SessionError::TransferInProgress)));
    assert!(matches!(
        controller.start_transfer(TransferRequest::send(&path)),
        Err(SessionError::TransferInProgress)
    ));

    // Give the transfer task the channel before the remote side starts
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut received = Vec::new();
    let summary = XmodemEngine::new(xmodem_config())
        .receive(&modem, &mut received)
        .await
        .unwrap();

    let outcome = handle.await.unwrap();
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(summary.blocks, 8);
    assert_eq!(&received[..data.len()], &data[..]);
    assert!(!controller.transfer_active());

    let finished = drain(&mut events).into_iter().any(|e| {
        matches!(
            e,
            SessionEvent::TransferFinished {
                direction: TransferDirection::Send,
                result: Ok(_)
            }
        )
    });
    assert!(finished);

    // Line mode resumes
    modem.write(b"NO CARRIER\r\n").await.unwrap();
    wait_for_state(&controller, SessionState::CommandMode).await;
    controller.dial("5551234").await.unwrap();
    assert_eq!(read_line(&modem).await, b"ATD5551234\r\n");
}

#[tokio::test]
async fn partial_line_before_transfer_is_dropped() {
    let (controller, modem, mut events) = in_data_mode().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("note.txt");
    std::fs::write(&path, b"short note").unwrap();

    // Unterminated text is sitting in the line buffer when the transfer starts
    modem.write(b"garbage").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let handle = controller.start_transfer(TransferRequest::send(&path)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut received = Vec::new();
    XmodemEngine::new(xmodem_config())
        .receive(&modem, &mut received)
        .await
        .unwrap();
    assert!(handle.await.unwrap().is_success());
    drain(&mut events);

    modem.write(b"hello\r\n").await.unwrap();
    assert_eq!(
        next_log(&mut events).await,
        ("Remote: hello".to_string(), LogCategory::RemoteChat)
    );
}

#[tokio::test]
async fn receive_transfer_commits_file() {
    let (controller, modem, _events) = in_data_mode().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("incoming.dat");

    let handle = controller.start_transfer(TransferRequest::receive(&target)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let payload = vec![0x5Au8; 2 * BLOCK_SIZE + 3];
    let mut source = payload.as_slice();
    XmodemEngine::new(xmodem_config()).send(&modem, &mut source).await.unwrap();

    let outcome = handle.await.unwrap();
    assert!(outcome.is_success(), "{outcome:?}");

    let written = std::fs::read(&target).unwrap();
    assert_eq!(written.len(), 3 * BLOCK_SIZE);
    assert_eq!(&written[..payload.len()], &payload[..]);
    assert!(!dir.path().join("incoming.dat.part").exists());
}

#[tokio::test]
async fn failed_receive_leaves_no_file() {
    let (controller, modem, mut events) = in_data_mode().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("incoming.dat");

    let handle = controller.start_transfer(TransferRequest::receive(&target)).unwrap();
    let first = modem.read(1, Duration::from_secs(3)).await.unwrap();
    assert_eq!(&first[..], &[NAK]);
    modem.write(&[CAN, CAN, CAN]).await.unwrap();

    match handle.await.unwrap() {
        TransferOutcome::Failure(TransferError::Cancelled) => {}
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!target.exists());
    assert!(!dir.path().join("incoming.dat.part").exists());

    // Protocol failure keeps the call up
    assert_eq!(controller.state(), SessionState::DataMode);
    let errors: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Log { category: LogCategory::Error, .. }))
        .collect();
    assert_eq!(errors.len(), 1);
}

#[tokio::test]
async fn missing_source_file_fails_transfer() {
    let (controller, _modem, _events) = in_data_mode().await;
    let handle = controller
        .start_transfer(TransferRequest::send("/nonexistent/dir/file.bin"))
        .unwrap();

    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, TransferOutcome::Failure(TransferError::Io(_))));
    assert!(!controller.transfer_active());
    assert_eq!(controller.state(), SessionState::DataMode);
}

#[tokio::test]
async fn disconnect_closes_everything() {
    let (controller, modem, mut events) = in_data_mode().await;

    controller.disconnect().await.unwrap();
    assert_eq!(controller.state(), SessionState::Closed);
    assert!(controller.port_name().is_none());

    let seen = drain(&mut events);
    assert!(seen.contains(&SessionEvent::StateChanged(SessionState::Closed)));
    assert!(seen.contains(&SessionEvent::Log {
        text: "Disconnected.".into(),
        category: LogCategory::Info
    }));

    assert!(matches!(
        modem.read(16, Duration::from_secs(1)).await,
        Err(ChannelError::Closed)
    ));
    assert!(matches!(controller.hangup().await, Err(SessionError::NotConnected)));
    assert!(matches!(controller.disconnect().await, Err(SessionError::NotConnected)));
}

#[tokio::test]
async fn disconnect_fails_running_transfer() {
    let (controller, _modem, _events) = in_data_mode().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("never.bin");

    let handle = controller.start_transfer(TransferRequest::receive(&target)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.disconnect().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("transfer hung after disconnect")
        .unwrap();
    assert!(matches!(outcome, TransferOutcome::Failure(TransferError::ChannelClosed)));
    assert!(!target.exists());
}

#[tokio::test]
async fn lost_port_ends_session() {
    let (controller, modem, mut events) = in_data_mode().await;

    drop(modem);
    wait_for_state(&controller, SessionState::Closed).await;

    let (text, category) = next_log(&mut events).await;
    assert!(text.starts_with("Connection error:"), "{text}");
    assert_eq!(category, LogCategory::Error);
    assert_eq!(next_log(&mut events).await.0, "Disconnected.");

    // A fresh connect replaces the dead session
    controller.connect("COM1", 9600).await.unwrap();
    assert_eq!(controller.state(), SessionState::CommandMode);
}

#[tokio::test]
async fn open_failure_is_reported() {
    let (sink, mut events) = EventSink::channel();
    let (controller, _opener) = controller_with(SessionSettings::default(), Arc::new(sink));

    let err = controller.connect("missing", 9600).await.unwrap_err();
    assert!(matches!(err, SessionError::Channel(ChannelError::PortNotFound(_))));
    assert_eq!(controller.state(), SessionState::Closed);

    let (text, category) = next_log(&mut events).await;
    assert!(text.starts_with("Connection failed"));
    assert_eq!(category, LogCategory::Error);
}

mock! {
    Sink {}

    impl NotificationSink for Sink {
        fn on_log(&self, text: &str, category: LogCategory);
        fn on_state_change(&self, state: SessionState);
        fn on_transfer_progress(&self, progress: &TransferProgress);
        fn on_transfer_outcome(&self, direction: TransferDirection, outcome: &TransferOutcome);
    }
}

#[tokio::test]
async fn notifications_arrive_in_order() {
    let mut sink = MockSink::new();
    let mut seq = Sequence::new();

    sink.expect_on_state_change()
        .with(eq(SessionState::CommandMode))
        .times(1)
        .in_sequence(&mut seq)
        .return_const(());
    sink.expect_on_log()
        .withf(|text, category| text.contains("Connected to COM7") && *category == LogCategory::Info)
        .times(1)
        .in_sequence(&mut seq)
        .return_const(());
    sink.expect_on_log()
        .withf(|text, category| text.contains("Sent: ATH") && *category == LogCategory::Sent)
        .times(1)
        .in_sequence(&mut seq)
        .return_const(());
    sink.expect_on_state_change()
        .with(eq(SessionState::Closed))
        .times(1)
        .in_sequence(&mut seq)
        .return_const(());
    sink.expect_on_log()
        .withf(|text, _| text.contains("Disconnected."))
        .times(1)
        .in_sequence(&mut seq)
        .return_const(());
    sink.expect_on_transfer_outcome().never();

    let (controller, _opener) = controller_with(SessionSettings::default(), Arc::new(sink));
    controller.connect("COM7", 9600).await.unwrap();
    controller.hangup().await.unwrap();
    controller.disconnect().await.unwrap();
}
