//! Channel management
//!
//! A [`Channel`] is one open interface. Sends are queued to a background
//! writer task; configuration changes go through the same queue so bytes
//! queued before a `configure` leave with the old settings.

use super::line::{BaudRate, DataBits, LineConfig, Parity};
use super::uart::LineErrors;
use super::{Interface, LinkBackend, LinkFactory, Received, TransportError};
use crate::core::logger::{SharedTrafficLog, TrafficLog};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Interval between input polls while waiting for data
const POLL_INTERVAL: Duration = Duration::from_millis(5);

type SharedLink = Arc<Mutex<Option<Box<dyn LinkBackend>>>>;

/// Channel statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Write calls on the link
    pub packets_sent: u64,
    /// Non-empty reads from the link
    pub packets_received: u64,
    /// Characters received with a parity error
    pub parity_errors: u64,
    /// Characters received with a framing error
    pub framing_errors: u64,
    /// Failed background writes
    pub write_errors: u64,
    /// Line configuration changes
    pub reconfigurations: u64,
}

/// Outcome of an echo exchange
#[derive(Debug, Clone, Serialize)]
pub struct Echo {
    /// Payload sent
    pub sent: Vec<u8>,
    /// Bytes read back
    pub received: Vec<u8>,
    /// Line errors detected while reading
    pub errors: LineErrors,
    /// Received bytes equal the payload and no line error was seen
    pub matched: bool,
    /// Gave up waiting
    pub timed_out: bool,
    /// Time from send to verdict
    pub elapsed_ms: u64,
}

enum ChannelCommand {
    Write(Bytes),
    Apply(LineConfig, oneshot::Sender<Result<(), TransportError>>),
    Sync(oneshot::Sender<()>),
}

/// Opens channels and enforces one channel per interface
#[derive(Clone)]
pub struct TransportManager {
    factory: Arc<dyn LinkFactory>,
    open: Arc<Mutex<HashSet<Interface>>>,
    log_capacity: usize,
}

impl TransportManager {
    /// Create a manager over a link factory
    pub fn new(factory: impl LinkFactory + 'static) -> Self {
        Self::from_shared(Arc::new(factory))
    }

    /// Create a manager over a shared link factory
    pub fn from_shared(factory: Arc<dyn LinkFactory>) -> Self {
        Self {
            factory,
            open: Arc::new(Mutex::new(HashSet::new())),
            log_capacity: 10_000,
        }
    }

    /// Set traffic log capacity for channels opened afterwards
    #[must_use]
    pub fn log_capacity(mut self, entries: usize) -> Self {
        self.log_capacity = entries;
        self
    }

    /// Whether a channel is open on an interface
    pub fn is_open(&self, interface: Interface) -> bool {
        self.open.lock().contains(&interface)
    }

    /// Open a channel configured to [`LineConfig::DEFAULT`]
    pub async fn open(&self, interface: Interface) -> Result<Channel, TransportError> {
        let mut registry = self.open.lock();
        if registry.contains(&interface) {
            return Err(TransportError::AlreadyOpen(interface));
        }

        let mut link = self.factory.connect(interface)?;
        if let Err(e) = link.apply(&LineConfig::DEFAULT) {
            let _ = link.shutdown();
            return Err(e);
        }
        let description = link.describe();
        registry.insert(interface);
        drop(registry);

        info!("Opened {} channel ({})", interface, description);

        let link: SharedLink = Arc::new(Mutex::new(Some(link)));
        let stats = Arc::new(RwLock::new(ChannelStats::default()));
        let write_error = Arc::new(Mutex::new(None));
        let log = TrafficLog::shared(self.log_capacity);
        log.lock().log_info(&format!("open {interface} {description}"));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            interface,
            link.clone(),
            cmd_rx,
            stats.clone(),
            write_error.clone(),
            log.clone(),
        ));

        Ok(Channel {
            interface,
            config: LineConfig::DEFAULT,
            link,
            cmd_tx: Some(cmd_tx),
            writer: Some(writer),
            stats,
            write_error,
            log,
            registry: self.open.clone(),
        })
    }
}

async fn run_writer(
    interface: Interface,
    link: SharedLink,
    mut rx: mpsc::UnboundedReceiver<ChannelCommand>,
    stats: Arc<RwLock<ChannelStats>>,
    write_error: Arc<Mutex<Option<String>>>,
    log: SharedTrafficLog,
) {
    while let Some(command) = rx.recv().await {
        match command {
            ChannelCommand::Write(data) => {
                let result = match link.lock().as_mut() {
                    Some(link) => link.write(&data),
                    None => Err(TransportError::AlreadyClosed(interface)),
                };
                match result {
                    Ok(written) => {
                        debug!("{} TX {}", interface, hex::encode_upper(&data));
                        log.lock().log_tx(&data);
                        let mut stats = stats.write();
                        stats.bytes_sent += written as u64;
                        stats.packets_sent += 1;
                    }
                    Err(e) => {
                        warn!("{} write failed: {}", interface, e);
                        stats.write().write_errors += 1;
                        write_error.lock().get_or_insert_with(|| e.to_string());
                    }
                }
            }
            ChannelCommand::Apply(config, reply) => {
                let result = match link.lock().as_mut() {
                    Some(link) => link.apply(&config),
                    None => Err(TransportError::AlreadyClosed(interface)),
                };
                let _ = reply.send(result);
            }
            ChannelCommand::Sync(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

/// One open interface to the device under test
pub struct Channel {
    interface: Interface,
    config: LineConfig,
    link: SharedLink,
    cmd_tx: Option<mpsc::UnboundedSender<ChannelCommand>>,
    writer: Option<JoinHandle<()>>,
    stats: Arc<RwLock<ChannelStats>>,
    write_error: Arc<Mutex<Option<String>>>,
    log: SharedTrafficLog,
    registry: Arc<Mutex<HashSet<Interface>>>,
}

impl Channel {
    /// Interface this channel drives
    pub fn interface(&self) -> Interface {
        self.interface
    }

    /// Current test-system line configuration
    pub fn config(&self) -> LineConfig {
        self.config
    }

    /// Whether the channel is still open
    pub fn is_open(&self) -> bool {
        self.cmd_tx.is_some()
    }

    /// Channel statistics
    pub fn stats(&self) -> ChannelStats {
        self.stats.read().clone()
    }

    /// Wire traffic recorded on this channel
    pub fn traffic_log(&self) -> SharedTrafficLog {
        self.log.clone()
    }

    /// Description of the underlying resource
    pub fn describe(&self) -> String {
        match self.link.lock().as_ref() {
            Some(link) => link.describe(),
            None => format!("{} (closed)", self.interface),
        }
    }

    fn sender(&self) -> Result<&mpsc::UnboundedSender<ChannelCommand>, TransportError> {
        self.cmd_tx
            .as_ref()
            .ok_or(TransportError::AlreadyClosed(self.interface))
    }

    fn take_write_error(&self) -> Result<(), TransportError> {
        match self.write_error.lock().take() {
            Some(reason) => Err(TransportError::WriteFailed {
                interface: self.interface,
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Apply line parameters on the test-system side
    ///
    /// Bytes already queued are transmitted with the previous configuration.
    pub async fn configure(&mut self, config: LineConfig) -> Result<(), TransportError> {
        self.interface.validate(&config)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .send(ChannelCommand::Apply(config, reply_tx))
            .map_err(|_| TransportError::AlreadyClosed(self.interface))?;
        reply_rx
            .await
            .map_err(|_| TransportError::AlreadyClosed(self.interface))??;

        if config != self.config {
            info!("{} line {} -> {}", self.interface, self.config, config);
            self.log
                .lock()
                .log_info(&format!("configure {} -> {}", self.config, config));
            self.stats.write().reconfigurations += 1;
        }
        self.config = config;
        Ok(())
    }

    /// Apply baud rate, data bits and parity, keeping the flow control setting
    pub async fn configure_line(
        &mut self,
        baud_rate: BaudRate,
        data_bits: DataBits,
        parity: Parity,
    ) -> Result<(), TransportError> {
        let config = LineConfig::new(baud_rate, data_bits, parity).flow_control(self.config.flow_control);
        self.configure(config).await
    }

    /// Queue a payload for transmission and return immediately
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), TransportError> {
        let sender = self.sender()?;
        self.take_write_error()?;
        sender
            .send(ChannelCommand::Write(payload.into()))
            .map_err(|_| TransportError::AlreadyClosed(self.interface))
    }

    /// Wait until every queued payload has been written
    pub async fn flush(&self) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .send(ChannelCommand::Sync(reply_tx))
            .map_err(|_| TransportError::AlreadyClosed(self.interface))?;
        reply_rx
            .await
            .map_err(|_| TransportError::AlreadyClosed(self.interface))?;
        self.take_write_error()
    }

    /// Drop unread input
    pub fn discard_input(&self) -> Result<(), TransportError> {
        self.sender()?;
        match self.link.lock().as_mut() {
            Some(link) => link.discard_input(),
            None => Err(TransportError::AlreadyClosed(self.interface)),
        }
    }

    /// Read whatever is available now
    pub fn try_receive(&self) -> Result<Received, TransportError> {
        self.sender()?;
        let received = match self.link.lock().as_mut() {
            Some(link) => link.read()?,
            None => return Err(TransportError::AlreadyClosed(self.interface)),
        };

        if !received.is_empty() {
            let errors = received.errors;
            {
                let mut stats = self.stats.write();
                stats.bytes_received += received.data.len() as u64;
                stats.packets_received += 1;
                stats.parity_errors += u64::from(errors.parity);
                stats.framing_errors += u64::from(errors.framing);
            }

            debug!("{} RX {}", self.interface, hex::encode_upper(&received.data));
            if errors.is_clean() {
                self.log.lock().log_rx(&received.data, None);
            } else {
                warn!(
                    "{} line errors: {} parity, {} framing",
                    self.interface, errors.parity, errors.framing
                );
                let note = format!("parity {} framing {}", errors.parity, errors.framing);
                self.log.lock().log_rx(&received.data, Some(&note));
            }
        }

        Ok(received)
    }

    /// Collect everything that arrives within `wait`
    pub async fn receive(&self, wait: Duration) -> Result<Received, TransportError> {
        let deadline = Instant::now() + wait;
        let mut data = BytesMut::new();
        let mut errors = LineErrors::default();

        loop {
            let chunk = self.try_receive()?;
            data.extend_from_slice(&chunk.data);
            errors += chunk.errors;

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Ok(Received {
            data: data.freeze(),
            errors,
        })
    }

    /// Read until `terminator` arrives or `timeout` elapses
    ///
    /// Returns what was read, terminator included when seen.
    pub async fn read_until(&self, terminator: u8, timeout: Duration) -> Result<Received, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut data = BytesMut::new();
        let mut errors = LineErrors::default();

        loop {
            let chunk = self.try_receive()?;
            data.extend_from_slice(&chunk.data);
            errors += chunk.errors;

            if data.contains(&terminator) || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Ok(Received {
            data: data.freeze(),
            errors,
        })
    }

    /// Send a payload and wait for the device to echo it back
    ///
    /// Stale input is discarded first. Waiting stops at the first byte that
    /// differs from the payload, at the first detected line error, or at the
    /// timeout. A timeout is an outcome, not an error.
    pub async fn exchange(&self, payload: &[u8], timeout: Duration) -> Result<Echo, TransportError> {
        self.flush().await?;
        self.discard_input()?;

        let started = Instant::now();
        let deadline = started + timeout;
        self.send(Bytes::copy_from_slice(payload))?;
        self.flush().await?;

        let mut received = BytesMut::new();
        let mut errors = LineErrors::default();
        let mut timed_out = false;

        loop {
            let chunk = self.try_receive()?;
            received.extend_from_slice(&chunk.data);
            errors += chunk.errors;

            let diverged = received.len() > payload.len() || !payload.starts_with(&received);
            if !errors.is_clean() || diverged || received.len() == payload.len() {
                break;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let matched = !timed_out && errors.is_clean() && received[..] == *payload;
        let echo = Echo {
            sent: payload.to_vec(),
            received: received.to_vec(),
            errors,
            matched,
            timed_out,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        if matched {
            debug!("{} echo matched in {} ms", self.interface, echo.elapsed_ms);
        } else {
            info!(
                "{} echo failed at {}: sent {} got {} (timed out: {})",
                self.interface,
                self.config,
                hex::encode_upper(&echo.sent),
                hex::encode_upper(&echo.received),
                timed_out
            );
        }
        Ok(echo)
    }

    /// Send a payload and report whether the identical bytes came back
    pub async fn send_and_expect_echo(&self, payload: &[u8], timeout: Duration) -> Result<bool, TransportError> {
        Ok(self.exchange(payload, timeout).await?.matched)
    }

    /// Release the resource. Closing a closed channel is a no-op.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        let Some(cmd_tx) = self.cmd_tx.take() else {
            return Ok(());
        };

        // Drain queued writes before the writer sees the closed queue
        drop(cmd_tx);
        let mut result = Ok(());
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                warn!("{} writer task ended abnormally: {}", self.interface, e);
            }
        }
        if let Some(reason) = self.write_error.lock().take() {
            result = Err(TransportError::WriteFailed {
                interface: self.interface,
                reason,
            });
        }

        if let Some(mut link) = self.link.lock().take() {
            if let Err(e) = link.apply(&LineConfig::DEFAULT) {
                debug!("{} reset to default failed: {}", self.interface, e);
            }
            if let Err(e) = link.shutdown() {
                warn!("{} shutdown failed: {}", self.interface, e);
                result = result.and(Err(e));
            }
        }
        self.config = LineConfig::DEFAULT;
        self.registry.lock().remove(&self.interface);
        self.log.lock().log_info("close");
        info!("Closed {} channel", self.interface);

        result
    }

    /// Close, logging failures instead of returning them
    pub async fn teardown(mut self) {
        if let Err(e) = self.close().await {
            warn!("{} teardown: {}", self.interface, e);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.cmd_tx.take().is_none() {
            return;
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(mut link) = self.link.lock().take() {
            if let Err(e) = link.shutdown() {
                warn!("{} shutdown on drop failed: {}", self.interface, e);
            }
        }
        self.registry.lock().remove(&self.interface);
        debug!("Released {} channel on drop", self.interface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::emulated::{EmulatedDevice, EmulatedLink};
    use crate::core::transport::line::FrameFormat;
    use crate::core::transport::uart::DecodedChar;
    use crate::core::transport::{MockLinkBackend, MockLinkFactory};

    const TIMEOUT: Duration = Duration::from_millis(200);

    /// Echo device with a fixed RS232 configuration
    struct Echoer {
        config: Mutex<LineConfig>,
    }

    impl EmulatedDevice for Echoer {
        fn line_config(&self, interface: Interface) -> Option<LineConfig> {
            interface.has_line_settings().then(|| *self.config.lock())
        }

        fn receive(&self, _interface: Interface, chars: &[DecodedChar]) -> Vec<u8> {
            chars.iter().map(|c| c.value).collect()
        }
    }

    struct EchoBench(Arc<Echoer>);

    impl LinkFactory for EchoBench {
        fn connect(&self, interface: Interface) -> Result<Box<dyn LinkBackend>, TransportError> {
            Ok(Box::new(EmulatedLink::new(interface, self.0.clone())))
        }
    }

    fn bench(config: LineConfig) -> (TransportManager, Arc<Echoer>) {
        let device = Arc::new(Echoer {
            config: Mutex::new(config),
        });
        (TransportManager::new(EchoBench(device.clone())), device)
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_applies_default_and_echo_matches() {
        let (manager, _) = bench(LineConfig::DEFAULT);
        let mut channel = manager.open(Interface::Rs232).await.unwrap();
        assert_eq!(channel.config(), LineConfig::DEFAULT);
        assert!(channel.send_and_expect_echo(b"ping\n", TIMEOUT).await.unwrap());

        let stats = channel.stats();
        assert_eq!(stats.bytes_sent, 5);
        assert_eq!(stats.bytes_received, 5);
        channel.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_open_fails_until_close() {
        let (manager, _) = bench(LineConfig::DEFAULT);
        let mut first = manager.open(Interface::Rs232).await.unwrap();
        assert!(matches!(
            manager.open(Interface::Rs232).await,
            Err(TransportError::AlreadyOpen(Interface::Rs232))
        ));

        // Other interfaces are independent
        let usb = manager.open(Interface::Usb).await.unwrap();
        drop(usb);

        first.close().await.unwrap();
        assert!(!manager.is_open(Interface::Rs232));
        assert!(manager.open(Interface::Rs232).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let (manager, _) = bench(LineConfig::DEFAULT);
        let mut channel = manager.open(Interface::Usb).await.unwrap();
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert!(!channel.is_open());
        assert!(matches!(channel.send(&b"x"[..]), Err(TransportError::AlreadyClosed(_))));
        assert!(matches!(
            channel.configure(LineConfig::DEFAULT).await,
            Err(TransportError::AlreadyClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_interface() {
        let (manager, _) = bench(LineConfig::DEFAULT);
        {
            let _channel = manager.open(Interface::Infrared).await.unwrap();
            assert!(manager.is_open(Interface::Infrared));
        }
        assert!(!manager.is_open(Interface::Infrared));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatch_then_recovery_without_reopen() {
        let device_config = LineConfig::with_frame(BaudRate::B9600, FrameFormat::EIGHT_ODD);
        let (manager, _) = bench(device_config);
        let mut channel = manager.open(Interface::Rs232).await.unwrap();

        channel
            .configure(LineConfig::with_frame(BaudRate::B9600, FrameFormat::EIGHT_EVEN))
            .await
            .unwrap();
        let echo = channel.exchange(b"Martel\n", TIMEOUT).await.unwrap();
        assert!(!echo.matched);
        assert!(echo.errors.parity > 0);

        channel.configure(device_config).await.unwrap();
        assert!(channel.send_and_expect_echo(b"Martel\n", TIMEOUT).await.unwrap());
        assert!(channel.stats().parity_errors > 0);
        assert_eq!(channel.stats().reconfigurations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_baud_mismatch_never_matches() {
        let (manager, _) = bench(LineConfig::DEFAULT);
        let mut channel = manager.open(Interface::Rs232).await.unwrap();
        channel
            .configure_line(BaudRate::B19200, DataBits::Eight, Parity::None)
            .await
            .unwrap();
        assert!(!channel.send_and_expect_echo(b"hello world", TIMEOUT).await.unwrap());

        channel.configure(LineConfig::DEFAULT).await.unwrap();
        assert!(channel.send_and_expect_echo(b"hello world", TIMEOUT).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_configuration_keeps_channel() {
        let (manager, _) = bench(LineConfig::DEFAULT);
        let mut channel = manager.open(Interface::Infrared).await.unwrap();
        let seven = LineConfig::with_frame(BaudRate::B9600, FrameFormat::SEVEN_EVEN);
        assert!(matches!(
            channel.configure(seven).await,
            Err(TransportError::UnsupportedConfiguration { .. })
        ));
        assert_eq!(channel.config(), LineConfig::DEFAULT);
        assert!(channel.send_and_expect_echo(b"ok", TIMEOUT).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let mut factory = MockLinkFactory::new();
        factory.expect_connect().returning(|_| {
            let mut link = MockLinkBackend::new();
            link.expect_apply().returning(|_| Ok(()));
            link.expect_describe().return_const("mock".to_string());
            link.expect_write().returning(|data| Ok(data.len()));
            link.expect_discard_input().returning(|| Ok(()));
            link.expect_read().returning(|| Ok(Received::default()));
            link.expect_shutdown().times(1).returning(|| Ok(()));
            Ok(Box::new(link))
        });

        let manager = TransportManager::new(factory);
        let mut channel = manager.open(Interface::Rs232).await.unwrap();
        let echo = channel.exchange(b"ping", TIMEOUT).await.unwrap();
        assert!(echo.timed_out);
        assert!(!echo.matched);
        assert!(echo.received.is_empty());
        channel.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_interface() {
        let mut factory = MockLinkFactory::new();
        factory.expect_connect().returning(|interface| {
            Err(TransportError::InterfaceUnavailable {
                interface,
                reason: "not fitted".to_string(),
            })
        });

        let manager = TransportManager::new(factory);
        assert!(matches!(
            manager.open(Interface::Infrared).await,
            Err(TransportError::InterfaceUnavailable { .. })
        ));
        assert!(!manager.is_open(Interface::Infrared));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_surfaces_on_flush() {
        let mut factory = MockLinkFactory::new();
        factory.expect_connect().returning(|_| {
            let mut link = MockLinkBackend::new();
            link.expect_apply().returning(|_| Ok(()));
            link.expect_describe().return_const("mock".to_string());
            link.expect_write()
                .returning(|_| Err(std::io::Error::other("cable pulled").into()));
            link.expect_shutdown().returning(|| Ok(()));
            Ok(Box::new(link))
        });

        let manager = TransportManager::new(factory);
        let channel = manager.open(Interface::Rs232).await.unwrap();
        channel.send(&b"data"[..]).unwrap();
        let err = channel.flush().await.unwrap_err();
        assert!(matches!(err, TransportError::WriteFailed { .. }));
        assert_eq!(channel.stats().write_errors, 1);

        // Error is reported once
        assert!(channel.flush().await.is_ok());
        channel.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_is_logged() {
        let (manager, _) = bench(LineConfig::DEFAULT);
        let channel = manager.open(Interface::Usb).await.unwrap();
        channel.exchange(b"abc", TIMEOUT).await.unwrap();

        let log = channel.traffic_log();
        let text = log.lock().export(crate::core::logger::LogFormat::Text);
        assert!(text.contains("TX abc"));
        assert!(text.contains("RX abc"));
        channel.teardown().await;
    }
}
