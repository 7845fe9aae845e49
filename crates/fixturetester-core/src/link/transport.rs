//! Device links
//!
//! One [`TextLink`] (Arduino role) and one [`BinaryLink`] (STM32 role),
//! each owning a spawned reader task over an arbitrary async byte stream.
//! Reader tasks parse inbound traffic, record readings into the shared
//! [`ReadingStore`], complete GPIO confirmations, and publish a
//! `Disconnected` event when the stream dies. A dead link invalidates any
//! in-flight confirmation wait immediately instead of hanging it.
//!
//! Handshake probes live here too: during connect the workflow runs them
//! directly on the raw stream before a link (and its reader task) exists.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::TestLimits;
use crate::link::correlator::Correlator;
use crate::link::ports::DeviceIo;
use crate::profile::{DeviceProfile, DeviceRole};
use crate::protocol::frame::{self, opcode, ChannelMask, Frame, FrameDecoder, FRAME_LEN, HEADER};
use crate::protocol::text;
use crate::store::ReadingStore;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link to {0} is closed")]
    Closed(DeviceRole),
}

/// Handshake probe outcomes that are not a successful identification.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The port answered, but with the other role's protocol. Surfaced
    /// distinctly so callers can offer switching workflows instead of
    /// retrying.
    #[error("device answered with the other role's protocol")]
    WrongRole,
    #[error("no recognizable handshake reply")]
    NoReply,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events published by reader tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The stream hit EOF or an IO error; the link is unusable.
    Disconnected(DeviceRole),
}

/// STM32 firmware identification from the binary handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl std::fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// Handshake probes
// ---------------------------------------------------------------------------

/// Probe a candidate port for the text-protocol device.
///
/// Sends the identify command and accumulates the reply until a newline,
/// EOF, or the deadline. A reply that opens with the binary frame header
/// is the other role answering.
pub async fn probe_text(
    io: &mut DeviceIo,
    profile: &DeviceProfile,
    wait: Duration,
) -> Result<String, ProbeError> {
    io.write_all(text::ident_command(profile.text_ident_command).as_bytes())
        .await?;
    io.flush().await?;

    let buf = read_until_deadline(io, wait, |buf| buf.contains(&b'\n')).await?;

    if buf.windows(HEADER.len()).any(|w| w == HEADER) {
        return Err(ProbeError::WrongRole);
    }

    let reply = String::from_utf8_lossy(&buf);
    let line = reply.lines().next().unwrap_or("").trim();
    if line.contains(profile.text_signature) {
        debug!(ident = line, "text handshake succeeded");
        Ok(line.to_string())
    } else {
        Err(ProbeError::NoReply)
    }
}

/// Probe a candidate port for the binary-protocol device.
///
/// Sends a firmware query frame and decodes the reply. A reply that looks
/// like a text reading line is the other role answering.
pub async fn probe_binary(io: &mut DeviceIo, wait: Duration) -> Result<FirmwareInfo, ProbeError> {
    io.write_all(&frame::encode(opcode::FIRMWARE, [0; 4])).await?;
    io.flush().await?;

    let mut decoder = FrameDecoder::new();
    let mut firmware = None;
    let buf = read_until_deadline(io, wait, |chunk| {
        for f in decoder.push(chunk) {
            if f.opcode == opcode::FIRMWARE {
                firmware = Some(FirmwareInfo {
                    major: f.payload[0],
                    minor: f.payload[1],
                    patch: f.payload[2],
                });
            }
        }
        firmware.is_some()
    })
    .await?;

    if let Some(info) = firmware {
        debug!(firmware = %info, "binary handshake succeeded");
        return Ok(info);
    }
    if looks_like_text_protocol(&buf) {
        return Err(ProbeError::WrongRole);
    }
    Err(ProbeError::NoReply)
}

/// Accumulate reply bytes until `done(chunk)` reports completion, EOF, or
/// the deadline passes. The deadline path is not an error; the caller
/// decides what a partial buffer means.
async fn read_until_deadline(
    io: &mut DeviceIo,
    wait: Duration,
    mut done: impl FnMut(&[u8]) -> bool,
) -> Result<Vec<u8>, ProbeError> {
    let deadline = tokio::time::Instant::now() + wait;
    let mut buf = Vec::with_capacity(64);
    let mut chunk = [0u8; 64];

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, io.read(&mut chunk)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if done(&chunk[..n]) || buf.len() > 512 {
                    break;
                }
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(buf)
}

/// Heuristic for "the other role answered our binary probe": reading
/// lines are printable ASCII shaped `name(pin): value`.
fn looks_like_text_protocol(buf: &[u8]) -> bool {
    buf.contains(&b'(') && buf.contains(&b':') && buf.iter().all(|&b| b == b'\r' || b == b'\n' || (0x20..0x7F).contains(&b))
        && !buf.is_empty()
}

// ---------------------------------------------------------------------------
// Text link (Arduino role)
// ---------------------------------------------------------------------------

/// Line-oriented link to the text-protocol device.
pub struct TextLink {
    writer: Arc<Mutex<WriteHalf<DeviceIo>>>,
    read_token: String,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl TextLink {
    /// Take ownership of an identified stream and start the reader task.
    pub fn spawn(
        io: DeviceIo,
        profile: &DeviceProfile,
        store: ReadingStore,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(text_reader_loop(read_half, store, events, Arc::clone(&closed)));
        Self {
            writer: Arc::new(Mutex::new(write_half)),
            read_token: profile.text_read_token.to_string(),
            closed,
            reader,
        }
    }

    /// Request one channel reading.
    pub async fn send_read(&self, channel: u8) -> Result<(), LinkError> {
        let cmd = text::read_command(&self.read_token, channel);
        self.write_all(cmd.as_bytes()).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed(DeviceRole::Arduino));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for TextLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn text_reader_loop(
    read_half: ReadHalf<DeviceIo>,
    store: ReadingStore,
    events: mpsc::UnboundedSender<LinkEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match text::parse_line(&line) {
                Some(reading) => {
                    trace!(name = %reading.name, pin = reading.pin, value = reading.value, "text reading");
                    store.record(DeviceRole::Arduino, reading.pin, reading.value);
                }
                // Best-effort link: malformed lines are dropped, the
                // higher layers re-request what never arrived.
                None => trace!(line = %line, "dropped malformed line"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "text link read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    let _ = events.send(LinkEvent::Disconnected(DeviceRole::Arduino));
}

// ---------------------------------------------------------------------------
// Binary link (STM32 role)
// ---------------------------------------------------------------------------

/// Checksum-framed link to the binary-protocol device.
pub struct BinaryLink {
    writer: Arc<Mutex<WriteHalf<DeviceIo>>>,
    correlator: Arc<Correlator>,
    confirmable: Vec<u8>,
    closed: Arc<AtomicBool>,
    frames_sent: AtomicU64,
    reader: JoinHandle<()>,
}

impl BinaryLink {
    /// Take ownership of an identified stream and start the reader task.
    pub fn spawn(
        io: DeviceIo,
        profile: &DeviceProfile,
        store: ReadingStore,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let closed = Arc::new(AtomicBool::new(false));
        let correlator = Arc::new(Correlator::new());
        let reader = tokio::spawn(binary_reader_loop(
            read_half,
            store,
            Arc::clone(&correlator),
            events,
            Arc::clone(&closed),
        ));
        Self {
            writer: Arc::new(Mutex::new(write_half)),
            correlator,
            confirmable: profile.confirmable_opcodes.clone(),
            closed,
            frames_sent: AtomicU64::new(0),
            reader,
        }
    }

    /// Send one frame without waiting for anything.
    pub async fn send_frame(&self, op: u8, payload: [u8; 4]) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed(DeviceRole::Stm32));
        }
        let encoded = frame::encode(op, payload);
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Request one channel reading.
    pub async fn send_read(&self, channel: u8) -> Result<(), LinkError> {
        self.send_frame(opcode::READ_CHANNEL, [channel, 0, 0, 0]).await
    }

    /// Send a command and, for confirmable opcodes, wait for the device's
    /// acknowledgment with bounded resends.
    ///
    /// Non-confirmable opcodes are fire-and-return-`true`. Confirmable
    /// ones register the single pending `(opcode, mask)` expectation,
    /// send, and wait `retry_interval`; on timeout the identical frame is
    /// resent, up to `max_attempts` sends total. Returns `true` on the
    /// first matching confirmation, `false` if every attempt timed out or
    /// the link died mid-wait.
    pub async fn send_and_await(
        &self,
        op: u8,
        mask: ChannelMask,
        retry_interval: Duration,
        max_attempts: u32,
    ) -> Result<bool, LinkError> {
        let payload = mask.payload();
        if !self.confirmable.contains(&op) {
            self.send_frame(op, payload).await?;
            return Ok(true);
        }

        let mut rx = self.correlator.register(op, mask);
        for attempt in 1..=max_attempts.max(1) {
            if let Err(e) = self.send_frame(op, payload).await {
                self.correlator.abort();
                return Err(e);
            }
            match tokio::time::timeout(retry_interval, &mut rx).await {
                Ok(Ok(())) => {
                    debug!(
                        opcode = op,
                        mask = format_args!("{:#08x}", mask.key()),
                        attempt,
                        "command confirmed"
                    );
                    return Ok(true);
                }
                // Sender dropped: the link died and aborted the slot.
                Ok(Err(_)) => return Ok(false),
                Err(_) => trace!(opcode = op, attempt, "confirmation timeout, resending"),
            }
        }
        self.correlator.abort();
        warn!(
            opcode = op,
            mask = format_args!("{:#08x}", mask.key()),
            attempts = max_attempts,
            "command never confirmed"
        );
        Ok(false)
    }

    /// [`send_and_await`](Self::send_and_await) with intervals/attempts
    /// taken from the limits snapshot.
    pub async fn send_gpio(
        &self,
        op: u8,
        mask: ChannelMask,
        limits: &TestLimits,
    ) -> Result<bool, LinkError> {
        self.send_and_await(
            op,
            mask,
            Duration::from_millis(limits.confirm_retry_interval_ms),
            limits.confirm_max_retries,
        )
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frames written since the link was spawned.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

impl Drop for BinaryLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn binary_reader_loop(
    mut read_half: ReadHalf<DeviceIo>,
    store: ReadingStore,
    correlator: Arc<Correlator>,
    events: mpsc::UnboundedSender<LinkEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4 * FRAME_LEN];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for f in decoder.push(&buf[..n]) {
                    dispatch_frame(f, &store, &correlator);
                }
            }
            Err(e) => {
                warn!(error = %e, "binary link read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // In-flight confirmation waits must fail now, not at their timeout.
    correlator.abort();
    let _ = events.send(LinkEvent::Disconnected(DeviceRole::Stm32));
}

fn dispatch_frame(f: Frame, store: &ReadingStore, correlator: &Correlator) {
    match f.opcode {
        opcode::GPIO_ON | opcode::GPIO_OFF => {
            let mask = ChannelMask([f.payload[0], f.payload[1], f.payload[2]]);
            correlator.confirm(f.opcode, mask);
        }
        opcode::READ_CHANNEL => {
            if let Some((channel, value)) = f.reading() {
                trace!(channel, value, "binary reading");
                store.record(DeviceRole::Stm32, channel, value);
            }
        }
        other => trace!(opcode = other, "unhandled inbound frame"),
    }
}
