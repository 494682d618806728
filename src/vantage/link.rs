/// Console connection: wake-up handshake, ACKed commands and LOOP bursts
use async_trait::async_trait;
use log::{debug, warn};
use std::io;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::error::VantageError;
use crate::models::LoopRecord;
use crate::vantage::codec::{decode_loop, LOOP_PACKET_SIZE};

// Console response codes
pub const ACK: u8 = 0x06;
pub const NACK: u8 = 0x21;
pub const CANCEL: u8 = 0x18;
pub const DMP_NACK: u8 = 0x15;
pub const ESC: u8 = 0x1B;

const WAKEUP_ATTEMPTS: usize = 3;
// Davis docs recommend waiting 1.2s for the wake-up response
const WAKEUP_TIMEOUT: Duration = Duration::from_millis(1200);
const ACK_TIMEOUT: Duration = Duration::from_secs(1);
const LOOP_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the byte stream to the console.
#[async_trait]
pub trait Connector: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn dial(&mut self) -> io::Result<Self::Stream>;

    /// Human-readable target for log lines.
    fn address(&self) -> &str;
}

/// Dials a TCP-serial bridge such as a WeatherLinkIP or ser2net.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn dial(&mut self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Transport open, console not yet awake.
    Unconnected,
    /// Console awake and ready for a command.
    Connected,
    /// A LOOP burst is streaming packets.
    Looping,
    /// A protocol failure left the stream in an unknown position; redial.
    Broken,
}

/// Exclusive owner of one console stream.
pub struct DeviceLink<S> {
    stream: BufReader<S>,
    state: LinkState,
}

impl DeviceLink<TcpStream> {
    /// Dial `address` over TCP and wake the console.
    pub async fn connect_tcp(address: &str) -> Result<Self, VantageError> {
        Self::connect(&mut TcpConnector::new(address)).await
    }
}

impl<S> DeviceLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already open stream. The console still has to be woken up.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            state: LinkState::Unconnected,
        }
    }

    /// Dial through `connector`, then perform the wake-up handshake.
    pub async fn connect<C>(connector: &mut C) -> Result<Self, VantageError>
    where
        C: Connector<Stream = S> + ?Sized,
    {
        let stream = connector.dial().await?;
        let mut link = Self::new(stream);
        link.wakeup().await?;
        Ok(link)
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    fn require(&self, operation: &'static str, expected: LinkState) -> Result<(), VantageError> {
        if self.state != expected {
            return Err(VantageError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Send a newline and wait for "\n\r", up to three times.
    pub async fn wakeup(&mut self) -> Result<(), VantageError> {
        self.require("wake console", LinkState::Unconnected)?;

        for attempt in 1..=WAKEUP_ATTEMPTS {
            self.write_bytes(b"\n").await?;

            let mut response = [0u8; 2];
            match timeout(WAKEUP_TIMEOUT, self.stream.read_exact(&mut response)).await {
                Ok(Ok(_)) if &response == b"\n\r" => {
                    debug!("Console awake after {} attempt(s)", attempt);
                    self.state = LinkState::Connected;
                    return Ok(());
                }
                Ok(Ok(_)) => warn!("Got invalid wake-up response: {:02x?}", response),
                Ok(Err(e)) => {
                    self.state = LinkState::Broken;
                    return Err(e.into());
                }
                Err(_) => warn!("Console did not answer wake-up attempt {}", attempt),
            }
        }

        self.state = LinkState::Broken;
        Err(VantageError::Handshake {
            attempts: WAKEUP_ATTEMPTS,
        })
    }

    /// Write `command` and require a single ACK byte within one second.
    pub async fn send_command(&mut self, command: &str) -> Result<(), VantageError> {
        self.require("send command", LinkState::Connected)?;
        self.write_bytes(command.as_bytes()).await?;
        self.expect_ack(command.trim_end()).await
    }

    /// Read one byte and fail unless it is ACK.
    pub(crate) async fn expect_ack(&mut self, context: &str) -> Result<(), VantageError> {
        match timeout(ACK_TIMEOUT, self.stream.read_u8()).await {
            Ok(Ok(ACK)) => Ok(()),
            Ok(Ok(other)) => {
                self.state = LinkState::Broken;
                Err(VantageError::protocol(context, Some(other)))
            }
            Ok(Err(e)) => {
                self.state = LinkState::Broken;
                Err(e.into())
            }
            Err(_) => {
                self.state = LinkState::Broken;
                Err(VantageError::protocol(context, None))
            }
        }
    }

    /// Request `count` LOOP packets. Packets are read one at a time from the
    /// returned burst. A count of zero is rejected before anything is sent.
    pub async fn start_loop(&mut self, count: usize) -> Result<LoopBurst<'_, S>, VantageError> {
        if count == 0 {
            return Err(VantageError::EmptyBurst);
        }
        self.send_command(&format!("LOOP {}\n", count)).await?;
        self.state = LinkState::Looping;
        Ok(LoopBurst {
            link: self,
            remaining: count,
        })
    }

    pub(crate) async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), VantageError> {
        let result = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.state = LinkState::Broken;
            return Err(e.into());
        }
        Ok(())
    }

    /// Fill `buf` completely or fail after `after`.
    pub(crate) async fn read_frame(
        &mut self,
        buf: &mut [u8],
        operation: &'static str,
        after: Duration,
    ) -> Result<(), VantageError> {
        match timeout(after, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.state = LinkState::Broken;
                Err(e.into())
            }
            Err(_) => {
                self.state = LinkState::Broken;
                Err(VantageError::Timeout { operation, after })
            }
        }
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }

    async fn read_loop_packet(&mut self) -> Result<LoopRecord, VantageError> {
        let mut pkt = [0u8; LOOP_PACKET_SIZE];
        self.read_frame(&mut pkt, "LOOP packet read", LOOP_READ_TIMEOUT)
            .await?;
        decode_loop(&pkt, OffsetDateTime::now_utc()).map_err(|e| {
            debug!("Rejected LOOP packet: {:02x?}", pkt);
            self.state = LinkState::Broken;
            VantageError::from(e)
        })
    }
}

/// An in-progress LOOP request.
///
/// Records already returned stay valid even if a later packet fails; the
/// first failure ends the burst and leaves the link broken.
pub struct LoopBurst<'a, S> {
    link: &'a mut DeviceLink<S>,
    remaining: usize,
}

impl<'a, S> LoopBurst<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Next decoded record, or `None` once the requested count was delivered.
    pub async fn next(&mut self) -> Option<Result<LoopRecord, VantageError>> {
        if self.remaining == 0 {
            return None;
        }

        match self.link.read_loop_packet().await {
            Ok(record) => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.link.set_state(LinkState::Connected);
                }
                Some(Ok(record))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}
