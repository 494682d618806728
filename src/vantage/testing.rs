/// Scripted stand-in for a Vantage console on the far end of a duplex pipe
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::vantage::link::{ACK, ESC, NACK};

#[derive(Debug, Clone)]
pub struct ConsoleScript {
    asleep: bool,
    command_reply: Option<u8>,
    loop_packets: Vec<Vec<u8>>,
    dmpaft_reply: u8,
    dmpaft_header: Vec<u8>,
    archive_frames: Vec<Vec<u8>>,
}

impl Default for ConsoleScript {
    fn default() -> Self {
        Self {
            asleep: false,
            command_reply: Some(ACK),
            loop_packets: Vec::new(),
            dmpaft_reply: ACK,
            dmpaft_header: Vec::new(),
            archive_frames: Vec::new(),
        }
    }
}

impl ConsoleScript {
    /// Never answer the wake-up newline.
    pub fn asleep(mut self) -> Self {
        self.asleep = true;
        self
    }

    pub fn answer_commands_with(mut self, byte: u8) -> Self {
        self.command_reply = Some(byte);
        self
    }

    pub fn silent_on_commands(mut self) -> Self {
        self.command_reply = None;
        self
    }

    /// Packets handed out, in order, across all LOOP commands.
    pub fn with_loop_packets(mut self, packets: Vec<Vec<u8>>) -> Self {
        self.loop_packets = packets;
        self
    }

    /// Reply to the DMPAFT timestamp and the page-count header that follows.
    pub fn with_dmpaft(mut self, reply: u8, header: Vec<u8>) -> Self {
        self.dmpaft_reply = reply;
        self.dmpaft_header = header;
        self
    }

    /// Page transmissions in send order, regardless of ACK or NACK.
    pub fn with_archive_frames(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.archive_frames = frames;
        self
    }
}

pub struct FakeConsole {
    script: ConsoleScript,
    next_packet: usize,
    received: Vec<u8>,
}

impl FakeConsole {
    pub fn new(script: ConsoleScript) -> Self {
        Self {
            script,
            next_packet: 0,
            received: Vec::new(),
        }
    }

    /// Serve until the client hangs up; returns every byte the client sent.
    pub async fn serve(mut self, mut stream: DuplexStream) -> Vec<u8> {
        let mut line = Vec::new();
        loop {
            let byte = match stream.read_u8().await {
                Ok(byte) => byte,
                Err(_) => return self.received,
            };
            self.received.push(byte);
            if byte != b'\n' {
                line.push(byte);
                continue;
            }

            let command = String::from_utf8_lossy(&line).to_string();
            line.clear();
            if self.handle(&command, &mut stream).await.is_err() {
                return self.received;
            }
        }
    }

    async fn handle(&mut self, command: &str, stream: &mut DuplexStream) -> std::io::Result<()> {
        if command.is_empty() {
            if !self.script.asleep {
                stream.write_all(b"\n\r").await?;
            }
            return Ok(());
        }

        let Some(reply) = self.script.command_reply else {
            return Ok(());
        };
        stream.write_all(&[reply]).await?;
        if reply != ACK {
            return Ok(());
        }

        if let Some(count) = command.strip_prefix("LOOP ") {
            let count: usize = count.trim().parse().unwrap_or(0);
            let end = (self.next_packet + count).min(self.script.loop_packets.len());
            for packet in &self.script.loop_packets[self.next_packet..end] {
                stream.write_all(packet).await?;
            }
            self.next_packet = end;
        } else if command == "DMPAFT" {
            let mut filter = [0u8; 6];
            stream.read_exact(&mut filter).await?;
            self.received.extend_from_slice(&filter);
            stream.write_all(&[self.script.dmpaft_reply]).await?;
            if self.script.dmpaft_reply != ACK {
                return Ok(());
            }
            stream.write_all(&self.script.dmpaft_header).await?;
            let start = stream.read_u8().await?;
            self.received.push(start);
            if start == ACK {
                self.send_pages(stream).await?;
            }
        } else if command == "DMP" {
            self.send_pages(stream).await?;
        }
        Ok(())
    }

    async fn send_pages(&mut self, stream: &mut DuplexStream) -> std::io::Result<()> {
        for frame in self.script.archive_frames.clone() {
            stream.write_all(&frame).await?;
            let response = stream.read_u8().await?;
            self.received.push(response);
            if response == ESC {
                break;
            }
            debug_assert!(response == ACK || response == NACK);
        }
        Ok(())
    }
}
