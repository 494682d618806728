/// Bulk archive download (DMP / DMPAFT)
///
/// The console stores its archive in a ring buffer of 512 pages. Pages are
/// sent one at a time, each ACKed or NACKed by us; a NACK makes the console
/// send the same page again.
use log::{debug, info, warn};
use time::PrimitiveDateTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::error::VantageError;
use crate::models::ArchiveRecord;
use crate::vantage::codec::{
    decode_archive_page, encode_archive_timestamp, verify_crc, with_crc, ARCHIVE_PAGE_SIZE,
};
use crate::vantage::link::{DeviceLink, LinkState, ACK, ESC, NACK};

pub const ARCHIVE_PAGES: u16 = 512;
const PAGE_READ_TIMEOUT: Duration = Duration::from_secs(30);
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_PAGE_ATTEMPTS: usize = 3;
const ARCHIVE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    /// `DMP`: every page of the archive.
    Full,
    /// `DMPAFT`: only records stamped after the given console-local time.
    After(PrimitiveDateTime),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub pages: u16,
    pub records: usize,
    pub nacks: usize,
}

impl<S> DeviceLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Stream archive records into `output` in the order the console sends them.
    ///
    /// The order is not chronological once the ring buffer has wrapped; use
    /// [`archive_records`] for a sorted result. `output` is closed when the
    /// transfer returns.
    pub async fn dump_archive(
        &mut self,
        mode: DumpMode,
        output: mpsc::Sender<ArchiveRecord>,
    ) -> Result<TransferStats, VantageError> {
        let (page_count, first_offset) = match mode {
            DumpMode::Full => {
                self.send_command("DMP\n").await?;
                (ARCHIVE_PAGES, 0)
            }
            DumpMode::After(since) => self.negotiate_dump_after(since).await?,
        };
        info!(
            "Archive transfer: {} page(s), first record offset {}",
            page_count, first_offset
        );

        let mut stats = TransferStats::default();
        for page_index in 0..page_count {
            let records = self.read_page(page_index, &mut stats).await?;
            for record in records
                .into_iter()
                .filter(|r| keep_record(r, page_index, first_offset, mode))
            {
                if output.send(record).await.is_err() {
                    self.cancel_transfer().await;
                    return Err(VantageError::OutputClosed);
                }
                stats.records += 1;
            }
            self.write_bytes(&[ACK]).await?;
            stats.pages += 1;
        }

        debug!("Archive transfer finished: {:?}", stats);
        Ok(stats)
    }

    /// DMPAFT handshake. Returns the page count and the index of the first
    /// requested record within the first page.
    async fn negotiate_dump_after(
        &mut self,
        since: PrimitiveDateTime,
    ) -> Result<(u16, u16), VantageError> {
        self.send_command("DMPAFT\n").await?;
        self.write_bytes(&with_crc(&encode_archive_timestamp(since)))
            .await?;
        self.expect_ack("DMPAFT timestamp").await?;

        let mut header = [0u8; 6];
        self.read_frame(&mut header, "DMPAFT header read", HEADER_READ_TIMEOUT)
            .await?;
        if let Err(e) = verify_crc(&header) {
            warn!("DMPAFT header rejected: {}", e);
            self.cancel_transfer().await;
            return Err(VantageError::protocol("DMPAFT header checksum", None));
        }

        let page_count = u16::from_le_bytes([header[0], header[1]]);
        let first_offset = u16::from_le_bytes([header[2], header[3]]);
        if page_count == 0 {
            // Nothing newer than `since`; ESC declines the (empty) download.
            self.write_bytes(&[ESC]).await?;
            return Ok((0, 0));
        }
        self.write_bytes(&[ACK]).await?;
        Ok((page_count, first_offset))
    }

    /// Read one page, NACKing corrupt copies until a good one arrives.
    async fn read_page(
        &mut self,
        page_index: u16,
        stats: &mut TransferStats,
    ) -> Result<Vec<ArchiveRecord>, VantageError> {
        let mut page = [0u8; ARCHIVE_PAGE_SIZE];
        for attempt in 1..=MAX_PAGE_ATTEMPTS {
            self.read_frame(&mut page, "archive page read", PAGE_READ_TIMEOUT)
                .await?;
            match decode_archive_page(&page, page_index) {
                Ok(records) => return Ok(records),
                Err(e) => {
                    warn!(
                        "Archive page {} attempt {} rejected: {}",
                        page_index, attempt, e
                    );
                    if attempt < MAX_PAGE_ATTEMPTS {
                        stats.nacks += 1;
                        self.write_bytes(&[NACK]).await?;
                    }
                }
            }
        }

        self.cancel_transfer().await;
        Err(VantageError::protocol(
            format!(
                "archive page {} failed checksum {} times",
                page_index, MAX_PAGE_ATTEMPTS
            ),
            None,
        ))
    }

    /// Tell the console to stop sending and mark the link unusable.
    async fn cancel_transfer(&mut self) {
        if let Err(e) = self.write_bytes(&[ESC]).await {
            debug!("Failed to cancel archive transfer: {}", e);
        }
        self.set_state(LinkState::Broken);
    }
}

/// Drop records that precede the requested start: the leading slots of the
/// first page, and stale pre-wrap records that trail the newest one.
fn keep_record(
    record: &ArchiveRecord,
    page_index: u16,
    first_offset: u16,
    mode: DumpMode,
) -> bool {
    if page_index == 0 && u16::from(record.index) < first_offset {
        return false;
    }
    match mode {
        DumpMode::After(since) => record.timestamp > since,
        DumpMode::Full => true,
    }
}

/// Download the archive and return it sorted by timestamp.
pub async fn archive_records<S>(
    link: &mut DeviceLink<S>,
    mode: DumpMode,
) -> Result<Vec<ArchiveRecord>, VantageError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (tx, mut rx) = mpsc::channel(ARCHIVE_QUEUE_CAPACITY);
    let collect = async move {
        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        records
    };

    let (result, mut records) = tokio::join!(link.dump_archive(mode, tx), collect);
    result?;
    records.sort_by_key(|r| r.timestamp);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vantage::codec::tests::{archive_page, archive_record_bytes};
    use crate::vantage::testing::{ConsoleScript, FakeConsole};
    use time::macros::datetime;
    use tokio::io::duplex;

    fn dmpaft_header(pages: u16, offset: u16) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(&pages.to_le_bytes());
        header.extend_from_slice(&offset.to_le_bytes());
        with_crc(&header)
    }

    async fn awake(
        script: ConsoleScript,
    ) -> (
        DeviceLink<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<Vec<u8>>,
    ) {
        let (client, server) = duplex(8192);
        let console = tokio::spawn(FakeConsole::new(script).serve(server));
        let mut link = DeviceLink::new(client);
        link.wakeup().await.unwrap();
        (link, console)
    }

    #[tokio::test(start_paused = true)]
    async fn dump_after_filters_sorts_and_retries_corrupt_page() {
        let since = datetime!(2024-01-01 00:00);
        let first_page = archive_page(
            0,
            &[
                archive_record_bytes(datetime!(2024-01-01 00:00), 400),
                archive_record_bytes(datetime!(2024-01-01 01:10), 410),
                archive_record_bytes(datetime!(2024-01-01 01:05), 405),
            ],
        );
        let second_page = archive_page(
            1,
            &[
                archive_record_bytes(datetime!(2024-01-01 01:20), 420),
                archive_record_bytes(datetime!(2023-12-31 23:00), 300),
            ],
        );
        let mut corrupt = second_page.clone();
        corrupt[5] ^= 0x55;

        let script = ConsoleScript::default()
            .with_dmpaft(ACK, dmpaft_header(2, 1))
            .with_archive_frames(vec![first_page, corrupt, second_page]);
        let (mut link, console) = awake(script).await;

        let records = archive_records(&mut link, DumpMode::After(since)).await.unwrap();
        let times: Vec<_> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(
            times,
            vec![
                datetime!(2024-01-01 01:05),
                datetime!(2024-01-01 01:10),
                datetime!(2024-01-01 01:20),
            ]
        );
        assert_eq!(records[2].page, 1);

        drop(link);
        let received = console.await.unwrap();
        // start ACK, page 0 ACK, page 1 NACK, page 1 ACK
        assert!(received.ends_with(&[ACK, ACK, NACK, ACK]));
        let filter = &received[b"\nDMPAFT\n".len()..b"\nDMPAFT\n".len() + 6];
        assert_eq!(filter, with_crc(&encode_archive_timestamp(since)).as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn first_page_offset_skips_newer_leading_records() {
        let page = archive_page(
            0,
            &[
                archive_record_bytes(datetime!(2024-01-01 00:30), 430),
                archive_record_bytes(datetime!(2024-01-01 01:10), 410),
            ],
        );
        let script = ConsoleScript::default()
            .with_dmpaft(ACK, dmpaft_header(1, 1))
            .with_archive_frames(vec![page]);
        let (mut link, _console) = awake(script).await;

        let records = archive_records(&mut link, DumpMode::After(datetime!(2024-01-01 00:00)))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, datetime!(2024-01-01 01:10));
        assert_eq!(records[0].index, 1);
    }

    #[test]
    fn offset_applies_only_to_first_page() {
        let page = archive_page(
            0,
            &[archive_record_bytes(datetime!(2024-01-01 00:30), 430)],
        );
        let record = decode_archive_page(&page, 1).unwrap().remove(0);
        let mode = DumpMode::After(datetime!(2024-01-01 00:00));
        assert!(!keep_record(&record, 0, 1, mode));
        assert!(keep_record(&record, 1, 1, mode));
        assert!(keep_record(&record, 0, 0, mode));
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_page_emits_nothing() {
        let good = archive_page(0, &[archive_record_bytes(datetime!(2024-02-01 10:00), 500)]);
        let mut bad = good.clone();
        bad[30] ^= 0x01;

        let script = ConsoleScript::default()
            .with_dmpaft(ACK, dmpaft_header(1, 0))
            .with_archive_frames(vec![bad.clone(), bad.clone(), bad]);
        let (mut link, console) = awake(script).await;

        let (tx, mut rx) = mpsc::channel(8);
        let err = link
            .dump_archive(DumpMode::After(datetime!(2024-01-01 00:00)), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, VantageError::Protocol { .. }));
        assert!(rx.recv().await.is_none());
        assert_eq!(link.state(), LinkState::Broken);

        drop(link);
        let received = console.await.unwrap();
        assert!(received.ends_with(&[ACK, NACK, NACK, ESC]));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_header_checksum_is_fatal() {
        let mut header = dmpaft_header(3, 0);
        header[0] ^= 0x02;
        let script = ConsoleScript::default().with_dmpaft(ACK, header);
        let (mut link, _console) = awake(script).await;

        let err = archive_records(&mut link, DumpMode::After(datetime!(2024-01-01 00:00)))
            .await
            .unwrap_err();
        assert!(matches!(err, VantageError::Protocol { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_timestamp_reports_console_byte() {
        let script = ConsoleScript::default().with_dmpaft(NACK, Vec::new());
        let (mut link, _console) = awake(script).await;

        match archive_records(&mut link, DumpMode::After(datetime!(2024-01-01 00:00))).await {
            Err(VantageError::Protocol { received, .. }) => assert_eq!(received, Some(NACK)),
            other => panic!("expected protocol error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_newer_declines_download() {
        let script = ConsoleScript::default().with_dmpaft(ACK, dmpaft_header(0, 0));
        let (mut link, console) = awake(script).await;

        let records = archive_records(&mut link, DumpMode::After(datetime!(2024-01-01 00:00)))
            .await
            .unwrap();
        assert!(records.is_empty());

        drop(link);
        assert_eq!(console.await.unwrap().last(), Some(&ESC));
    }

    #[tokio::test(start_paused = true)]
    async fn full_dump_reads_every_page() {
        let mut frames = vec![archive_page(
            0,
            &[archive_record_bytes(datetime!(2024-03-03 03:30), 610)],
        )];
        frames.extend((1..ARCHIVE_PAGES).map(|i| archive_page(i as u8, &[])));

        let script = ConsoleScript::default().with_archive_frames(frames);
        let (mut link, console) = awake(script).await;

        let (tx, mut rx) = mpsc::channel(8);
        let stats = link.dump_archive(DumpMode::Full, tx).await.unwrap();
        assert_eq!(stats.pages, ARCHIVE_PAGES);
        assert_eq!(stats.records, 1);
        assert_eq!(stats.nacks, 0);
        assert_eq!(rx.recv().await.unwrap().outside_temp_raw, 610);
        assert!(rx.recv().await.is_none());

        drop(link);
        let received = console.await.unwrap();
        let acks = received[b"\nDMP\n".len()..].iter().filter(|&&b| b == ACK).count();
        assert_eq!(acks, usize::from(ARCHIVE_PAGES));
    }
}
