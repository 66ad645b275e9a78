// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The task that services the protocol after setup.
//!
//! Inbound messages, the status timer and client requests are all handled
//! here, one at a time, so none of the handlers need any locking.

use crate::balloon::BalloonPages;
use crate::config::DynamicMemoryConfig;
use crate::connection::DmConnection;
use crate::connection::Message;
use crate::connection::parse_message;
use crate::negotiate::ProtocolSession;
use crate::pages::GuestPages;
use crate::status::StatusSnapshot;
use crate::transport::Transport;
use crate::transport::TransportError;
use anyhow::Context;
use futures::FutureExt;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::channel::oneshot;
use futures_concurrency::future::Race;
use hyperv_dm_protocol as protocol;
use protocol::MessageType;
use tokio::time::Instant;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Counters describing the client's activity, as seen by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalloonStats {
    /// Pages currently withheld from the guest.
    pub tracked_pages: u64,
    /// Pages reported to the host in inflation responses.
    pub inflated_pages: u64,
    /// Tracked pages released by deflation requests.
    pub deflated_pages: u64,
    pub inflation_requests: u64,
    pub deflation_requests: u64,
    /// Deflation targets that were not in the balloon.
    pub deflation_misses: u64,
    pub hot_add_requests: u64,
    pub status_reports_sent: u64,
    pub status_report_failures: u64,
    /// Inflation response sends that failed and were attempted again.
    pub send_retries: u64,
    /// Inflation responses given up on after exhausting retries.
    pub abandoned_batches: u64,
    pub unknown_messages: u64,
    pub malformed_messages: u64,
    /// The maximum page count last announced by the host, if any.
    pub host_max_page_count: Option<u64>,
    pub last_status: Option<StatusSnapshot>,
}

pub(crate) enum WorkerRequest {
    Stats(oneshot::Sender<BalloonStats>),
}

pub(crate) struct ClientWorker<T, G: GuestPages> {
    pub conn: DmConnection<T>,
    pub state: WorkerState<G>,
    pub req: mpsc::UnboundedReceiver<WorkerRequest>,
}

pub(crate) struct WorkerState<G: GuestPages> {
    pub pages: G,
    pub balloon: BalloonPages<G::Page>,
    pub config: DynamicMemoryConfig,
    pub session: ProtocolSession,
    /// Read once at setup.
    pub total_pages: u64,
    pub stats: BalloonStats,
    /// An inflation transfer was abandoned after announcing `more_pages`
    /// and its final batch has not been sent yet.
    pub inflation_end_pending: bool,
}

/// An inbound message, copied out of the receive buffer.
enum Inbound {
    Inflate {
        page_count: u32,
    },
    Deflate {
        ranges: Vec<protocol::PageRange>,
        more_pages: bool,
    },
    HotAdd {
        range: protocol::PageRange,
    },
    Info {
        max_page_count: Option<u64>,
    },
    Response {
        transaction_id: u32,
        payload: Vec<u8>,
    },
    Error,
    Unknown,
}

impl Inbound {
    fn parse(message: &Message<'_>) -> anyhow::Result<Self> {
        let body = message.body;
        let inbound = match message.header.message_type {
            MessageType::INFLATION_REQUEST => {
                let (request, _) = protocol::InflationRequest::read_from_prefix(body)
                    .ok()
                    .context("failed to read inflation request")?;
                Inbound::Inflate {
                    page_count: request.page_count,
                }
            }
            MessageType::DEFLATION_REQUEST => {
                let (request, rest) = protocol::DeflationRequest::read_from_prefix(body)
                    .ok()
                    .context("failed to read deflation request")?;
                let count = request.count.range_count() as usize;
                let present = rest.len() / size_of::<protocol::PageRange>();
                if present < count {
                    tracing::warn!(count, present, "deflation request is truncated");
                }
                let (ranges, _) =
                    <[zerocopy::Unalign<protocol::PageRange>]>::ref_from_prefix_with_elems(
                        rest,
                        count.min(present),
                    )
                    .ok()
                    .context("failed to read deflation ranges")?;
                Inbound::Deflate {
                    ranges: ranges.iter().map(|r| r.get()).collect(),
                    more_pages: request.count.more_pages(),
                }
            }
            MessageType::HOT_ADD_REQUEST => {
                let (request, _) = protocol::HotAddRequest::read_from_prefix(body)
                    .ok()
                    .context("failed to read hot add request")?;
                Inbound::HotAdd {
                    range: request.range,
                }
            }
            MessageType::INFO_MESSAGE => Inbound::Info {
                max_page_count: parse_info(body)?,
            },
            MessageType::VERSION_RESPONSE | MessageType::CAPABILITIES_RESPONSE => {
                Inbound::Response {
                    transaction_id: message.header.transaction_id,
                    payload: body.to_vec(),
                }
            }
            MessageType::ERROR => Inbound::Error,
            _ => Inbound::Unknown,
        };
        Ok(inbound)
    }
}

/// Walks the records of an info message, returning the host's maximum page
/// count if one is present.
fn parse_info(body: &[u8]) -> anyhow::Result<Option<u64>> {
    let (info, rest) = protocol::InfoMessage::read_from_prefix(body)
        .ok()
        .context("failed to read info message")?;
    let mut records = rest
        .get(..info.info_size as usize)
        .context("info message is truncated")?;
    let mut max_page_count = None;
    while !records.is_empty() {
        let (header, data) = protocol::InfoHeader::read_from_prefix(records)
            .ok()
            .context("failed to read info record header")?;
        let data_size = header.data_size.get() as usize;
        let data = data.get(..data_size).context("info record is truncated")?;
        match protocol::InfoType(header.info_type) {
            protocol::InfoType::MAX_PAGE_COUNT => {
                let (value, _) = protocol::InfoMaxPageCount::read_from_prefix(data)
                    .ok()
                    .context("failed to read max page count")?;
                max_page_count = Some(value.max_page_count.get());
            }
            info_type => {
                tracing::debug!(?info_type, data_size, "ignoring info record");
            }
        }
        records = &records[size_of::<protocol::InfoHeader>() + data_size..];
    }
    Ok(max_page_count)
}

impl<T: Transport, G: GuestPages> ClientWorker<T, G> {
    pub async fn run(mut self) {
        if let Err(err) = self.run_inner().await {
            tracing::error!(
                error = err.as_ref() as &dyn std::error::Error,
                "dynamic memory worker failed"
            );
        }
        self.teardown().await;
    }

    async fn run_inner(&mut self) -> anyhow::Result<()> {
        let interval = self.state.config.status_interval;
        let mut next_status = Instant::now() + interval;
        loop {
            enum Event {
                Packet(Result<usize, TransportError>),
                Status,
                Request(Option<WorkerRequest>),
            }

            let event = (
                self.conn.recv().map(Event::Packet),
                tokio::time::sleep_until(next_status).map(|()| Event::Status),
                self.req.next().map(Event::Request),
            )
                .race()
                .await;

            match event {
                Event::Packet(r) => {
                    let len = r.context("failed to read packet")?;
                    self.handle_packet(len).await;
                }
                Event::Status => {
                    self.state.flush_inflation_end(&mut self.conn).await;
                    self.state.send_status(&mut self.conn).await;
                    next_status = Instant::now() + interval;
                }
                Event::Request(Some(req)) => self.state.handle_request(req),
                Event::Request(None) => break,
            }
        }
        Ok(())
    }

    async fn handle_packet(&mut self, len: usize) {
        let inbound = match parse_message(self.conn.packet(len)) {
            Ok(message) => {
                let message_type = message.header.message_type;
                tracing::trace!(
                    ?message_type,
                    transaction_id = message.header.transaction_id,
                    "received message"
                );
                Inbound::parse(&message).with_context(|| format!("bad {message_type:?} message"))
            }
            Err(err) => Err(err.into()),
        };

        let inbound = match inbound {
            Ok(inbound) => inbound,
            Err(err) => {
                self.state.stats.malformed_messages += 1;
                tracing::warn!(
                    error = err.as_ref() as &dyn std::error::Error,
                    "dropping malformed message"
                );
                return;
            }
        };

        let state = &mut self.state;
        state.flush_inflation_end(&mut self.conn).await;
        match inbound {
            Inbound::Inflate { page_count } => {
                state.handle_inflation(&mut self.conn, page_count).await;
            }
            Inbound::Deflate { ranges, more_pages } => {
                state
                    .handle_deflation(&mut self.conn, &ranges, more_pages)
                    .await;
            }
            Inbound::HotAdd { range } => {
                state.handle_hot_add(&mut self.conn, range).await;
            }
            Inbound::Info { max_page_count } => {
                tracing::debug!(max_page_count, "host info");
                if max_page_count.is_some() {
                    state.stats.host_max_page_count = max_page_count;
                }
            }
            Inbound::Response {
                transaction_id,
                payload,
            } => {
                self.conn
                    .correlator_mut()
                    .on_response(transaction_id, &payload);
            }
            Inbound::Error => {
                tracing::warn!("host reported a protocol error");
            }
            Inbound::Unknown => {
                state.stats.unknown_messages += 1;
                let packet = self.conn.packet(len);
                tracing::debug!(
                    message_type = u16::from_le_bytes([packet[0], packet[1]]),
                    len,
                    "ignoring unknown message"
                );
            }
        }
    }

    async fn teardown(&mut self) {
        let released = self.state.release_all();
        tracing::debug!(
            version = ?self.state.session.version,
            released,
            "dynamic memory client stopping"
        );
        self.conn.close().await;
    }
}

impl<G: GuestPages> WorkerState<G> {
    fn handle_request(&mut self, req: WorkerRequest) {
        match req {
            WorkerRequest::Stats(send) => {
                let mut stats = self.stats.clone();
                stats.tracked_pages = self.balloon.len() as u64;
                let _ = send.send(stats);
            }
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::new(&self.pages.counters(), self.total_pages)
    }

    /// Sends a status report. Failures are only logged; the next tick is the
    /// retry.
    async fn send_status<T: Transport>(&mut self, conn: &mut DmConnection<T>) {
        let snapshot = self.snapshot();
        let report = snapshot.to_report();
        match conn
            .send(MessageType::STATUS_REPORT, &[report.as_bytes()])
            .await
        {
            Ok(()) => {
                tracing::trace!(
                    available = snapshot.available_pages,
                    committed = snapshot.committed_pages,
                    "sent status report"
                );
                self.stats.status_reports_sent += 1;
                self.stats.last_status = Some(snapshot);
            }
            Err(err) => {
                self.stats.status_report_failures += 1;
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to send status report"
                );
            }
        }
    }

    /// Frees every page still in the balloon.
    fn release_all(&mut self) -> usize {
        let mut released = 0;
        for page in self.balloon.drain() {
            self.pages.free_page(page);
            released += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn info_body(records: &[u8]) -> Vec<u8> {
        let mut body = protocol::InfoMessage {
            reserved: 0,
            info_size: records.len() as u32,
        }
        .as_bytes()
        .to_vec();
        body.extend_from_slice(records);
        body
    }

    #[test]
    fn info_max_page_count() {
        let mut records = vec![0, 8, 0];
        records.extend_from_slice(&0x1234u64.to_le_bytes());
        assert_eq!(parse_info(&info_body(&records)).unwrap(), Some(0x1234));
    }

    #[test]
    fn info_skips_unknown_records() {
        let mut records = vec![5, 2, 0, 0xaa, 0xbb, 0, 8, 0];
        records.extend_from_slice(&7u64.to_le_bytes());
        assert_eq!(parse_info(&info_body(&records)).unwrap(), Some(7));
        assert_eq!(parse_info(&info_body(&[5, 0, 0])).unwrap(), None);
    }

    #[test]
    fn info_rejects_truncation() {
        assert!(parse_info(&info_body(&[0, 8, 0, 1, 2])).is_err());
        let mut body = info_body(&[]);
        body[4] = 10;
        assert!(parse_info(&body).is_err());
    }
}
