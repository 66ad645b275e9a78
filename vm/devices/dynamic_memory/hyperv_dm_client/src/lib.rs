// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side client for the Hyper-V Dynamic Memory protocol.
//!
//! The client negotiates a protocol version and reports its capabilities,
//! then services the host from a single worker task: periodic memory
//! pressure reports, balloon inflation and deflation, and hot-add requests.
//!
//! The channel to the host and the guest's page allocator are supplied by
//! the caller through the [`Transport`](transport::Transport) and
//! [`GuestPages`] traits.

#![forbid(unsafe_code)]

mod balloon;
pub mod config;
mod connection;
pub mod correlator;
mod deflate;
mod hot_add;
mod inflate;
pub mod negotiate;
pub mod pages;
pub mod status;
pub mod test_helpers;
pub mod transport;
mod worker;


pub use config::ConfigError;
pub use config::DynamicMemoryConfig;
pub use config::SendRetryPolicy;
pub use connection::TransactError;
pub use correlator::TransactionBusy;
pub use negotiate::ProtocolSession;
pub use pages::GuestPages;
pub use pages::MemoryCounters;
pub use status::StatusSnapshot;
pub use worker::BalloonStats;

use balloon::BalloonPages;
use connection::DmConnection;
use futures::channel::mpsc;
use futures::channel::oneshot;
use thiserror::Error;
use transport::Transport;
use transport::TransportError;
use worker::ClientWorker;
use worker::WorkerRequest;
use worker::WorkerState;

/// Errors that prevent the client from starting.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("dynamic memory is disabled")]
    Disabled,
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("failed to open the channel")]
    Open(#[source] TransportError),
    #[error("failed to negotiate a protocol version")]
    Negotiate(#[source] TransactError),
    #[error("host rejected every protocol version")]
    NoSupportedVersion,
    #[error("failed to report capabilities")]
    Capabilities(#[source] TransactError),
    #[error("host rejected the guest capabilities")]
    CapabilitiesRejected,
}

/// The worker task has exited.
#[derive(Debug, Error)]
#[error("dynamic memory worker is not running")]
pub struct WorkerStopped;

/// A running dynamic memory client.
///
/// Dropping the client stops the worker, which releases every page still
/// held in the balloon.
pub struct DynamicMemoryClient {
    req: mpsc::UnboundedSender<WorkerRequest>,
    task: tokio::task::JoinHandle<()>,
    session: ProtocolSession,
}

impl DynamicMemoryClient {
    /// Sets up the protocol over `transport` and starts the worker task.
    ///
    /// Must be called from within a tokio runtime. On failure the transport
    /// is closed.
    pub async fn connect<T, G>(
        transport: T,
        pages: G,
        config: DynamicMemoryConfig,
    ) -> Result<Self, SetupError>
    where
        T: 'static + Transport,
        G: 'static + GuestPages,
        G::Page: 'static,
    {
        if !config.enabled {
            return Err(SetupError::Disabled);
        }
        config.validate()?;

        let mut conn = DmConnection::new(
            transport,
            config.max_packet_size,
            config.transaction_timeout,
        );
        let session = match setup(&mut conn, &config).await {
            Ok(session) => session,
            Err(err) => {
                conn.close().await;
                return Err(err);
            }
        };

        let total_pages = pages.total_pages();
        tracing::info!(
            version = ?session.version,
            total_pages,
            "dynamic memory client started"
        );

        let (req_send, req_recv) = mpsc::unbounded();
        let worker = ClientWorker {
            conn,
            state: WorkerState {
                pages,
                balloon: BalloonPages::default(),
                config,
                session,
                total_pages,
                stats: BalloonStats::default(),
                inflation_end_pending: false,
            },
            req: req_recv,
        };
        let task = tokio::spawn(worker.run());

        Ok(Self {
            req: req_send,
            task,
            session,
        })
    }

    /// Returns the negotiated version and accepted capabilities.
    pub fn session(&self) -> ProtocolSession {
        self.session
    }

    /// Queries the worker's counters.
    pub async fn stats(&self) -> Result<BalloonStats, WorkerStopped> {
        let (send, recv) = oneshot::channel();
        self.req
            .unbounded_send(WorkerRequest::Stats(send))
            .map_err(|_| WorkerStopped)?;
        recv.await.map_err(|_| WorkerStopped)
    }

    /// Stops the worker and waits for it to release the balloon and close
    /// the transport.
    pub async fn shutdown(self) {
        drop(self.req);
        if let Err(err) = self.task.await {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "dynamic memory worker panicked"
            );
        }
    }
}

async fn setup<T: Transport>(
    conn: &mut DmConnection<T>,
    config: &DynamicMemoryConfig,
) -> Result<ProtocolSession, SetupError> {
    conn.transport_mut()
        .open(config.send_buffer_size, config.recv_buffer_size)
        .await
        .map_err(SetupError::Open)?;
    let version = conn.negotiate().await?;
    let capabilities = conn.report_capabilities().await?;
    Ok(ProtocolSession {
        version,
        capabilities,
    })
}
