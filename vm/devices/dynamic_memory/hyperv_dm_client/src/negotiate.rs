// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Version negotiation and the capabilities handshake.

use crate::SetupError;
use crate::connection::DmConnection;
use crate::transport::Transport;
use hyperv_dm_protocol as protocol;
use protocol::MessageType;
use protocol::ProtocolVersion;

/// Versions offered to the host, newest first. The last is marked as the
/// final attempt.
pub const VERSIONS: [ProtocolVersion; 3] = [
    ProtocolVersion::VERSION_3,
    ProtocolVersion::VERSION_2,
    ProtocolVersion::VERSION_1,
];

/// The outcome of a successful setup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProtocolSession {
    pub version: ProtocolVersion,
    pub capabilities: protocol::Capabilities,
}

/// The capabilities this guest reports: ballooning only.
pub fn guest_capabilities() -> protocol::Capabilities {
    protocol::Capabilities::new()
        .with_balloon(true)
        .with_hot_add(false)
        .with_hot_add_alignment(protocol::HOT_ADD_ALIGNMENT)
}

impl<T: Transport> DmConnection<T> {
    /// Offers each of [`VERSIONS`] in turn until the host accepts one.
    pub async fn negotiate(&mut self) -> Result<ProtocolVersion, SetupError> {
        for (i, &version) in VERSIONS.iter().enumerate() {
            let is_last_attempt = i == VERSIONS.len() - 1;
            tracing::debug!(?version, is_last_attempt, "trying protocol version");

            let request = protocol::VersionRequest {
                version,
                flags: protocol::VersionRequestFlags::new().with_is_last_attempt(is_last_attempt),
            };
            let reply: protocol::VersionResponse = self
                .transact(
                    MessageType::VERSION_REQUEST,
                    &request,
                    MessageType::VERSION_RESPONSE,
                )
                .await
                .map_err(SetupError::Negotiate)?;

            if reply.flags.is_accepted() {
                tracing::debug!(?version, "negotiated protocol version");
                return Ok(version);
            }
        }

        Err(SetupError::NoSupportedVersion)
    }

    /// Reports the guest's capabilities and waits for the host to accept.
    pub async fn report_capabilities(&mut self) -> Result<protocol::Capabilities, SetupError> {
        let capabilities = guest_capabilities();
        let report = protocol::CapabilitiesReport {
            capabilities,
            minimum_page_count: 0,
            maximum_page_number: u64::MAX,
        };
        let reply: protocol::CapabilitiesResponse = self
            .transact(
                MessageType::CAPABILITIES_REPORT,
                &report,
                MessageType::CAPABILITIES_RESPONSE,
            )
            .await
            .map_err(SetupError::Capabilities)?;

        if !reply.flags.is_accepted() {
            return Err(SetupError::CapabilitiesRejected);
        }
        tracing::debug!(?capabilities, "capabilities accepted");
        Ok(capabilities)
    }
}
