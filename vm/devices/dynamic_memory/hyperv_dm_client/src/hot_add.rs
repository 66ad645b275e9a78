// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hot-add requests. The guest does not advertise hot-add, so requests are
//! acknowledged without adding any memory.

use crate::connection::DmConnection;
use crate::pages::GuestPages;
use crate::transport::Transport;
use crate::worker::WorkerState;
use hyperv_dm_protocol as protocol;
use protocol::MessageType;
use zerocopy::IntoBytes;

impl<G: GuestPages> WorkerState<G> {
    pub(crate) async fn handle_hot_add<T: Transport>(
        &mut self,
        conn: &mut DmConnection<T>,
        range: protocol::PageRange,
    ) {
        self.stats.hot_add_requests += 1;
        tracing::info!(
            start_page = range.start_page(),
            page_count = range.page_count(),
            "ignoring hot add request"
        );

        let response = protocol::HotAddResponse {
            page_count: 0,
            result: protocol::HotAddResult::PROCESSED,
        };
        if let Err(err) = conn
            .send(MessageType::HOT_ADD_RESPONSE, &[response.as_bytes()])
            .await
        {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to send hot add response"
            );
        }
    }
}
