//! Typed access to the two logical channels, each a main queue paired with its DLQ.

use std::sync::Arc;

use index_store::{QueueError, QueueTransport, Receipt, ReceivedMessage, RedrivePolicy};
use offender_model::{BuildWorkItem, QueueStatus};
use tracing::debug;

use crate::config::QueueConfig;
use crate::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Build work items (populate index / page / offender).
    Build,
    /// Change events from the upstream feed.
    Event,
}

#[derive(Debug, Clone)]
struct ChannelQueues {
    main: String,
    dlq: String,
}

pub struct QueueGateway {
    transport: Arc<dyn QueueTransport>,
    build: ChannelQueues,
    event: ChannelQueues,
}

impl QueueGateway {
    /// Bind both channels to their queues and install the redrive policies.
    pub fn new(transport: Arc<dyn QueueTransport>, cfg: &QueueConfig) -> Result<Self, QueueError> {
        let build = ChannelQueues { main: cfg.build_queue.clone(), dlq: cfg.build_dlq.clone() };
        let event = ChannelQueues { main: cfg.event_queue.clone(), dlq: cfg.event_dlq.clone() };
        for q in [&build, &event] {
            let policy = RedrivePolicy { dlq: q.dlq.clone(), max_receive_count: cfg.max_receive_count };
            transport.set_redrive_policy(&q.main, &policy)?;
        }
        Ok(Self { transport, build, event })
    }

    fn queues(&self, channel: Channel) -> &ChannelQueues {
        match channel {
            Channel::Build => &self.build,
            Channel::Event => &self.event,
        }
    }

    pub fn queue_name(&self, channel: Channel) -> &str { &self.queues(channel).main }

    pub fn dlq_name(&self, channel: Channel) -> &str { &self.queues(channel).dlq }

    pub fn send_work(&self, item: &BuildWorkItem) -> Result<(), ServiceError> {
        let body = item.to_json().map_err(|e| ServiceError::Codec(e.to_string()))?;
        self.send_raw(Channel::Build, &body)?;
        debug!(kind = item.kind(), "sent build work item");
        Ok(())
    }

    pub fn send_raw(&self, channel: Channel, body: &str) -> Result<(), QueueError> {
        self.transport.send(&self.queues(channel).main, body)
    }

    /// Place a message straight onto the channel's DLQ.
    pub fn send_to_dlq(&self, channel: Channel, body: &str) -> Result<(), QueueError> {
        self.transport.send(&self.queues(channel).dlq, body)
    }

    pub fn receive(&self, channel: Channel) -> Result<Option<ReceivedMessage>, QueueError> {
        self.transport.receive(&self.queues(channel).main)
    }

    pub fn receive_one_from_dlq(&self, channel: Channel) -> Result<Option<ReceivedMessage>, QueueError> {
        self.transport.receive(&self.queues(channel).dlq)
    }

    pub fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError> { self.transport.delete(receipt) }

    pub fn depth(&self, channel: Channel) -> Result<u64, QueueError> {
        self.transport.visible_count(&self.queues(channel).main)
    }

    pub fn in_flight(&self, channel: Channel) -> Result<u64, QueueError> {
        self.transport.in_flight_count(&self.queues(channel).main)
    }

    pub fn dlq_depth(&self, channel: Channel) -> Result<u64, QueueError> {
        self.transport.visible_count(&self.queues(channel).dlq)
    }

    pub fn dlq_in_flight(&self, channel: Channel) -> Result<u64, QueueError> {
        self.transport.in_flight_count(&self.queues(channel).dlq)
    }

    pub fn purge_main(&self, channel: Channel) -> Result<u64, QueueError> {
        self.transport.purge(&self.queues(channel).main)
    }

    pub fn purge_dlq(&self, channel: Channel) -> Result<u64, QueueError> {
        self.transport.purge(&self.queues(channel).dlq)
    }

    /// Counts for the channel. `in_flight` includes DLQ messages held by a redrive.
    pub fn status(&self, channel: Channel) -> Result<QueueStatus, QueueError> {
        Ok(QueueStatus {
            on_queue: self.depth(channel)?,
            on_dlq: self.dlq_depth(channel)?,
            in_flight: self.in_flight(channel)? + self.dlq_in_flight(channel)?,
        })
    }
}
