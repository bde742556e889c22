//! The routing bridge: ingress → publisher → log → subscriber → cache → read path.

pub mod publisher;
pub mod router;
pub mod subscriber;

pub use publisher::{LogClient, PublishMode, Publisher, PublisherConfig, PublisherStats};
pub use router::{Bridge, ReadPath, Republish, RepublishSummary};
pub use subscriber::{ApplyMode, Subscriber, SubscriberConfig, SubscriberHandle, SubscriberStats};
