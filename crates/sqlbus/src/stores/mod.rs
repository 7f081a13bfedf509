//! Collaborator stores sharing the transport's connection provider:
//! saga state, topic subscriptions, deferred-message timeouts and the
//! large-attachment data bus.

pub mod databus;
pub mod saga;
pub mod subscription;
pub mod timeout;
