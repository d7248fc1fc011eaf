mod service;
mod transport;

pub use service::{backoff_seconds, NotificationService};
pub use transport::{
    CompositeTransport, Delivery, HttpTransport, NotificationTransport, RedisTransport,
};

#[cfg(test)]
pub use transport::MockNotificationTransport;
