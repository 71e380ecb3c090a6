//! APNS wire layer: notifications, the error taxonomy, and the HTTP/2 client.

pub mod client;
pub mod error;
pub mod notification;

pub use client::{
    ApnsClient, ApnsTransportFactory, ClientSettings, Endpoints, Transport, TransportFactory,
};
pub use error::{DeliveryError, ErrorKind, classify, reason_text};
pub use notification::Notification;
