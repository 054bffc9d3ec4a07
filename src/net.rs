//! Networking substrate: endpoints, destinations, and the non-blocking UDP
//! socket the receive path is built on.

pub mod destination;
pub mod endpoint;
pub mod socket;

pub use destination::{Destination, DestinationError};
pub use endpoint::Endpoint;
pub use socket::UdpSocket;
