mod connection;
mod inbound;
mod outbound;
mod stream;
mod transport;

pub use connection::*;
pub use inbound::*;
pub use outbound::*;
pub use stream::*;
pub use transport::*;
