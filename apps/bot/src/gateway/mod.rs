pub mod client;
pub mod correlator;
pub mod dispatcher;
pub mod events;
pub mod fanout;
pub mod heartbeat;
pub mod registry;
pub mod server;
pub mod session;
