pub mod endpoint;
pub mod message;
pub mod room;
pub mod session;
pub mod websocket;
