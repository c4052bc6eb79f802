pub mod channel;
pub mod family;
pub mod gateway;
pub mod ghost;
pub mod location;
