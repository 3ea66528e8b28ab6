//! TubeClient - registers a client with a message-queue master
//!
//! The master speaks a framed binary protocol over TCP. This crate provides
//! the frame codec, a connection that correlates responses with requests,
//! and a registration client built on top of both.

pub mod config;
pub mod network;
pub mod protocol;

pub use network::{
    ClientError, Connection, ConnectionError, MasterAddr, MasterAddrList, NetworkConfig,
    PendingRegistration, PendingResponse, RegistrationClient, RegistrationState,
};
pub use protocol::{
    BincodeCodec, CodecError, Decoder, Frame, MasterStatus, MessageCodec, RegistrationRequest,
    RegistrationResponse,
};
