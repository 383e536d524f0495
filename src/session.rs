//! Per-request server context

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::mbap::Frame;
use crate::pdu::ModbusPdu;

/// Remote peer of a server connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub address: IpAddr,
    pub port: u16,
}

impl ClientInfo {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }
}

impl From<SocketAddr> for ClientInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl std::fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", SocketAddr::new(self.address, self.port))
    }
}

/// Read-only view passed to the data store and change observers
#[derive(Debug, Clone, Copy)]
pub struct ServerInfo<'a> {
    pub client: &'a ClientInfo,
    pub recv_frame: &'a Frame,
}

/// State of one request/response exchange on a connection
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    pub client: ClientInfo,
    pub request: Frame,
    pub response: Frame,
}

impl SessionData {
    pub fn new(client: ClientInfo) -> Self {
        Self {
            client,
            ..Default::default()
        }
    }

    /// Reset for the next request, keeping the peer
    pub fn new_request(&mut self) {
        self.request = Frame::default();
        self.response = Frame::default();
    }

    /// Install the response PDU; the header echoes the request
    pub fn set_response(&mut self, pdu: ModbusPdu) {
        self.response.mbap = self.request.mbap.reply(pdu.len());
        self.response.pdu = pdu;
    }

    pub fn server_info(&self) -> ServerInfo<'_> {
        ServerInfo {
            client: &self.client,
            recv_frame: &self.request,
        }
    }
}
