//! wardgate/src/smart.rs
//! Packet handler that records traffic and kills flagged connections.

use crate::handler::TcpHandler;
use crate::judge::Judge;
use std::sync::Arc;

/// Records every inbound packet as the connection's history; when an
/// outbound packet carries a flag-shaped token the history is submitted to
/// the judge, and a kill verdict drops the packet (ending the connection).
pub struct SmartTcpHandler {
    judge: Arc<Judge>,
    history: Vec<Vec<u8>>,
}

impl SmartTcpHandler {
    pub fn new(judge: Arc<Judge>) -> Self {
        SmartTcpHandler {
            judge,
            history: Vec::new(),
        }
    }
}

impl TcpHandler for SmartTcpHandler {
    fn process(&mut self, packet: &[u8], inbound: bool) -> Option<Vec<u8>> {
        if inbound {
            self.history.push(packet.to_vec());
            return Some(packet.to_vec());
        }
        if self.judge.sees_flag(packet) && !self.judge.verdict(self.history.clone()) {
            return None;
        }
        Some(packet.to_vec())
    }
}
