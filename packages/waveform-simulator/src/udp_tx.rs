//! UDP transmitter for waveform packets and picks.
//!
//! Sends binary waveform packets (and JSON pick packets) to the engine's
//! acquisition socket. Send errors are logged but never crash the simulator.

use std::net::UdpSocket;

use seismic_types::{encode_pick, encode_record, Pick, RawRecord};
use tracing::{debug, warn};

pub struct UdpTransmitter {
    socket: UdpSocket,
    engine_addr: String,
}

impl UdpTransmitter {
    pub fn new(engine_addr: &str) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            engine_addr: engine_addr.to_string(),
        })
    }

    /// Send every record of one generation window.
    pub fn send_records(&self, records: &[RawRecord]) {
        for rec in records {
            let bytes = match encode_record(rec) {
                Ok(b) => b,
                Err(e) => {
                    warn!("UDP: encode failed for {}: {e}", rec.id);
                    continue;
                }
            };
            if let Err(e) = self.socket.send_to(&bytes, &self.engine_addr) {
                warn!("UDP: send failed: {e}");
            } else {
                debug!(
                    "UDP → {} {} {} samples",
                    self.engine_addr,
                    rec.id,
                    rec.counts.len()
                );
            }
        }
    }

    pub fn send_picks(&self, picks: &[Pick]) {
        for pick in picks {
            if let Err(e) = self.socket.send_to(&encode_pick(pick), &self.engine_addr) {
                warn!("UDP: pick send failed: {e}");
            }
        }
    }
}
