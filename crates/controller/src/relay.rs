//! 16-channel Modbus relay board control.
//!
//! Named actuators (pumps, valves) map to channel indices via config.  The
//! controller keeps a cached state vector that is updated optimistically on
//! successful writes and replaced wholesale on `refresh()`.

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RelayEntry;
use crate::protocol;
use crate::transport::TransportMux;

pub const CHANNELS: usize = 16;

pub struct RelayController {
    mux: Arc<TransportMux>,
    port: String,
    address: u8,
    baud: u32,
    channels: BTreeMap<String, u8>,
    cached: [bool; CHANNELS],
}

impl RelayController {
    pub fn new(mux: Arc<TransportMux>, entry: &RelayEntry) -> Self {
        RelayController {
            mux,
            port: entry.port.clone(),
            address: entry.address,
            baud: entry.baud,
            channels: entry.channels.clone(),
            cached: [false; CHANNELS],
        }
    }

    pub fn channel_for(&self, name: &str) -> Option<u8> {
        self.channels.get(name).copied()
    }

    /// Last known state of a named channel.
    pub fn is_on(&self, name: &str) -> Option<bool> {
        self.channel_for(name).map(|ch| self.cached[ch as usize])
    }

    /// Named channel states for status snapshots.
    pub fn snapshot(&self) -> Vec<(String, bool)> {
        self.channels
            .iter()
            .map(|(name, &ch)| (name.clone(), self.cached[ch as usize]))
            .collect()
    }

    /// Read all 16 coils from the board and replace the cache.
    /// Bit `n` of payload byte `b` is channel `8*b + n`.
    pub async fn refresh(&mut self) -> Result<[bool; CHANNELS]> {
        let frame = protocol::read_coils(self.address, 0x0000, CHANNELS as u16);
        let resp = self
            .mux
            .request(&self.port, self.baud, frame, protocol::read_response_len(2))
            .await?;

        if resp.payload.len() != 3 || resp.payload[0] != 2 {
            bail!("malformed coil status payload ({} bytes)", resp.payload.len());
        }
        for ch in 0..CHANNELS {
            let byte = resp.payload[1 + ch / 8];
            self.cached[ch] = byte & (1 << (ch % 8)) != 0;
        }
        Ok(self.cached)
    }

    /// Switch one named channel.
    pub async fn set(&mut self, name: &str, on: bool) -> Result<()> {
        let Some(channel) = self.channel_for(name) else {
            bail!("unknown relay channel '{name}'");
        };
        self.write_coil(channel, on).await?;
        tracing::info!(relay = %name, channel, on, "relay set");
        Ok(())
    }

    /// Switch a set of channels.  A contiguous run goes out as one
    /// write-multiple-registers frame; scattered channels fall back to
    /// sequential single-coil writes (the transport enforces spacing).
    pub async fn set_channels(&mut self, channels: &[u8], on: bool) -> Result<()> {
        let mut sorted: Vec<u8> = channels.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.is_empty() {
            return Ok(());
        }

        let contiguous = sorted.windows(2).all(|w| w[1] == w[0] + 1);
        if contiguous && sorted.len() > 1 {
            let values = vec![u16::from(on); sorted.len()];
            let frame =
                protocol::write_multiple_registers(self.address, sorted[0] as u16, &values);
            self.mux
                .request(&self.port, self.baud, frame, protocol::WRITE_ECHO_LEN)
                .await?;
            for &ch in &sorted {
                self.cached[ch as usize] = on;
            }
        } else {
            for &ch in &sorted {
                self.write_coil(ch, on).await?;
            }
        }
        Ok(())
    }

    /// Drive every channel off in a single frame.  Used at startup and as
    /// the emergency stop.
    pub async fn all_off(&mut self) -> Result<()> {
        let frame = protocol::write_multiple_registers(self.address, 0, &[0u16; CHANNELS]);
        self.mux
            .request(&self.port, self.baud, frame, protocol::WRITE_ECHO_LEN)
            .await?;
        self.cached = [false; CHANNELS];
        tracing::info!("all relay channels off");
        Ok(())
    }

    async fn write_coil(&mut self, channel: u8, on: bool) -> Result<()> {
        let frame = protocol::write_single_coil(self.address, channel as u16, on);
        self.mux
            .request(&self.port, self.baud, frame, protocol::WRITE_ECHO_LEN)
            .await?;
        self.cached[channel as usize] = on;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
