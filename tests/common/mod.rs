#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use spoolfuzz::error::TransportError;
use spoolfuzz::{DeviceControl, FuzzConfig, HealthStatus, Transport};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

/// Any request containing this kills the simulated daemon until a restart.
pub const POISON: &[u8] = b"POISON";

#[derive(Debug, Default)]
pub struct PrinterState {
    pub crashed: bool,
    pub connections: usize,
    pub restarts: usize,
}

/// An in-memory LPD daemon that acks every packet with `0x00`.
#[derive(Clone, Default)]
pub struct Printer {
    pub state: Arc<Mutex<PrinterState>>,
}

impl Printer {
    pub fn crashed(&self) -> bool {
        self.state.lock().unwrap().crashed
    }

    pub fn power_switch(&self) -> PowerSwitch {
        PowerSwitch {
            state: self.state.clone(),
        }
    }
}

impl Transport for Printer {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    async fn connect(&self) -> Result<(Self::Reader, Self::Writer), TransportError> {
        let (client, mut server) = duplex(1 << 16);
        self.state.lock().unwrap().connections += 1;
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                if state.lock().unwrap().crashed {
                    break;
                }
                let n = match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if buf[..n].windows(POISON.len()).any(|w| w == POISON) {
                    state.lock().unwrap().crashed = true;
                    break;
                }
                if server.write_all(&[0x00]).await.is_err() {
                    break;
                }
            }
        });
        Ok(tokio::io::split(client))
    }
}

/// Brings a crashed [`Printer`] back.
pub struct PowerSwitch {
    state: Arc<Mutex<PrinterState>>,
}

impl DeviceControl for PowerSwitch {
    async fn restart(&mut self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.crashed = false;
        state.restarts += 1;
        true
    }

    async fn health_check(&mut self) -> HealthStatus {
        HealthStatus::Ok
    }

    async fn cleanup(&mut self) {}

    fn restart_interval(&self) -> Option<u64> {
        None
    }
}

pub fn fast_config(seed: u64) -> FuzzConfig {
    FuzzConfig {
        seed,
        recv_timeout: Duration::from_millis(100),
        recv_grace: Duration::from_millis(100),
        exchange_pause: Duration::ZERO,
        health_interval: Duration::ZERO,
        restart_probe_interval: Duration::from_millis(10),
        ..FuzzConfig::default()
    }
}
