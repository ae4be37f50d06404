//! Fluid handling kit: peristaltic pumps between the mixing chamber, the test
//! cell and waste.
//!
//! Protocol: `Sketch` dialect at 9600 baud, volumes in millilitres:
//! `addElectrolyte(ml)`, `emptyCell(ml)` and `cleanCell(ml)`, each answered
//! with `Pump complete in Ns`.

use std::time::Duration;

use async_trait::async_trait;
use elyte_core::capabilities::FluidTransfer;
use elyte_core::error::{ElyteError, ElyteResult};
use elyte_core::link::{DeviceLink, Dialect};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

const DEVICE: &str = "fluid";
const BANNER: &str = "Fluid Handling Kit Ready";
const STATE_QUERY: &str = "returnState()";
const PUMP_COMPLETE: &str = "Pump complete";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidConfig {
    pub port: String,
    pub baud_rate: u32,
    pub simulated: bool,
    /// Longest wait for a pump cycle to report completion.
    pub timeout_ms: u64,
    pub boot_wait_ms: u64,
    /// Transfer tubing length; 2 mm bore, so 1 mm of tube holds π µL.
    pub tube_length_mm: f64,
    pub over_pump: f64,
    pub clean_over_pump: f64,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM1".into(),
            baud_rate: 9600,
            simulated: false,
            timeout_ms: 120_000,
            boot_wait_ms: 3000,
            tube_length_mm: 300.0,
            over_pump: 1.2,
            clean_over_pump: 1.0,
        }
    }
}

impl FluidConfig {
    /// Millilitres to pump so that `volume_ul` clears the tubing.
    pub fn pumped_ml(&self, volume_ul: f64, over_pump: f64) -> f64 {
        let tube_ml = std::f64::consts::PI * self.tube_length_mm * 1e-3;
        over_pump * (volume_ul.max(0.0) / 1000.0 + tube_ml)
    }
}

pub struct FluidHandler {
    link: DeviceLink,
    config: FluidConfig,
}

impl FluidHandler {
    pub async fn connect(config: FluidConfig) -> ElyteResult<Self> {
        let link = if config.simulated {
            let mut link = DeviceLink::simulated(DEVICE, Dialect::Sketch);
            for action in ["addElectrolyte", "emptyCell", "cleanCell"] {
                link.simulate_reply(action, "Pump complete in 0s");
            }
            link
        } else {
            DeviceLink::open(
                DEVICE,
                Dialect::Sketch,
                &config.port,
                config.baud_rate,
                Duration::from_millis(config.timeout_ms),
            )
            .await?
        };
        Self::with_link(link, config).await
    }

    pub async fn with_link(mut link: DeviceLink, config: FluidConfig) -> ElyteResult<Self> {
        link.await_banner(BANNER, Some(STATE_QUERY), Duration::from_millis(config.boot_wait_ms))
            .await?;
        info!("fluid handling kit ready");
        Ok(Self { link, config })
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    async fn pump(&mut self, action: &str, volume_ml: f64) -> ElyteResult<()> {
        let command = format!("{}({:.4})", action, volume_ml);
        let reply = self.link.command(&command).await?;
        if !reply.starts_with(PUMP_COMPLETE) {
            return Err(ElyteError::protocol(
                DEVICE,
                format!("{} answered {:?}", command, reply),
            ));
        }
        debug!(command = %command, reply = %reply, "pump cycle complete");
        Ok(())
    }
}

#[async_trait]
impl FluidTransfer for FluidHandler {
    #[instrument(skip(self), err)]
    async fn add_electrolyte(&mut self, volume_ul: f64) -> ElyteResult<()> {
        info!(volume_ul, "pumping electrolyte to test cell");
        let ml = self.config.pumped_ml(volume_ul, self.config.over_pump);
        self.pump("addElectrolyte", ml).await
    }

    #[instrument(skip(self), err)]
    async fn empty_cell(&mut self, volume_ul: f64) -> ElyteResult<()> {
        info!(volume_ul, "pumping test cell to waste");
        let ml = self.config.pumped_ml(volume_ul, self.config.over_pump);
        self.pump("emptyCell", ml).await
    }

    #[instrument(skip(self), err)]
    async fn clean_cell(&mut self, volume_ul: f64) -> ElyteResult<()> {
        info!(volume_ul, "pumping cleaning solution to test cell");
        let ml = self.config.pumped_ml(volume_ul, self.config.clean_over_pump);
        self.pump("cleanCell", ml).await?;
        self.empty_cell(volume_ul).await
    }

    async fn close(&mut self) -> ElyteResult<()> {
        info!("closing fluid handling kit link");
        self.link.close().await
    }
}
