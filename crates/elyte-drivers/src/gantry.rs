//! Cartesian gantry with disposable pipette exchange.
//!
//! Protocol: `Sketch` dialect at 9600 baud. Every action is one call such as
//! `move(27.500,0.000,0.000)` answered by a single status line:
//!
//! | Command               | Reply                             |
//! |-----------------------|-----------------------------------|
//! | `move(x,y,z)`         | `Move complete in Ns`             |
//! | `softHome()`          | `Gantry Homed`                    |
//! | `zHome()`             | status line                       |
//! | `mix(count,delay)`    | `Mix complete in Ns`              |
//! | `pinch()`             | `Pipettes successfully pinched`   |
//! | `release()`           | `Pipettes successfully released`  |
//! | `recover(x,y,z)`      | status line                       |
//! | `returnState()`       | `Gantry Kit Ready`                |
//!
//! The controller owns the [`RecoveryStore`]: every commanded position is made
//! durable before the command leaves the host, and the attached pipette slot is
//! recorded the moment the tip is seated.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use elyte_core::capabilities::{MotionStage, Position, SlotId, Station};
use elyte_core::error::{ElyteError, ElyteResult};
use elyte_core::link::{DeviceLink, Dialect};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::recovery::RecoveryStore;

const DEVICE: &str = "gantry";
const BANNER: &str = "Gantry Kit Ready";
const STATE_QUERY: &str = "returnState()";
const HOMED: &str = "Gantry Homed";
const DRAIN_QUIET_MS: u64 = 20;

// =============================================================================
// Configuration
// =============================================================================

/// Fixed workspace geometry, in millimetres unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GantryGeometry {
    /// Pot centres `[x, y]`, pot 1 first.
    pub pots: Vec<[f64; 2]>,
    pub rack_x: f64,
    /// y of rack slot 1; later slots step towards the origin.
    pub rack_y: f64,
    pub rack_pitch: f64,
    pub pick_height: f64,
    /// x offset beside the rack used to approach and leave a slot.
    pub lead_in: f64,
    /// x offset of the check pass after a pipette is released.
    pub verify_offset: f64,
    /// Rack skew correction, applied to rack moves only.
    pub x_correction: f64,
    pub y_correction: f64,
    pub pot_base_height: f64,
    pub pot_diameter_cm: f64,
    pub chamber: [f64; 2],
    pub dispense_height: f64,
    /// Offset added to every working height below the head.
    pub z_shift: f64,
}

impl Default for GantryGeometry {
    fn default() -> Self {
        Self {
            pots: vec![
                [41.0, 0.0],
                [75.0, 0.0],
                [109.0, 0.0],
                [143.0, 0.0],
                [58.0, 34.0],
                [92.0, 34.0],
                [126.0, 34.0],
                [75.0, 68.0],
                [109.0, 68.0],
                [143.0, 68.0],
            ],
            rack_x: 15.0,
            rack_y: 135.0,
            rack_pitch: 16.0,
            pick_height: -48.0,
            lead_in: 12.5,
            verify_offset: 2.0,
            x_correction: 0.0,
            y_correction: 0.0,
            pot_base_height: -69.5,
            pot_diameter_cm: 2.78,
            chamber: [125.0, 97.7],
            dispense_height: -10.0,
            z_shift: 0.0,
        }
    }
}

impl GantryGeometry {
    /// Rack slot centre with the skew correction applied.
    pub fn slot_xy(&self, slot: SlotId) -> (f64, f64) {
        let index = f64::from(slot.get() - 1);
        (
            self.rack_x + self.x_correction,
            self.rack_y - self.rack_pitch * index + self.y_correction,
        )
    }

    pub fn pot_xy(&self, pot: u8) -> ElyteResult<(f64, f64)> {
        pot.checked_sub(1)
            .and_then(|i| self.pots.get(usize::from(i)))
            .map(|[x, y]| (*x, *y))
            .ok_or_else(|| {
                ElyteError::Config(format!("pot {} not in gantry geometry ({} pots)", pot, self.pots.len()))
            })
    }

    /// Pot cross-section in cm².
    pub fn pot_area_cm2(&self) -> f64 {
        std::f64::consts::PI * self.pot_diameter_cm.powi(2) / 4.0
    }

    /// Tip height that just reaches below a liquid surface of `level_ml`.
    ///
    /// Never above the head plane and never below the pot base.
    pub fn liquid_height(&self, level_ml: f64) -> f64 {
        let base = self.pot_base_height + self.z_shift;
        let z = base + 10.0 * level_ml.max(0.0) / self.pot_area_cm2();
        z.clamp(base.min(0.0), 0.0)
    }

    pub fn pick_z(&self) -> f64 {
        self.pick_height + self.z_shift
    }

    pub fn dispense_z(&self) -> f64 {
        self.dispense_height + self.z_shift
    }

    /// Parking position beside the rack.
    pub fn start_position(&self) -> Position {
        Position::new(self.rack_x + self.lead_in, 0.0, 0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GantryConfig {
    pub port: String,
    pub baud_rate: u32,
    pub simulated: bool,
    /// Longest wait for a motion to report completion.
    pub timeout_ms: u64,
    /// Silence allowed after opening before the controller asks for the banner.
    pub boot_wait_ms: u64,
    pub recovery_path: PathBuf,
    /// Directory holding pre-JSON recovery files to import once.
    pub legacy_dir: Option<PathBuf>,
    pub home_on_startup: bool,
    pub geometry: GantryGeometry,
}

impl Default for GantryConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".into(),
            baud_rate: 9600,
            simulated: false,
            timeout_ms: 60_000,
            boot_wait_ms: 3000,
            recovery_path: PathBuf::from("data/variables/recovery.json"),
            legacy_dir: Some(PathBuf::from("data/variables")),
            home_on_startup: true,
            geometry: GantryGeometry::default(),
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Motion state as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GantryState {
    Idle,
    MovingTo(Position),
    PipetteAttached(SlotId),
    Homing,
}

impl std::fmt::Display for GantryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GantryState::Idle => write!(f, "Idle"),
            GantryState::MovingTo(p) => write!(f, "MovingTo({})", p),
            GantryState::PipetteAttached(slot) => write!(f, "PipetteAttached({})", slot),
            GantryState::Homing => write!(f, "Homing"),
        }
    }
}

// =============================================================================
// Gantry
// =============================================================================

pub struct Gantry {
    link: DeviceLink,
    config: GantryConfig,
    recovery: RecoveryStore,
    position: Position,
    state: GantryState,
}

impl Gantry {
    /// Open the gantry, recover its position and return any pipette left
    /// attached by a previous run.
    pub async fn connect(config: GantryConfig) -> ElyteResult<Self> {
        let link = if config.simulated {
            simulated_link()
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
        let recovery = RecoveryStore::load(&config.recovery_path, config.legacy_dir.as_deref())?;
        Self::with_link(link, config, recovery).await
    }

    /// Run the startup sequence over an existing link and recovery store.
    pub async fn with_link(
        link: DeviceLink,
        config: GantryConfig,
        recovery: RecoveryStore,
    ) -> ElyteResult<Self> {
        let position = recovery.last_position().unwrap_or(Position::ORIGIN);
        let mut gantry = Self {
            link,
            config,
            recovery,
            position,
            state: GantryState::Idle,
        };
        gantry.initialise().await?;
        Ok(gantry)
    }

    pub fn state(&self) -> GantryState {
        self.state
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub fn geometry(&self) -> &GantryGeometry {
        &self.config.geometry
    }

    #[instrument(skip(self), err)]
    async fn initialise(&mut self) -> ElyteResult<()> {
        self.link
            .await_banner(BANNER, Some(STATE_QUERY), Duration::from_millis(self.config.boot_wait_ms))
            .await?;
        info!("gantry kit ready");

        if let Some(last) = self.recovery.last_position() {
            info!(position = %last, "recovering last known position");
            self.exchange(&format!("recover({})", last), None).await?;
            self.position = last;
        }

        if let Some(slot) = self.recovery.active_pipette() {
            warn!(%slot, "pipette still attached from previous run, returning it");
            self.state = GantryState::PipetteAttached(slot);
            self.return_pipette().await?;
        }

        if self.config.home_on_startup {
            self.soft_home().await?;
        }
        self.move_to_start().await
    }

    /// Send one action and check its status line.
    async fn exchange(&mut self, command: &str, expect: Option<&str>) -> ElyteResult<String> {
        self.link.drain(DRAIN_QUIET_MS).await;
        let reply = self.link.command(command).await?;
        if let Some(expected) = expect {
            if !reply.starts_with(expected) {
                return Err(ElyteError::protocol(
                    DEVICE,
                    format!("{} answered {:?}, expected {:?}", command, reply, expected),
                ));
            }
        }
        debug!(command, reply = %reply, "gantry response");
        Ok(reply)
    }

    fn settle_state(&mut self) {
        self.state = match self.recovery.active_pipette() {
            Some(slot) => GantryState::PipetteAttached(slot),
            None => GantryState::Idle,
        };
    }

    /// Persist the target, then command the move.
    async fn go(&mut self, target: Position) -> ElyteResult<()> {
        self.recovery.set_position(target)?;
        self.state = GantryState::MovingTo(target);
        self.exchange(&format!("move({})", target), Some("Move complete"))
            .await?;
        self.position = target;
        self.settle_state();
        Ok(())
    }

    async fn home_with(&mut self, command: &str) -> ElyteResult<()> {
        self.recovery.set_position(Position::ORIGIN)?;
        self.state = GantryState::Homing;
        let reply = self.exchange(command, None).await?;
        if reply != HOMED {
            error!(command, reply = %reply, "gantry failed to home");
            return Err(ElyteError::hardware(
                DEVICE,
                format!("{} answered {:?}", command, reply),
            ));
        }
        self.position = Position::ORIGIN;
        self.settle_state();
        info!(command, "gantry homed");
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn soft_home(&mut self) -> ElyteResult<()> {
        self.home_with("softHome()").await
    }

    /// Raise straight to the head plane without touching x/y.
    async fn z_home(&mut self) -> ElyteResult<()> {
        let target = self.position.at_height(0.0);
        self.recovery.set_position(target)?;
        self.state = GantryState::MovingTo(target);
        self.exchange("zHome()", None).await?;
        self.position = target;
        self.settle_state();
        Ok(())
    }

    fn station_xy(&self, station: Station) -> ElyteResult<(f64, f64)> {
        match station {
            Station::Pot { pot, .. } => self.config.geometry.pot_xy(pot),
            Station::MixingChamber => {
                let [x, y] = self.config.geometry.chamber;
                Ok((x, y))
            }
        }
    }
}

#[async_trait]
impl MotionStage for Gantry {
    #[instrument(skip(self), err)]
    async fn move_to(&mut self, target: Position) -> ElyteResult<()> {
        self.go(target).await
    }

    async fn move_to_start(&mut self) -> ElyteResult<()> {
        let start = self.config.geometry.start_position();
        self.go(start).await
    }

    async fn approach(&mut self, station: Station) -> ElyteResult<()> {
        let (x, y) = self.station_xy(station)?;
        info!(?station, "moving above station");
        self.go(Position::new(x, y, 0.0)).await
    }

    async fn descend(&mut self, station: Station) -> ElyteResult<()> {
        let (x, y) = self.station_xy(station)?;
        let z = match station {
            Station::Pot { level_ml, .. } => self.config.geometry.liquid_height(level_ml),
            Station::MixingChamber => self.config.geometry.dispense_z(),
        };
        info!(?station, z_mm = z, "dropping pipette");
        self.go(Position::new(x, y, z)).await
    }

    async fn lift(&mut self) -> ElyteResult<()> {
        let target = self.position.at_height(0.0);
        self.go(target).await
    }

    #[instrument(skip(self), err)]
    async fn pick_pipette(&mut self, slot: SlotId) -> ElyteResult<()> {
        if let Some(active) = self.recovery.active_pipette() {
            let fault = ElyteError::State(format!(
                "pick of pipette {} requested while pipette {} is attached",
                slot, active
            ));
            error!(%fault, "pipette pick skipped");
            return Err(fault);
        }

        let geometry = &self.config.geometry;
        let (x, y) = geometry.slot_xy(slot);
        let lead_in = geometry.lead_in;
        let pick_z = geometry.pick_z();

        info!(%slot, "moving to pipette");
        self.go(Position::new(x + lead_in, y, 0.0)).await?;
        self.go(Position::new(x, y, 0.0)).await?;

        info!("dropping to collect pipette");
        self.go(Position::new(x, y, pick_z)).await?;
        self.recovery.set_active_pipette(Some(slot))?;
        self.state = GantryState::PipetteAttached(slot);

        info!(%slot, "raising pipette");
        self.z_home().await?;
        self.go(Position::new(x + lead_in, y, 0.0)).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn return_pipette(&mut self) -> ElyteResult<bool> {
        let Some(slot) = self.recovery.active_pipette() else {
            let fault = ElyteError::State("return pipette requested while no pipette is active".into());
            warn!(%fault, "pipette return skipped");
            return Ok(false);
        };

        let geometry = &self.config.geometry;
        let (x, y) = geometry.slot_xy(slot);
        let lead_in = geometry.lead_in;
        let verify_offset = geometry.verify_offset;
        let pick_z = geometry.pick_z();

        info!(%slot, "moving to pipette rack");
        self.go(Position::new(x + lead_in, y, 0.0)).await?;
        self.go(Position::new(x, y, 0.0)).await?;

        info!(%slot, "delivering pipette to rack");
        self.go(Position::new(x, y, pick_z)).await?;
        self.exchange("pinch()", Some("Pipettes successfully pinched"))
            .await?;

        info!("raising pipette module");
        self.go(Position::new(x, y, 0.0)).await?;
        self.exchange("release()", Some("Pipettes successfully released"))
            .await?;

        // Check pass: the head must clear the seated tip.
        self.go(Position::new(x + verify_offset, y, 0.0)).await?;
        self.go(Position::new(x + lead_in, y, 0.0)).await?;

        self.recovery.set_active_pipette(None)?;
        self.state = GantryState::Idle;
        info!(%slot, "pipette returned");
        Ok(true)
    }

    fn active_pipette(&self) -> Option<SlotId> {
        self.recovery.active_pipette()
    }

    #[instrument(skip(self), err)]
    async fn mix(&mut self, count: u32, delay_ms: u32) -> ElyteResult<()> {
        info!(count, delay_ms, "mixing electrolyte");
        self.go(Position::ORIGIN).await?;
        self.exchange(&format!("mix({},{})", count, delay_ms), Some("Mix complete"))
            .await?;
        Ok(())
    }

    async fn home(&mut self) -> ElyteResult<()> {
        self.soft_home().await
    }

    async fn close(&mut self) -> ElyteResult<()> {
        info!(state = %self.state, "closing gantry link");
        self.link.close().await
    }
}

fn simulated_link() -> DeviceLink {
    let mut link = DeviceLink::simulated(DEVICE, Dialect::Sketch);
    link.simulate_reply("move", "Move complete in 0s");
    link.simulate_reply("softHome", HOMED);
    link.simulate_reply("zHome", HOMED);
    link.simulate_reply("mix", "Mix complete in 0s");
    link.simulate_reply("pinch", "Pipettes successfully pinched");
    link.simulate_reply("release", "Pipettes successfully released");
    link.simulate_reply("recover", "Position recovered");
    link.simulate_reply("returnState", BANNER);
    link
}
