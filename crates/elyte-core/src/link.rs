//! Device Link: the request/acknowledge transport shared by every instrument.
//!
//! Each instrument owns exactly one [`DeviceLink`] for its lifetime. A link is
//! either live (a buffered serial port) or simulated (no I/O at all).
//!
//! # Dialects
//!
//! | Dialect     | Write frame           | Read frame    | Reply                              |
//! |-------------|-----------------------|---------------|------------------------------------|
//! | `SmartPump` | `#W{reg},{value}\n`   | `#R{reg}\n`   | echo of the write / `#R{reg},{v}`  |
//! | `Regulator` | `$R{reg}={value}\r`   | `$R{reg}?\r`  | `> ` + echo, then value or blank   |
//! | `Sketch`    | `action(args)`        | n/a           | one status line, `Unknown command` |
//! | `Balance`   | single char command   | n/a           | streamed `  12.34 g` lines         |
//!
//! Sketch firmware parses up to the closing parenthesis, so its frames carry no
//! terminator.
//!
//! # Failure policy
//!
//! A malformed echo or an "unknown command" reply is a fatal
//! [`ElyteError::Protocol`]. A reply that never arrives inside the link's
//! timeout is an [`ElyteError::Timeout`], which callers may treat as
//! recoverable for telemetry polls.
//!
//! # Simulation
//!
//! Simulated links never touch a port: writes always succeed and are stored in
//! a register map, reads return the last written (or seeded) value, and
//! free-form commands return a reply configured with
//! [`DeviceLink::simulate_reply`]. Every frame a simulated link would have sent
//! is recorded in its transcript.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::error::{ElyteError, ElyteResult};
use crate::serial::{drain_serial_buffer, DynSerial};

/// Wire dialect spoken by an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Disc pump driver board: `#W` / `#R` register frames.
    SmartPump,
    /// Thermoelectric regulator: `$R` register frames with a `> ` prompt.
    Regulator,
    /// Microcontroller sketch accepting `action(args)` calls.
    Sketch,
    /// Streaming balance.
    Balance,
}

impl Dialect {
    fn terminator(&self) -> &'static str {
        match self {
            Dialect::SmartPump => "\n",
            Dialect::Regulator => "\r",
            Dialect::Sketch | Dialect::Balance => "",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::SmartPump => write!(f, "smart-pump"),
            Dialect::Regulator => write!(f, "regulator"),
            Dialect::Sketch => write!(f, "sketch"),
            Dialect::Balance => write!(f, "balance"),
        }
    }
}

enum Transport {
    Live(BufReader<DynSerial>),
    Simulated,
}

/// Reply a sketch sends when it does not recognise an action.
pub const UNKNOWN_COMMAND: &str = "Unknown command";

/// One instrument's serial connection.
pub struct DeviceLink {
    device: String,
    dialect: Dialect,
    timeout: Duration,
    transport: Transport,
    open: bool,
    registers: HashMap<u16, f64>,
    sim_replies: Vec<(String, String)>,
    transcript: Vec<String>,
}

impl DeviceLink {
    /// Link backed by an already-open port (or a duplex stream in tests).
    pub fn from_port(
        device: impl Into<String>,
        dialect: Dialect,
        port: DynSerial,
        timeout: Duration,
    ) -> Self {
        Self {
            device: device.into(),
            dialect,
            timeout,
            transport: Transport::Live(BufReader::new(port)),
            open: true,
            registers: HashMap::new(),
            sim_replies: Vec::new(),
            transcript: Vec::new(),
        }
    }

    /// Link that performs no I/O.
    pub fn simulated(device: impl Into<String>, dialect: Dialect) -> Self {
        Self {
            device: device.into(),
            dialect,
            timeout: Duration::from_secs(1),
            transport: Transport::Simulated,
            open: true,
            registers: HashMap::new(),
            sim_replies: Vec::new(),
            transcript: Vec::new(),
        }
    }

    /// Open a live serial link.
    #[cfg(feature = "serial")]
    pub async fn open(
        device: impl Into<String>,
        dialect: Dialect,
        port_path: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> ElyteResult<Self> {
        let device = device.into();
        let port = crate::serial::open_serial_async(port_path, baud_rate, &device).await?;
        tracing::info!(device = %device, port = port_path, baud_rate, %dialect, "serial link open");
        Ok(Self::from_port(device, dialect, port, timeout))
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.transport, Transport::Simulated)
    }

    /// Frames a simulated link would have sent, oldest first.
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    /// Preset the value a simulated register read returns.
    pub fn seed_register(&mut self, register: u16, value: f64) {
        self.registers.insert(register, value);
    }

    /// Reply a simulated link gives to commands starting with `prefix`.
    ///
    /// Later registrations take precedence over earlier ones.
    pub fn simulate_reply(&mut self, prefix: impl Into<String>, reply: impl Into<String>) {
        self.sim_replies.insert(0, (prefix.into(), reply.into()));
    }

    // =========================================================================
    // Register protocol
    // =========================================================================

    /// Write a register and confirm the echo (and acknowledgment, where the
    /// dialect sends one).
    pub async fn write_register(&mut self, register: u16, value: f64) -> ElyteResult<()> {
        let frame = match self.dialect {
            Dialect::SmartPump => format!("#W{},{}", register, value),
            Dialect::Regulator => format!("$R{}={}", register, value),
            other => {
                return Err(ElyteError::Config(format!(
                    "{} link has no register writes ({} dialect)",
                    self.device, other
                )))
            }
        };

        self.send(&frame).await?;
        if self.is_simulated() {
            self.registers.insert(register, value);
            return Ok(());
        }

        let op = format!("write R{}", register);
        let echo = self.read_line(&op).await?;
        self.verify_echo(&frame, &echo)?;

        if self.dialect == Dialect::Regulator {
            let ack = self.read_line(&op).await?;
            let accepted = ack.is_empty()
                || ack
                    .parse::<f64>()
                    .map(|v| (v - value).abs() <= 1e-9 * value.abs().max(1.0))
                    .unwrap_or(false);
            if !accepted {
                return Err(ElyteError::protocol(
                    &self.device,
                    format!("unexpected acknowledgment {:?} for {}", ack, frame),
                ));
            }
        }

        trace!(device = %self.device, register, value, "register written");
        Ok(())
    }

    /// Query a register and return its numeric payload.
    pub async fn read_register(&mut self, register: u16) -> ElyteResult<f64> {
        let frame = match self.dialect {
            Dialect::SmartPump => format!("#R{}", register),
            Dialect::Regulator => format!("$R{}?", register),
            other => {
                return Err(ElyteError::Config(format!(
                    "{} link has no register reads ({} dialect)",
                    self.device, other
                )))
            }
        };

        self.send(&frame).await?;
        if self.is_simulated() {
            return Ok(self.registers.get(&register).copied().unwrap_or(0.0));
        }

        let op = format!("read R{}", register);
        let payload = match self.dialect {
            Dialect::SmartPump => {
                let reply = self.read_line(&op).await?;
                let prefix = format!("{},", frame);
                match reply.strip_prefix(&prefix) {
                    Some(value) => value.trim().to_string(),
                    None => {
                        return Err(ElyteError::protocol(
                            &self.device,
                            format!("expected reply to {}, got {:?}", frame, reply),
                        ))
                    }
                }
            }
            _ => {
                let echo = self.read_line(&op).await?;
                self.verify_echo(&frame, &echo)?;
                self.read_line(&op).await?
            }
        };

        payload.parse::<f64>().map_err(|_| ElyteError::Parse {
            what: "register value",
            raw: payload,
        })
    }

    // =========================================================================
    // Free-form commands
    // =========================================================================

    /// Send a command and return the instrument's status reply.
    ///
    /// Regulator commands are echoed first; the echo is verified and the
    /// following line returned.
    pub async fn command(&mut self, command: &str) -> ElyteResult<String> {
        self.send(command).await?;
        if self.is_simulated() {
            let reply = self
                .sim_replies
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_default();
            return Ok(reply);
        }

        if self.dialect == Dialect::Regulator {
            let echo = self.read_line(command).await?;
            self.verify_echo(command, &echo)?;
        }

        let reply = self.read_line(command).await?;
        if reply == UNKNOWN_COMMAND {
            return Err(ElyteError::protocol(
                &self.device,
                format!("{} rejected as unknown command", command),
            ));
        }

        debug!(device = %self.device, command, reply = %reply, "command acknowledged");
        Ok(reply)
    }

    /// Send a frame without waiting for any reply.
    pub async fn send_raw(&mut self, frame: &str) -> ElyteResult<()> {
        self.send(frame).await
    }

    /// Wait for a startup banner, sending `query` if the instrument has
    /// already booted and stays silent for `boot_wait`.
    pub async fn await_banner(
        &mut self,
        banner: &str,
        query: Option<&str>,
        boot_wait: Duration,
    ) -> ElyteResult<()> {
        if self.is_simulated() {
            return Ok(());
        }

        let saved = self.timeout;
        self.timeout = boot_wait;
        let boot = self.read_line("startup banner").await;
        self.timeout = saved;

        let line = match (boot, query) {
            (Ok(line), _) => line,
            (Err(e), Some(query)) if e.is_timeout() => {
                self.send(query).await?;
                self.read_line("banner query").await?
            }
            (Err(e), _) => return Err(e),
        };

        if line != banner {
            return Err(ElyteError::protocol(
                &self.device,
                format!("expected banner {:?}, got {:?}", banner, line),
            ));
        }
        debug!(device = %self.device, banner, "instrument ready");
        Ok(())
    }

    /// Discard any unread input, returning the number of bytes dropped.
    pub async fn drain(&mut self, quiet_ms: u64) -> usize {
        match &mut self.transport {
            Transport::Live(reader) => {
                let buffered = reader.buffer().len();
                reader.consume(buffered);
                buffered + drain_serial_buffer(reader.get_mut(), quiet_ms).await
            }
            Transport::Simulated => 0,
        }
    }

    /// Read one reply line, stripped of line endings and any prompt.
    pub async fn read_line(&mut self, operation: &str) -> ElyteResult<String> {
        let timeout = self.timeout;
        let reader = match &mut self.transport {
            Transport::Live(reader) => reader,
            Transport::Simulated => return Ok(String::new()),
        };

        let mut raw = String::new();
        let read = tokio::time::timeout(timeout, reader.read_line(&mut raw))
            .await
            .map_err(|_| ElyteError::timeout(&self.device, operation, timeout))??;
        if read == 0 {
            return Err(ElyteError::protocol(
                &self.device,
                format!("port closed while waiting for {}", operation),
            ));
        }

        let line = self.clean(&raw);
        trace!(device = %self.device, line = %line, "rx");
        Ok(line)
    }

    /// Close the link. Idempotent.
    pub async fn close(&mut self) -> ElyteResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if let Transport::Live(reader) = &mut self.transport {
            reader.get_mut().shutdown().await?;
        }
        debug!(device = %self.device, "link closed");
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn send(&mut self, frame: &str) -> ElyteResult<()> {
        if !self.open {
            return Err(ElyteError::hardware(
                &self.device,
                format!("link closed, cannot send {}", frame),
            ));
        }

        trace!(device = %self.device, frame, "tx");
        let terminator = self.dialect.terminator();
        match &mut self.transport {
            Transport::Live(reader) => {
                let writer = reader.get_mut();
                writer
                    .write_all(format!("{}{}", frame, terminator).as_bytes())
                    .await?;
                writer.flush().await?;
            }
            Transport::Simulated => self.transcript.push(frame.to_string()),
        }
        Ok(())
    }

    fn clean(&self, raw: &str) -> String {
        let line = raw.trim_end_matches(['\r', '\n']).replace('\0', "");
        match self.dialect {
            Dialect::Regulator => line
                .trim()
                .trim_start_matches('>')
                .trim_start()
                .to_string(),
            _ => line.trim().to_string(),
        }
    }

    fn verify_echo(&self, frame: &str, echo: &str) -> ElyteResult<()> {
        if echo == frame {
            return Ok(());
        }
        let message = if echo.starts_with('?') || echo == UNKNOWN_COMMAND {
            format!("{} rejected as unknown command", frame)
        } else {
            format!("echo mismatch: sent {:?}, got {:?}", frame, echo)
        };
        Err(ElyteError::protocol(&self.device, message))
    }
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("device", &self.device)
            .field("dialect", &self.dialect)
            .field("simulated", &self.is_simulated())
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn live(dialect: Dialect) -> (DeviceLink, DuplexStream) {
        let (host, firmware) = tokio::io::duplex(256);
        let link = DeviceLink::from_port("dut", dialect, Box::new(host), Duration::from_millis(200));
        (link, firmware)
    }

    /// Read exactly `expected` from the host and answer with `reply`.
    async fn respond(firmware: &mut DuplexStream, expected: &str, reply: &str) {
        let mut buf = vec![0u8; expected.len()];
        firmware.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
        firmware.write_all(reply.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_write_confirms_echo() {
        let (mut link, mut fw) = live(Dialect::SmartPump);
        let firmware = tokio::spawn(async move {
            respond(&mut fw, "#W1,250\n", "#W1,250\n").await;
            fw
        });

        link.write_register(1, 250.0).await.unwrap();
        firmware.await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_bad_echo_is_protocol_fault() {
        let (mut link, mut fw) = live(Dialect::SmartPump);
        let firmware = tokio::spawn(async move {
            respond(&mut fw, "#W23,45.5\n", "#W23,4\n").await;
            fw
        });

        let err = link.write_register(23, 45.5).await.unwrap_err();
        assert!(matches!(err, ElyteError::Protocol { .. }), "{err}");
        assert!(err.is_fatal());
        firmware.await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_read_parses_payload() {
        let (mut link, mut fw) = live(Dialect::SmartPump);
        let firmware = tokio::spawn(async move {
            respond(&mut fw, "#R39\n", "#R39,31.25\r\n").await;
            fw
        });

        let value = link.read_register(39).await.unwrap();
        assert!((value - 31.25).abs() < 1e-12);
        firmware.await.unwrap();
    }

    #[tokio::test]
    async fn test_regulator_write_with_prompt_and_blank_ack() {
        let (mut link, mut fw) = live(Dialect::Regulator);
        let firmware = tokio::spawn(async move {
            respond(&mut fw, "$R13=6\r", "> $R13=6\r\n\r\n").await;
            respond(&mut fw, "$R0=25.5\r", "> $R0=25.5\r\n25.5\r\n").await;
            fw
        });

        link.write_register(13, 6.0).await.unwrap();
        link.write_register(0, 25.5).await.unwrap();
        firmware.await.unwrap();
    }

    #[tokio::test]
    async fn test_regulator_unknown_command() {
        let (mut link, mut fw) = live(Dialect::Regulator);
        let firmware = tokio::spawn(async move {
            respond(&mut fw, "$R999?\r", "> ?$R999?\r\n").await;
            fw
        });

        let err = link.read_register(999).await.unwrap_err();
        assert!(err.to_string().contains("unknown command"), "{err}");
        firmware.await.unwrap();
    }

    #[tokio::test]
    async fn test_sketch_unknown_command_is_fatal() {
        let (mut link, mut fw) = live(Dialect::Sketch);
        let firmware = tokio::spawn(async move {
            respond(&mut fw, "wiggle()", "Unknown command\r\n").await;
            fw
        });

        let err = link.command("wiggle()").await.unwrap_err();
        assert!(matches!(err, ElyteError::Protocol { .. }));
        firmware.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let (mut link, _fw) = live(Dialect::Sketch);
        let err = link.command("move(1,2,3)").await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_banner_query_after_boot_silence() {
        let (mut link, mut fw) = live(Dialect::Sketch);
        let firmware = tokio::spawn(async move {
            respond(&mut fw, "returnState()", "Gantry Kit Ready\r\n").await;
            fw
        });

        link.await_banner("Gantry Kit Ready", Some("returnState()"), Duration::from_secs(2))
            .await
            .unwrap();
        firmware.await.unwrap();
    }

    #[tokio::test]
    async fn test_simulated_registers_and_transcript() {
        let mut link = DeviceLink::simulated("pipette", Dialect::SmartPump);
        link.seed_register(39, 30.0);

        link.write_register(23, 55.0).await.unwrap();
        assert_eq!(link.read_register(23).await.unwrap(), 55.0);
        assert_eq!(link.read_register(39).await.unwrap(), 30.0);
        assert_eq!(link.read_register(5).await.unwrap(), 0.0);
        assert_eq!(link.transcript(), ["#W23,55", "#R23", "#R39", "#R5"]);
    }

    #[tokio::test]
    async fn test_closed_link_rejects_commands() {
        let mut link = DeviceLink::simulated("fluid", Dialect::Sketch);
        link.simulate_reply("addElectrolyte", "Pump complete in 3s");
        assert_eq!(link.command("addElectrolyte(1.2)").await.unwrap(), "Pump complete in 3s");

        link.close().await.unwrap();
        link.close().await.unwrap();
        assert!(!link.is_open());
        assert!(link.command("emptyCell(1.2)").await.is_err());
    }
}
