/*!
 * Mass flow controller line protocol.
 *
 * Commands are ASCII lines of the form `!<id>,<cmd>[,<args>]\r\n` with the
 * unit address as two upper-case hex digits. Every command is confirmed by
 * an exact echo; the rate query answers `!<id>,<rate>\r\n`. Each write and
 * each read of an exchange gets its own timeout.
 */
use std::time::Duration;

use regex::Regex;
use tracing::trace;

use portflow_core::types::Timestamp;
use portflow_core::utils::with_timeout;

use crate::device::{DeviceError, Result};
use crate::transport::{LineTransport, ReadUntil};

/// Default per-exchange timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(4000);

/// Longest rate-query response read before giving up on a terminator
pub const MAX_RATE_RESPONSE: usize = 24;

/// Command builder and response checker for one unit on the line
#[derive(Debug, Clone)]
pub struct RateProtocol {
    id: u8,
    timeout: Duration,
    rate_pattern: Regex,
}

impl RateProtocol {
    /// Create a new protocol for the unit at `id`
    pub fn new(id: u8, timeout: Duration) -> Result<Self> {
        let pattern = format!(r"^!{:02X},([0-9.]+)\r\n$", id);
        let rate_pattern = Regex::new(&pattern)
            .map_err(|e| DeviceError::config(format!("invalid rate pattern: {}", e)))?;
        Ok(Self {
            id,
            timeout,
            rate_pattern,
        })
    }

    /// Unit address
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Per-exchange timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Frame a command body for this unit
    pub fn frame(&self, body: &str) -> String {
        format!("!{:02X},{}\r\n", self.id, body)
    }

    /// Switch to digital control
    pub fn digital_mode(&self) -> (String, String) {
        (self.frame("M,D"), self.frame("MD"))
    }

    /// Report rates in standard litres per minute
    pub fn slpm_units(&self) -> (String, String) {
        (self.frame("U,SLPM"), self.frame("USLPM"))
    }

    /// Set the flow rate setpoint
    pub fn set_rate(&self, rate: f64) -> (String, String) {
        (
            self.frame(&format!("S,{:.3}", rate)),
            self.frame(&format!("S{:.3}", rate)),
        )
    }

    /// Query the measured flow rate
    pub fn query_rate(&self) -> String {
        self.frame("F")
    }

    /// Parse a rate-query response
    pub fn parse_rate(&self, response: &str) -> Result<f64> {
        let mismatch = || DeviceError::ProtocolMismatch {
            expected: self.frame("<rate>"),
            received: response.to_string(),
        };
        let captures = self.rate_pattern.captures(response).ok_or_else(mismatch)?;
        captures[1].parse::<f64>().map_err(|_| mismatch())
    }

    /// Write `command` and require `echo` back, byte for byte
    pub async fn exchange(
        &self,
        transport: &mut dyn LineTransport,
        command: &str,
        echo: &str,
    ) -> Result<Timestamp> {
        self.write(transport, command).await?;
        let (timestamp, received) = with_timeout(
            self.timeout,
            "line read",
            transport.read(ReadUntil::Length(echo.len()), self.timeout),
        )
        .await?;

        if received != echo {
            return Err(DeviceError::ProtocolMismatch {
                expected: echo.to_string(),
                received,
            });
        }
        trace!(unit = self.id, command = command.trim_end(), "Command confirmed");
        Ok(timestamp)
    }

    /// Put the unit in digital mode with SLPM units and a zero setpoint
    pub async fn initialize(&self, transport: &mut dyn LineTransport) -> Result<Timestamp> {
        let (command, echo) = self.digital_mode();
        self.exchange(transport, &command, &echo).await?;
        let (command, echo) = self.slpm_units();
        self.exchange(transport, &command, &echo).await?;
        self.write_rate(transport, 0.0).await
    }

    /// Change the setpoint
    pub async fn write_rate(&self, transport: &mut dyn LineTransport, rate: f64) -> Result<Timestamp> {
        let (command, echo) = self.set_rate(rate);
        self.exchange(transport, &command, &echo).await
    }

    /// Read the measured rate
    pub async fn read_rate(&self, transport: &mut dyn LineTransport) -> Result<(Timestamp, f64)> {
        self.write(transport, &self.query_rate()).await?;
        let until = ReadUntil::Terminator {
            max: MAX_RATE_RESPONSE,
            stop: b'\n',
        };
        let (timestamp, response) =
            with_timeout(self.timeout, "line read", transport.read(until, self.timeout)).await?;
        Ok((timestamp, self.parse_rate(&response)?))
    }

    async fn write(&self, transport: &mut dyn LineTransport, command: &str) -> Result<()> {
        with_timeout(self.timeout, "line write", transport.write(command, self.timeout)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedMfc;

    fn protocol() -> RateProtocol {
        RateProtocol::new(0x0A, Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn test_command_text() {
        let protocol = protocol();
        assert_eq!(
            protocol.digital_mode(),
            ("!0A,M,D\r\n".to_string(), "!0A,MD\r\n".to_string())
        );
        assert_eq!(
            protocol.slpm_units(),
            ("!0A,U,SLPM\r\n".to_string(), "!0A,USLPM\r\n".to_string())
        );
        assert_eq!(
            protocol.set_rate(12.5),
            ("!0A,S,12.500\r\n".to_string(), "!0A,S12.500\r\n".to_string())
        );
        assert_eq!(protocol.query_rate(), "!0A,F\r\n");
    }

    #[test]
    fn test_parse_rate() {
        let protocol = protocol();
        assert_eq!(protocol.parse_rate("!0A,12.500\r\n").unwrap(), 12.5);
        assert_eq!(protocol.parse_rate("!0A,0\r\n").unwrap(), 0.0);

        for bad in ["!0B,12.500\r\n", "!0A,12.500\n", "0A,1.0\r\n", "!0A,-1\r\n", "!0A,1.2.3\r\n"] {
            assert!(
                matches!(protocol.parse_rate(bad), Err(DeviceError::ProtocolMismatch { .. })),
                "{:?} should not parse",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_initialize_and_query() {
        let protocol = protocol();
        let mut line = SimulatedMfc::new(0x0A);
        line.set_rate(3.25);

        LineTransport::open(&mut line).await.unwrap();
        protocol.initialize(&mut line).await.unwrap();
        assert_eq!(
            line.written(),
            vec!["!0A,M,D\r\n", "!0A,U,SLPM\r\n", "!0A,S,0.000\r\n"]
        );

        protocol.write_rate(&mut line, 12.5).await.unwrap();
        let (_, rate) = protocol.read_rate(&mut line).await.unwrap();
        assert_eq!(rate, 12.5);
    }

    #[tokio::test]
    async fn test_wrong_echo_is_mismatch() {
        let protocol = protocol();
        let mut line = SimulatedMfc::new(0x0A);
        LineTransport::open(&mut line).await.unwrap();
        line.script_reply("!0A,S12.400\r\n");

        match protocol.write_rate(&mut line, 12.5).await {
            Err(DeviceError::ProtocolMismatch { expected, received }) => {
                assert_eq!(expected, "!0A,S12.500\r\n");
                assert_eq!(received, "!0A,S12.400\r\n");
            }
            other => panic!("expected a protocol mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_unit_times_out() {
        let protocol = protocol();
        let mut line = SimulatedMfc::new(0x0A);
        LineTransport::open(&mut line).await.unwrap();
        line.set_silent(true);

        let err = protocol.read_rate(&mut line).await.unwrap_err();
        assert!(matches!(err, DeviceError::TransportTimeout(_)), "{:?}", err);
    }
}
