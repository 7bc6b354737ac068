//! Serial port transport implementation

use super::{ByteChannel, ChannelError, PortOpener, StreamChannel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

impl std::str::FromStr for SerialFlowControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "hardware" | "hw" | "rtscts" => Ok(Self::Hardware),
            "software" | "sw" | "xonxoff" => Ok(Self::Software),
            other => Err(format!("unknown flow control: {other}")),
        }
    }
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity: {other}")),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Create a new serial configuration with 8N1 framing
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Short description, e.g. `/dev/ttyS0 @ 9600 baud (8N1)`
    pub fn describe(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{})",
            self.port,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits,
        )
    }

    /// Open the port as a byte channel
    pub fn open(&self) -> Result<StreamChannel<SerialStream>, ChannelError> {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match self.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => ChannelError::PortNotFound(self.port.clone()),
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    ChannelError::PermissionDenied(self.port.clone())
                }
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    ChannelError::PortNotFound(self.port.clone())
                }
                _ => ChannelError::Open {
                    port: self.port.clone(),
                    reason: e.to_string(),
                },
            })?;

        tracing::info!(port = %self.port, baud = self.baud_rate, "serial port opened");
        Ok(StreamChannel::new(&self.port, stream))
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("", 9600)
    }
}

/// Opens serial ports using a configuration template.
///
/// Framing and flow control come from the template; port name and baud
/// rate from each `open` call.
#[derive(Debug, Clone, Default)]
pub struct SerialOpener {
    template: SerialConfig,
}

impl SerialOpener {
    /// Create an opener from a configuration template
    pub fn new(template: SerialConfig) -> Self {
        Self { template }
    }
}

#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Arc<dyn ByteChannel>, ChannelError> {
        let mut config = self.template.clone();
        config.port = port.to_string();
        config.baud_rate = baud_rate;
        let channel = config.open()?;
        Ok(Arc::new(channel))
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, ChannelError> {
    serialport::available_ports().map_err(|e| ChannelError::Io(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_9600_8n1() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.stop_bits, 1);
        assert_eq!(config.parity, SerialParity::None);
        assert_eq!(config.flow_control, SerialFlowControl::None);
    }

    #[test]
    fn test_describe() {
        let config = SerialConfig::new("/dev/ttyS0", 19200).parity(SerialParity::Even);
        assert_eq!(config.describe(), "/dev/ttyS0 @ 19200 baud (8E1)");
    }

    #[test]
    fn test_parse_parity_and_flow() {
        assert_eq!("e".parse::<SerialParity>().unwrap(), SerialParity::Even);
        assert!("mark".parse::<SerialParity>().is_err());
        assert_eq!("hw".parse::<SerialFlowControl>().unwrap(), SerialFlowControl::Hardware);
        assert!("maybe".parse::<SerialFlowControl>().is_err());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let opener = SerialOpener::default();
        let result = opener.open("/dev/modemlink-does-not-exist", 9600).await;
        assert!(result.is_err());
    }
}
