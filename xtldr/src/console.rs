//! Debug console selection, driven by the `DEBUG=` kernel parameter.
//!
//! Grounded on `xtldr/debug.cc`'s `BlpParseDebugOptions`/`InitializeSerialPort`:
//! parse `COM<N>[:0x<base>][,<baud>]` (defaulting to COM1 at its standard
//! port and 115200 baud) or `SCREEN` for the framebuffer console, then stand
//! up the transport. The port I/O and register layout themselves are the
//! kernel's own `out::uart::UartPort` (`xtoskrnl::out::uart`), reused here
//! rather than re-implemented, since both loader and kernel run on the same
//! bare port-mapped hardware before and after handoff.

use xtoskrnl::out::uart::{UartPort, COM1, COM2, COM3, COM4};

use crate::error::{LdrResult, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugTarget {
    Serial { port_address: u16, baud: u32 },
    Screen,
    None,
}

const STANDARD_PORTS: [u16; 4] = [COM1, COM2, COM3, COM4];
const DEFAULT_BAUD: u32 = 115200;

/// Parses the `DEBUG=` kernel parameter value (e.g. `"COM2:0x2f8,9600"`,
/// `"COM1"`, `"SCREEN"`).
pub fn parse_debug_option(value: &str) -> LdrResult<DebugTarget> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(DebugTarget::None);
    }
    if value.eq_ignore_ascii_case("screen") {
        return Ok(DebugTarget::Screen);
    }

    let mut parts = value.splitn(2, ',');
    let port_spec = parts.next().unwrap_or("");
    let baud = match parts.next() {
        Some(b) => b.trim().parse::<u32>().map_err(|_| Status::InvalidParameter)?,
        None => DEFAULT_BAUD,
    };

    if !port_spec.to_ascii_uppercase().starts_with("COM") {
        return Err(Status::InvalidParameter);
    }
    let rest = &port_spec[3..];
    let mut number_and_base = rest.splitn(2, ':');
    let number_str = number_and_base.next().unwrap_or("1");
    let port_number: usize = if number_str.is_empty() {
        1
    } else {
        number_str.parse().map_err(|_| Status::InvalidParameter)?
    };
    if port_number == 0 || port_number > STANDARD_PORTS.len() {
        return Err(Status::InvalidParameter);
    }

    let port_address = match number_and_base.next() {
        Some(base_str) => {
            let base_str = base_str.trim();
            let hex = base_str.strip_prefix("0x").or_else(|| base_str.strip_prefix("0X"));
            match hex {
                Some(h) => u16::from_str_radix(h, 16).map_err(|_| Status::InvalidParameter)?,
                None => base_str.parse().map_err(|_| Status::InvalidParameter)?,
            }
        }
        None => STANDARD_PORTS[port_number - 1],
    };

    Ok(DebugTarget::Serial { port_address, baud })
}

/// Stands up the serial transport named by `target`, if any. Returns
/// `None` for `DebugTarget::Screen`/`DebugTarget::None` -- the framebuffer
/// console is handled by `xtoskrnl::out::framebuffer` directly once
/// handoff completes.
pub fn init_serial(target: DebugTarget) -> LdrResult<Option<UartPort>> {
    match target {
        DebugTarget::Serial { port_address, .. } => {
            // SAFETY: port_address is either a standard COM port or was
            // supplied explicitly by the `DEBUG=` kernel parameter.
            let (port, _version) =
                unsafe { UartPort::new(port_address) }.map_err(|_| Status::DeviceError)?;
            Ok(Some(port))
        }
        DebugTarget::Screen | DebugTarget::None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_com1_at_standard_port_and_baud() {
        let target = parse_debug_option("COM1").unwrap();
        assert_eq!(
            target,
            DebugTarget::Serial {
                port_address: COM1,
                baud: DEFAULT_BAUD
            }
        );
    }

    #[test]
    fn parses_explicit_port_and_baud() {
        let target = parse_debug_option("COM2:0x2f8,9600").unwrap();
        assert_eq!(
            target,
            DebugTarget::Serial {
                port_address: 0x2f8,
                baud: 9600
            }
        );
    }

    #[test]
    fn screen_is_case_insensitive() {
        assert_eq!(parse_debug_option("screen").unwrap(), DebugTarget::Screen);
        assert_eq!(parse_debug_option("SCREEN").unwrap(), DebugTarget::Screen);
    }

    #[test]
    fn empty_value_means_no_console() {
        assert_eq!(parse_debug_option("").unwrap(), DebugTarget::None);
    }

    #[test]
    fn rejects_out_of_range_port_number() {
        assert!(parse_debug_option("COM9").is_err());
    }
}
