//! Discovery of USB serial ports with a MicroPython board attached.

use serialport::{SerialPortInfo, SerialPortType};

use crate::{Error, Result};

/// A serial port whose USB ids match a known board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardPort {
    /// Device path.
    pub path: String,
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Product string reported by the device.
    pub product: Option<String>,
    /// Serial number reported by the device.
    pub serial_number: Option<String>,
}

/// Returns `true` for the USB ids of MicroPython boards (`f055:980x`) and
/// Teensy boards (`16c0:0483`).
pub const fn is_board(vid: u16, pid: u16) -> bool {
    match vid {
        // The last digit depends on the USB mode (VCP, MSC, HID).
        0xf055 => pid & 0xfff0 == 0x9800,
        0x16c0 => pid == 0x0483,
        _ => false,
    }
}

fn board_port(info: SerialPortInfo) -> Option<BoardPort> {
    let SerialPortType::UsbPort(usb) = info.port_type else {
        return None;
    };
    is_board(usb.vid, usb.pid).then(|| BoardPort {
        path: info.port_name,
        vid: usb.vid,
        pid: usb.pid,
        product: usb.product,
        serial_number: usb.serial_number,
    })
}

/// Lists the serial ports with a board attached.
pub fn scan() -> Result<Vec<BoardPort>> {
    let ports = serialport::available_ports()
        .map_err(|e| Error::Transport(format!("listing serial ports: {e}")))?;
    let boards: Vec<_> = ports.into_iter().filter_map(board_port).collect();
    tracing::debug!(found = boards.len(), "serial port scan");
    Ok(boards)
}

#[cfg(test)]
mod tests {
    use serialport::UsbPortInfo;

    use super::*;

    fn usb(path: &str, vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: path.into(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: Some("3276".into()),
                manufacturer: None,
                product: Some("Pyboard Virtual Comm Port".into()),
            }),
        }
    }

    #[test]
    fn matches_board_ids() {
        assert!(is_board(0xf055, 0x9800));
        assert!(is_board(0xf055, 0x9802));
        assert!(!is_board(0xf055, 0x9810));
        assert!(is_board(0x16c0, 0x0483));
        assert!(!is_board(0x16c0, 0x0484));
        assert!(!is_board(0x0403, 0x6001));
    }

    #[test]
    fn keeps_only_boards() {
        let found = board_port(usb("/dev/ttyACM0", 0xf055, 0x9801)).unwrap();
        assert_eq!(found.path, "/dev/ttyACM0");
        assert_eq!(found.serial_number.as_deref(), Some("3276"));

        assert!(board_port(usb("/dev/ttyUSB0", 0x0403, 0x6001)).is_none());
        let pci = SerialPortInfo {
            port_name: "/dev/ttyS0".into(),
            port_type: SerialPortType::PciPort,
        };
        assert!(board_port(pci).is_none());
    }
}
