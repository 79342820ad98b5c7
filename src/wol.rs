//! Wake-on-LAN for an executing machine that may be asleep.

use tokio::net::UdpSocket;
use tracing::info;

use crate::config::WakeOnLanConfig;

#[derive(Debug, thiserror::Error)]
pub enum WolError {
    #[error("Invalid MAC address: '{0}'")]
    InvalidMac(String),

    #[error("Failed to send magic packet: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`.
pub fn parse_mac(mac: &str) -> Result<[u8; 6], WolError> {
    let invalid = || WolError::InvalidMac(mac.to_string());

    let parts: Vec<&str> = mac.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(invalid());
    }

    let mut bytes = [0u8; 6];
    for (byte, part) in bytes.iter_mut().zip(parts) {
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    Ok(bytes)
}

/// Six `0xFF` bytes followed by the MAC repeated sixteen times.
pub fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut packet = [0xFFu8; 102];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    packet
}

/// Broadcasts a magic packet for the configured machine.
pub async fn wake(config: &WakeOnLanConfig) -> Result<(), WolError> {
    let mac = parse_mac(&config.mac)?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket
        .send_to(&magic_packet(mac), (config.broadcast.as_str(), config.port))
        .await?;

    info!(
        "Sent wake-on-LAN packet for {} to {}:{}",
        config.mac, config.broadcast, config.port
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("00:11:22:aa:BB:ff").unwrap(),
            [0x00, 0x11, 0x22, 0xaa, 0xbb, 0xff]
        );
        assert_eq!(
            parse_mac("00-11-22-33-44-55").unwrap(),
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]
        );
        for bad in ["", "00:11:22:33:44", "00:11:22:33:44:5g", "0:11:22:33:44:55"] {
            assert!(parse_mac(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac = [1, 2, 3, 4, 5, 6];
        let packet = magic_packet(mac);

        assert_eq!(&packet[..6], &[0xFF; 6]);
        assert_eq!(&packet[6..12], &mac);
        assert_eq!(&packet[96..], &mac);
    }

    #[tokio::test]
    async fn test_wake_sends_to_configured_port() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let config = WakeOnLanConfig {
            mac: "00:11:22:33:44:55".to_string(),
            port,
            broadcast: "127.0.0.1".to_string(),
        };
        wake(&config).await.unwrap();

        let mut buf = [0u8; 128];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 102);
        assert_eq!(&buf[6..12], &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }
}
