//! Hardware decode with transparent software fallback
//!
//! [`CodecSession`] owns the codec factory next to the open context. When
//! a hardware context rejects every hardware format during negotiation the
//! session reopens the codec in software mode and re-sends the packet, so
//! callers only ever see a working codec.

use crate::media::{CodecContext, CodecFactory, DecodeMode, Packet, ReceiveStatus, SendStatus};
use crate::utils::error::{PlayerError, Result};
use log::{info, warn};

/// Open codec plus the factory needed to reopen it
pub struct CodecSession {
    factory: Box<dyn CodecFactory>,
    codec: Box<dyn CodecContext>,
    label: String,
    fallbacks: u32,
}

impl CodecSession {
    /// Open a codec, trying hardware first when allowed and supported
    pub fn open(mut factory: Box<dyn CodecFactory>, prefer_hardware: bool, label: &str) -> Result<Self> {
        let codec = if prefer_hardware && factory.supports_hardware() {
            match factory.open(DecodeMode::Hardware) {
                Ok(codec) => codec,
                Err(e) => {
                    warn!("{}: hardware decoder unavailable ({}), using software", label, e);
                    factory.open(DecodeMode::Software)?
                }
            }
        } else {
            factory.open(DecodeMode::Software)?
        };

        info!("{}: decoding in {:?} mode", label, codec.mode());

        Ok(Self {
            factory,
            codec,
            label: label.to_string(),
            fallbacks: 0,
        })
    }

    /// Send a packet; hardware rejection is handled here. `Err` means the
    /// codec could not be reopened and the decoder cannot continue.
    pub fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
        loop {
            match self.codec.send_packet(packet) {
                SendStatus::HardwareRejected => {
                    if self.codec.mode() == DecodeMode::Software {
                        return Err(PlayerError::Decoder(format!(
                            "{}: software decoder reported a hardware format failure",
                            self.label
                        )));
                    }
                    warn!("{}: hardware format negotiation failed, falling back to software", self.label);
                    self.codec = self.factory.open(DecodeMode::Software)?;
                    self.fallbacks += 1;
                }
                status => return Ok(status),
            }
        }
    }

    pub fn receive_frame(&mut self) -> ReceiveStatus {
        self.codec.receive_frame()
    }

    pub fn flush(&mut self) {
        self.codec.flush();
    }

    pub fn mode(&self) -> DecodeMode {
        self.codec.mode()
    }

    /// Times the session fell back to software
    pub fn fallback_count(&self) -> u32 {
        self.fallbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::synthetic::{SyntheticCodecFactory, SyntheticConfig};
    use crate::media::MediaType;

    fn factory(reject_hardware: bool) -> Box<dyn CodecFactory> {
        let config = SyntheticConfig {
            reject_hardware,
            ..SyntheticConfig::default()
        };
        Box::new(SyntheticCodecFactory::new(MediaType::Video, config))
    }

    fn packet() -> Packet {
        Packet {
            stream_index: 0,
            data: vec![0; 8],
            pts: Some(0),
            dts: Some(0),
            duration: 1,
            pos: 0,
        }
    }

    #[test]
    fn test_prefers_hardware() {
        let session = CodecSession::open(factory(false), true, "video").unwrap();
        assert_eq!(session.mode(), DecodeMode::Hardware);

        let session = CodecSession::open(factory(false), false, "video").unwrap();
        assert_eq!(session.mode(), DecodeMode::Software);
    }

    #[test]
    fn test_fallback_is_transparent() {
        let mut session = CodecSession::open(factory(true), true, "video").unwrap();
        assert_eq!(session.mode(), DecodeMode::Hardware);

        let status = session.send_packet(&packet()).unwrap();
        assert!(matches!(status, SendStatus::Accepted));
        assert_eq!(session.mode(), DecodeMode::Software);
        assert_eq!(session.fallback_count(), 1);
        assert!(matches!(session.receive_frame(), ReceiveStatus::Frame(_)));
    }
}
