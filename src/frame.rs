//! Stateless ISO-TP frame codec
//!
//! Byte 0 of every frame carries the protocol control information (PCI):
//!
//! | High nibble | Frame | Rest of the PCI |
//! |---|---|---|
//! | 0 | Single frame | Low nibble = length (0 = CAN-FD escape, length in byte 1) |
//! | 1 | First frame | Low nibble + byte 1 = 12 bit length (0 = escape, 32 bit length in bytes 2..6) |
//! | 2 | Consecutive frame | Low nibble = sequence counter, 1..15 then wrapping to 0 |
//! | 3 | Flow control | See [crate::flow_control] |

use strum_macros::{Display, FromRepr};

use crate::{flow_control::FlowControlFrame, TransportError, TransportResult};

/// Frame length of classic CAN
pub const CLASSIC_FRAME_LEN: usize = 8;

/// Largest CAN-FD frame length
pub const MAX_FD_FRAME_LEN: usize = 64;

/// Largest message length expressible in the 12 bit first frame length field
pub const MAX_12BIT_MESSAGE_LEN: usize = 0xFFF;

/// Frame type (high nibble of the PCI byte)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum FrameType {
    /// Single frame (SF)
    Single = 0x0,
    /// First frame of a multi-frame message (FF)
    First = 0x1,
    /// Consecutive frame of a multi-frame message (CF)
    Consecutive = 0x2,
    /// Flow control (FC)
    FlowControl = 0x3,
}

/// Frame layout settings of a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameSettings {
    /// Maximum CAN frame length (8 classic, up to 64 for CAN-FD)
    pub max_frame_length: usize,
    /// Pad every frame to `max_frame_length`
    pub padding_enabled: bool,
    /// Byte used for padding
    pub padding_byte: u8,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            max_frame_length: CLASSIC_FRAME_LEN,
            padding_enabled: true,
            padding_byte: 0x00,
        }
    }
}

impl FrameSettings {
    /// Padding byte, if padding is enabled
    pub fn padding(&self) -> Option<u8> {
        self.padding_enabled.then_some(self.padding_byte)
    }

    /// Checks the frame length is a usable CAN / CAN-FD length
    pub fn validate(&self) -> TransportResult<()> {
        if !(CLASSIC_FRAME_LEN..=MAX_FD_FRAME_LEN).contains(&self.max_frame_length) {
            return Err(TransportError::InvalidConfig(format!(
                "max frame length {} is outside {CLASSIC_FRAME_LEN}..={MAX_FD_FRAME_LEN}",
                self.max_frame_length
            )));
        }
        Ok(())
    }

    fn is_fd(&self) -> bool {
        self.max_frame_length > CLASSIC_FRAME_LEN
    }

    /// Most payload bytes a single frame can carry
    pub fn max_single_frame_payload(&self) -> usize {
        if self.is_fd() {
            self.max_frame_length - 2
        } else {
            self.max_frame_length - 1
        }
    }

    /// Payload bytes carried by the first frame of a message of `total_len` bytes
    pub fn first_frame_payload_len(&self, total_len: usize) -> usize {
        if total_len > MAX_12BIT_MESSAGE_LEN {
            self.max_frame_length - 6
        } else {
            self.max_frame_length - 2
        }
    }

    /// Payload bytes carried by a full consecutive frame
    pub fn consecutive_frame_payload_len(&self) -> usize {
        self.max_frame_length - 1
    }

    /// Number of consecutive frames following the first frame of a `total_len` byte message
    pub fn consecutive_frame_count(&self, total_len: usize) -> usize {
        total_len
            .saturating_sub(self.first_frame_payload_len(total_len))
            .div_ceil(self.consecutive_frame_payload_len())
    }

    fn pad(&self, buf: &mut Vec<u8>) {
        if let Some(pad) = self.padding() {
            buf.resize(self.max_frame_length, pad);
        }
    }
}

/// Decoded protocol control information of one frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pci<'a> {
    /// Single frame, `data` is exactly the payload
    Single {
        /// Payload
        data: &'a [u8],
    },
    /// First frame
    First {
        /// Declared message length
        total_len: usize,
        /// Payload bytes following the PCI
        data: &'a [u8],
    },
    /// Consecutive frame
    Consecutive {
        /// Sequence counter (0x0-0xF)
        sequence: u8,
        /// Bytes following the PCI, including any padding
        data: &'a [u8],
    },
    /// Flow control frame
    FlowControl(FlowControlFrame),
}

impl Pci<'_> {
    /// Frame type of this PCI
    pub fn frame_type(&self) -> FrameType {
        match self {
            Pci::Single { .. } => FrameType::Single,
            Pci::First { .. } => FrameType::First,
            Pci::Consecutive { .. } => FrameType::Consecutive,
            Pci::FlowControl(_) => FrameType::FlowControl,
        }
    }
}

/// Encodes a payload that fits a single frame
pub fn encode_single_frame(payload: &[u8], settings: &FrameSettings) -> TransportResult<Vec<u8>> {
    if payload.is_empty() {
        return Err(TransportError::EmptyPayload);
    }
    let max = settings.max_single_frame_payload();
    if payload.len() > max {
        return Err(TransportError::PayloadTooLarge {
            len: payload.len(),
            max,
        });
    }
    let mut buf = Vec::with_capacity(settings.max_frame_length);
    if payload.len() < CLASSIC_FRAME_LEN {
        buf.push(FrameType::Single as u8 | payload.len() as u8);
    } else {
        // CAN-FD escape
        buf.extend_from_slice(&[FrameType::Single as u8, payload.len() as u8]);
    }
    buf.extend_from_slice(payload);
    settings.pad(&mut buf);
    Ok(buf)
}

/// Encodes a payload into a first frame followed by its consecutive frames
pub fn encode_multi_frame(
    payload: &[u8],
    settings: &FrameSettings,
) -> TransportResult<Vec<Vec<u8>>> {
    let len = payload.len();
    let min = settings.max_frame_length - 1;
    if len < min {
        return Err(TransportError::MalformedFrame(
            "payload is too short for a multi-frame message",
        ));
    }
    if len > u32::MAX as usize {
        return Err(TransportError::PayloadTooLarge {
            len,
            max: u32::MAX as usize,
        });
    }

    let ff_len = settings.first_frame_payload_len(len);
    let mut frames = Vec::with_capacity(1 + settings.consecutive_frame_count(len));

    let mut ff = Vec::with_capacity(settings.max_frame_length);
    if len > MAX_12BIT_MESSAGE_LEN {
        ff.extend_from_slice(&[(FrameType::First as u8) << 4, 0x00]);
        ff.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        ff.push((FrameType::First as u8) << 4 | ((len >> 8) & 0x0F) as u8);
        ff.push((len & 0xFF) as u8);
    }
    ff.extend_from_slice(&payload[..ff_len]);
    frames.push(ff);

    for (idx, chunk) in payload[ff_len..]
        .chunks(settings.consecutive_frame_payload_len())
        .enumerate()
    {
        let mut cf = Vec::with_capacity(settings.max_frame_length);
        cf.push((FrameType::Consecutive as u8) << 4 | ((idx + 1) & 0x0F) as u8);
        cf.extend_from_slice(chunk);
        settings.pad(&mut cf);
        frames.push(cf);
    }
    Ok(frames)
}

/// Encodes a payload into as many frames as it needs
pub fn encode(payload: &[u8], settings: &FrameSettings) -> TransportResult<Vec<Vec<u8>>> {
    if payload.len() <= settings.max_single_frame_payload() {
        Ok(vec![encode_single_frame(payload, settings)?])
    } else {
        encode_multi_frame(payload, settings)
    }
}

/// Decodes the PCI of a raw frame
pub fn decode_pci(frame: &[u8]) -> TransportResult<Pci<'_>> {
    let pci = *frame
        .first()
        .ok_or(TransportError::MalformedFrame("empty frame"))?;
    let frame_type = FrameType::from_repr(pci >> 4)
        .ok_or(TransportError::MalformedFrame("reserved PCI type"))?;
    match frame_type {
        FrameType::Single => {
            let (len, offset) = match pci & 0x0F {
                0 => {
                    if frame.len() <= CLASSIC_FRAME_LEN {
                        return Err(TransportError::MalformedFrame(
                            "single frame length escape on a classic CAN frame",
                        ));
                    }
                    (frame[1] as usize, 2)
                }
                len => (len as usize, 1),
            };
            if len == 0 || offset + len > frame.len() {
                return Err(TransportError::MalformedFrame("invalid single frame length"));
            }
            Ok(Pci::Single {
                data: &frame[offset..offset + len],
            })
        }
        FrameType::First => {
            if frame.len() < 2 {
                return Err(TransportError::MalformedFrame("first frame too short"));
            }
            let len = (((pci & 0x0F) as usize) << 8) | frame[1] as usize;
            if len != 0 {
                return Ok(Pci::First {
                    total_len: len,
                    data: &frame[2..],
                });
            }
            if frame.len() < 6 {
                return Err(TransportError::MalformedFrame(
                    "first frame length escape too short",
                ));
            }
            let len = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
            if len == 0 {
                return Err(TransportError::MalformedFrame("first frame declares 0 bytes"));
            }
            Ok(Pci::First {
                total_len: len,
                data: &frame[6..],
            })
        }
        FrameType::Consecutive => Ok(Pci::Consecutive {
            sequence: pci & 0x0F,
            data: &frame[1..],
        }),
        FrameType::FlowControl => FlowControlFrame::interpret(frame).map(Pci::FlowControl),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_control::FlowStatus;

    fn fd(len: usize) -> FrameSettings {
        FrameSettings {
            max_frame_length: len,
            ..Default::default()
        }
    }

    fn reassemble(frames: &[Vec<u8>]) -> Vec<u8> {
        match decode_pci(&frames[0]).unwrap() {
            Pci::Single { data } => data.to_vec(),
            Pci::First { total_len, data } => {
                let mut out = data.to_vec();
                for cf in &frames[1..] {
                    if let Pci::Consecutive { data, .. } = decode_pci(cf).unwrap() {
                        let take = (total_len - out.len()).min(data.len());
                        out.extend_from_slice(&data[..take]);
                    }
                }
                out
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn read_data_by_identifier_single_frame() {
        let frames = encode(&[0x22, 0xED, 0xA0], &FrameSettings::default()).unwrap();
        assert_eq!(
            frames,
            vec![vec![0x03, 0x22, 0xED, 0xA0, 0x00, 0x00, 0x00, 0x00]]
        );
    }

    #[test]
    fn twenty_bytes_need_two_consecutive_frames() {
        let payload = (1..=20).collect::<Vec<u8>>();
        let frames = encode(&payload, &FrameSettings::default()).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], vec![0x10, 0x14, 1, 2, 3, 4, 5, 6]);
        assert_eq!(frames[1], vec![0x21, 7, 8, 9, 10, 11, 12, 13]);
        assert_eq!(frames[2], vec![0x22, 14, 15, 16, 17, 18, 19, 20]);

        let frames = encode(&payload[..18], &FrameSettings::default()).unwrap();
        assert_eq!(frames[2], vec![0x22, 14, 15, 16, 17, 18, 0x00, 0x00]);
    }

    #[test]
    fn single_frame_boundary() {
        let settings = FrameSettings::default();
        assert_eq!(encode(&[0xAB; 7], &settings).unwrap().len(), 1);
        let frames = encode(&[0xAB; 8], &settings).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0] >> 4, FrameType::First as u8);
        assert!(matches!(
            encode_single_frame(&[0xAB; 8], &settings),
            Err(TransportError::PayloadTooLarge { len: 8, max: 7 })
        ));
        assert_eq!(encode_single_frame(&[], &settings), Err(TransportError::EmptyPayload));
    }

    #[test]
    fn sequence_counter_wraps() {
        // 6 bytes in the FF + 17 CFs of 7 bytes
        let payload = vec![0x55; 6 + 17 * 7];
        let frames = encode(&payload, &FrameSettings::default()).unwrap();
        let seq = frames[1..].iter().map(|f| f[0]).collect::<Vec<u8>>();
        let mut expected = (0x21..=0x2F).collect::<Vec<u8>>();
        expected.extend_from_slice(&[0x20, 0x21]);
        assert_eq!(seq, expected);
    }

    #[test]
    fn padding_policy() {
        let payload = (0..30).collect::<Vec<u8>>();
        let padded = FrameSettings {
            padding_byte: 0xAA,
            ..Default::default()
        };
        let frames = encode(&payload, &padded).unwrap();
        assert!(frames.iter().all(|f| f.len() == 8));
        assert_eq!(frames.last().unwrap()[..4], [0x24, 27, 28, 29]);
        assert_eq!(frames.last().unwrap()[4..], [0xAA; 4]);

        let unpadded = FrameSettings {
            padding_enabled: false,
            ..Default::default()
        };
        let frames = encode(&payload, &unpadded).unwrap();
        assert_eq!(frames.last().unwrap(), &vec![0x24, 27, 28, 29]);
        assert_eq!(encode(&[0x3E, 0x00], &unpadded).unwrap()[0], vec![0x02, 0x3E, 0x00]);
    }

    #[test]
    fn round_trip_classic() {
        let settings = FrameSettings::default();
        for len in [1, 7, 8, 62, 63, 4095] {
            let payload = (0..len).map(|x| (x * 7) as u8).collect::<Vec<u8>>();
            assert_eq!(reassemble(&encode(&payload, &settings).unwrap()), payload);
        }
    }

    #[test]
    fn round_trip_extended_length() {
        for settings in [FrameSettings::default(), fd(64)] {
            let payload = (0..5000).map(|x| (x % 251) as u8).collect::<Vec<u8>>();
            let frames = encode(&payload, &settings).unwrap();
            assert_eq!(&frames[0][..6], &[0x10, 0x00, 0x00, 0x00, 0x13, 0x88]);
            assert_eq!(reassemble(&frames), payload);
        }
    }

    #[test]
    fn fd_single_frame_escape() {
        let settings = fd(64);
        let payload = (0..40).collect::<Vec<u8>>();
        let frames = encode(&payload, &settings).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..2], &[0x00, 40]);
        assert_eq!(frames[0].len(), 64);
        assert_eq!(decode_pci(&frames[0]).unwrap(), Pci::Single { data: &payload });
        assert_eq!(encode(&[0u8; 63], &settings).unwrap().len(), 2);
    }

    #[test]
    fn decode_rejects_malformed() {
        assert!(matches!(decode_pci(&[]), Err(TransportError::MalformedFrame(_))));
        assert!(matches!(decode_pci(&[0x40, 0x00]), Err(TransportError::MalformedFrame(_))));
        assert!(matches!(decode_pci(&[0xF0]), Err(TransportError::MalformedFrame(_))));
        assert!(matches!(decode_pci(&[0x05, 0x01]), Err(TransportError::MalformedFrame(_))));
        assert!(matches!(
            decode_pci(&[0x00, 0x03, 0x01, 0x02, 0x03, 0, 0, 0]),
            Err(TransportError::MalformedFrame(_))
        ));
        assert!(matches!(decode_pci(&[0x10]), Err(TransportError::MalformedFrame(_))));
    }

    #[test]
    fn decode_each_frame_type() {
        assert_eq!(
            decode_pci(&[0x10, 0x14, 1, 2, 3, 4, 5, 6]).unwrap(),
            Pci::First {
                total_len: 20,
                data: &[1, 2, 3, 4, 5, 6]
            }
        );
        let cf = decode_pci(&[0x2F, 9, 9]).unwrap();
        assert_eq!(cf.frame_type(), FrameType::Consecutive);
        assert_eq!(
            cf,
            Pci::Consecutive {
                sequence: 0xF,
                data: &[9, 9]
            }
        );
        // Decoded PCIs are cheap views and can be passed around by value
        let held = cf;
        assert_eq!(held.frame_type(), cf.frame_type());
        match decode_pci(&[0x32, 0x00, 0x00, 0, 0, 0, 0, 0]).unwrap() {
            Pci::FlowControl(fc) => assert_eq!(fc.flag, FlowStatus::Overflow),
            other => panic!("unexpected {other:?}"),
        }
    }
}
