// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Keep Alive interval, in seconds, as carried in a `CONNECT` packet.
///
/// A value of `0` disables the keep alive mechanism entirely.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive(u16);

impl KeepAlive {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

/// Validate a decoded keep alive value.
///
/// Every value in `0..=65535` is a valid Keep Alive per the protocol; listener-level
/// maximum keep alive enforcement happens above the codec layer.
///
/// # Errors
///
/// Never returns an error today; kept fallible so future protocol-level limits can be
/// added without changing call sites.
pub fn validate_keep_alive(_keep_alive: KeepAlive) -> Result<(), DecodeError> {
    Ok(())
}

impl DecodePacket for KeepAlive {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for KeepAlive {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}
