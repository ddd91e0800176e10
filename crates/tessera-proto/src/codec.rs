//! Bounds-checked reader over untrusted input.

use bytes::Buf;
use tessera_crypto::CurveId;

use crate::errors::{ProtocolError, Result};

/// Cursor that never reads past the end of its input.
pub(crate) struct Reader<'a> {
    input: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { input: bytes, total: bytes.len() }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.input.remaining()
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.input.len() {
            return Err(self.too_short(len));
        }
        let (head, rest) = self.input.split_at(len);
        self.input = rest;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.input.try_get_u8().map_err(|err| self.too_short(err.requested))
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        self.input.try_get_u16().map_err(|err| self.too_short(err.requested))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.input.try_get_u32().map_err(|err| self.too_short(err.requested))
    }

    pub(crate) fn vec(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Length-prefixed (u16) UTF-8 device id.
    pub(crate) fn device_id(&mut self) -> Result<String> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        if bytes.is_empty() {
            return Err(ProtocolError::InvalidDeviceId);
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidDeviceId)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.input)
    }

    pub(crate) fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(ProtocolError::TrailingBytes(extra)),
        }
    }

    /// `requested` more bytes were needed at the current position.
    fn too_short(&self, requested: usize) -> ProtocolError {
        let offset = self.total - self.input.len();
        ProtocolError::TooShort { expected: offset.saturating_add(requested), actual: self.total }
    }
}

/// Parse a wire curve id.
pub(crate) fn curve_from_wire(id: u8) -> Result<CurveId> {
    CurveId::from_wire_id(id).ok_or(ProtocolError::UnsupportedCurve(id))
}

/// Convert a collection length into a 16-bit wire count.
pub(crate) fn count_u16(count: usize) -> Result<u16> {
    u16::try_from(count)
        .map_err(|_| ProtocolError::TooManyEntries { count, max: usize::from(u16::MAX) })
}
