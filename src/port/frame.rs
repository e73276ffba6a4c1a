use std::io::{self, ErrorKind, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};
use serde_json::Value;

use super::errors::Error;

// Frame layout
// len(u32) + payload([u8; len])
//
// the payload is the utf8 json text of one wrapped envelope

// max frame len
pub const FRAME_MAX_LEN: usize = 16 * 1024 * 1024;

/// raw frame wrapper, low level protocol
#[derive(Debug)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    /// decode a frame from the reader
    pub fn decode_from<R: Read>(r: &mut R, buf: &mut BytesMut) -> io::Result<Self> {
        let len = r.read_u32::<BigEndian>()? as usize;
        info!("decode len = {:?}", len);

        if len > FRAME_MAX_LEN {
            let s = format!("decode too big frame length. len={len}");
            error!("{s}");
            return Err(io::Error::new(ErrorKind::InvalidInput, s));
        }

        buf.clear();
        buf.resize(len, 0);
        r.read_exact(&mut buf[..])?;
        let data = buf.split().freeze();

        Ok(Frame { data })
    }

    /// encode a message into a frame that can be written as is
    pub fn encode(msg: &Value) -> Result<Vec<u8>, Error> {
        let payload = serde_json::to_vec(msg)?;
        let len = payload.len();
        if len > FRAME_MAX_LEN {
            return Err(Error::InvalidFrame(format!(
                "encode too big frame length. len={len}"
            )));
        }

        let mut buf = Vec::with_capacity(len + 4);
        buf.write_u32::<BigEndian>(len as u32)?;
        buf.extend_from_slice(&payload);
        info!("encode len = {:?}", len);
        Ok(buf)
    }

    /// parse the payload
    pub fn decode_value(&self) -> Result<Value, Error> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}
