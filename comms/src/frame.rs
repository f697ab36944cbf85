use std::io;

/// Size prefix written in front of every frame, big endian.
pub(crate) type Prefix = u64;
pub(crate) const PREFIX_LEN: usize = size_of::<Prefix>();

/// The biggest frame a receiver accepts; longer ones are treated as corrupt streams.
pub const MAX_FRAME_LEN: usize = 1 << 30;

pub(crate) fn encode_prefix(body_len: usize) -> [u8; PREFIX_LEN] {
    (body_len as Prefix).to_be_bytes()
}

pub(crate) fn decode_prefix(prefix: [u8; PREFIX_LEN]) -> io::Result<usize> {
    let len = Prefix::from_be_bytes(prefix);
    match usize::try_from(len) {
        Ok(len) if len <= MAX_FRAME_LEN => Ok(len),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        )),
    }
}
