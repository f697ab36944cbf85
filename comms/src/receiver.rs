use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    Align4, Deserialize,
    frame::{self, PREFIX_LEN},
};

/// Read half of a peer link.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    pub(crate) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Reads the next frame into `buf` and decodes it.
    ///
    /// `buf` is typed by an `Align4` element so the decoded value may borrow aligned tensor
    /// data out of it. Its previous contents are discarded.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut prefix = [0; PREFIX_LEN];
        self.rx.read_exact(&mut prefix).await?;
        let len = frame::decode_prefix(prefix)?;

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let body = &mut bytemuck::cast_slice_mut::<B, u8>(buf)[..len];
        self.rx.read_exact(body).await?;

        T::deserialize(body)
    }
}
