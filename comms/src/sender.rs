use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    Serialize,
    frame::{self, PREFIX_LEN},
};

/// Write half of a peer link. Keeps a scratch buffer around so steady traffic does not
/// allocate per frame.
pub struct OnoSender<W: AsyncWrite + Unpin> {
    tx: W,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    pub(crate) fn new(tx: W) -> Self {
        Self {
            tx,
            scratch: Vec::new(),
        }
    }

    /// Writes `msg` as one frame and flushes it.
    ///
    /// The borrowed tail returned by `Serialize` goes straight to the writer after the
    /// header, so tensor payloads are never copied into the scratch buffer.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.scratch.clear();
        self.scratch.extend_from_slice(&[0; PREFIX_LEN]);

        let tail = msg.serialize(&mut self.scratch)?;
        let body_len = self.scratch.len() - PREFIX_LEN + tail.map_or(0, <[u8]>::len);
        if body_len > frame::MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to send a frame of {body_len} bytes"),
            ));
        }
        self.scratch[..PREFIX_LEN].copy_from_slice(&frame::encode_prefix(body_len));

        self.tx.write_all(&self.scratch).await?;
        if let Some(tail) = tail {
            self.tx.write_all(tail).await?;
        }
        self.tx.flush().await
    }
}
