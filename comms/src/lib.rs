//! Length-prefixed framing over any async byte stream, plus the message set peers in a
//! process group exchange.

mod codec;
mod frame;
pub mod msg;
mod receiver;
mod sender;

use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::{Align4, Deserialize, Serialize};
pub use frame::MAX_FRAME_LEN;
pub use receiver::OnoReceiver;
pub use sender::OnoSender;

/// Splits a connection into its framed read and write halves.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
