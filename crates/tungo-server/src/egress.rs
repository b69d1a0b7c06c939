//! Per-session egress: drain the plaintext queue the TUN dispatch feeds,
//! seal, and ship. Owns the session's send half outright.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tungo_core::link::LinkWriter;
use tungo_core::session::SessionSender;

pub(crate) async fn run(
    mut packets: mpsc::Receiver<Vec<u8>>,
    mut sender: SessionSender,
    mut writer: LinkWriter,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = packets.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let (nonce, ciphertext) = match sender.seal(&packet) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("sealing egress packet: {e}");
                cancel.cancel();
                break;
            }
        };
        if let Err(e) = writer.send(nonce, &ciphertext).await {
            debug!("egress write failed: {e}");
            cancel.cancel();
            break;
        }
    }
}
