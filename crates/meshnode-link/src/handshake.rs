//! The peer handshake (spec §4.2/§6.2): both sides exchange a
//! [`HandshakeFrame`] before either treats the connection as up.

use std::collections::HashSet;

use meshnode_proto::HandshakeFrame;

use crate::transport::Conn;
use crate::LinkError;

pub async fn perform(
    conn: &mut Conn,
    our_frame: &HandshakeFrame,
    allowed_public_keys: &HashSet<[u8; 32]>,
) -> Result<HandshakeFrame, LinkError> {
    let our_encoded = our_frame.encode();
    let (write_res, read_res) = tokio::join!(conn.send(&our_encoded), conn.recv());

    write_res?;
    let peer_buf = read_res?;
    let peer = HandshakeFrame::decode(&peer_buf).map_err(|e| LinkError::Protocol(e.to_string()))?;

    if !our_frame.major_compatible(peer.version_major) {
        return Err(LinkError::Protocol(format!(
            "version mismatch: local major {}, remote major {}",
            our_frame.version_major, peer.version_major
        )));
    }
    if !allowed_public_keys.is_empty() && !allowed_public_keys.contains(&peer.public_key) {
        return Err(LinkError::Protocol(
            "remote public key is not in AllowedPublicKeys".to_string(),
        ));
    }

    Ok(peer)
}
