//! Address exchange: mutual authentication of a freshly opened connection.
//!
//! The dialing side sends an [`AuthResponseMsg`] signed by all its accounts
//! and waits for the acceptor's signed answer. Each signature covers the
//! canonical encoding of the signer's whole [`AddressMap`]. Any failure
//! closes the connection.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::address::{AccountMap, AddressMap};
use crate::conn::Conn;
use crate::envelope::{AuthResponseMsg, Envelope, Msg, MsgType};
use crate::error::AuthenticationError;
use crate::{Error, Result};

/// Authenticate `conn` as the dialing side, expecting to talk to `peer`.
///
/// # Panics
///
/// If `peer` is our own identity.
pub async fn exchange_addrs_active(
    id: &AccountMap,
    peer: &AddressMap,
    conn: &dyn Conn,
    timeout: Duration,
) -> Result<()> {
    let own = id.address_map();
    assert!(own != *peer, "tried to dial self ({own})");

    guarded(conn, timeout, async {
        let auth = AuthResponseMsg::new(id)?;
        conn.send(Envelope::new(own.clone(), peer.clone(), Msg::AuthResponse(auth)))
            .await
            .map_err(|e| e.context("sending AuthResponse"))?;

        let env = conn
            .recv()
            .await
            .map_err(|e| e.context("receiving AuthResponse"))?;
        let reply = expect_auth(&env)?;

        if let Err(reason) = verify_signatures(peer, reply) {
            return Err(AuthenticationError::new(env.sender(), env.recipient(), &own, reason).into());
        }
        if env.recipient() != &own || env.sender() != peer {
            return Err(AuthenticationError::new(
                env.sender(),
                env.recipient(),
                &own,
                "unmatched response sender or recipient",
            )
            .into());
        }
        debug!(%peer, "authenticated outbound connection");
        Ok(())
    })
    .await
}

/// Authenticate `conn` as the accepting side, returning the peer's identity.
pub async fn exchange_addrs_passive(
    id: &AccountMap,
    conn: &dyn Conn,
    timeout: Duration,
) -> Result<AddressMap> {
    let own = id.address_map();

    guarded(conn, timeout, async {
        let env = conn
            .recv()
            .await
            .map_err(|e| e.context("receiving AuthResponse"))?;
        let claim = expect_auth(&env)?;

        if let Err(reason) = verify_signatures(env.sender(), claim) {
            return Err(AuthenticationError::new(env.sender(), env.recipient(), &own, reason).into());
        }
        if env.recipient() != &own {
            return Err(AuthenticationError::new(
                env.sender(),
                env.recipient(),
                &own,
                "unmatched recipient",
            )
            .into());
        }

        let peer = env.sender().clone();
        let auth = AuthResponseMsg::new(id)?;
        conn.send(Envelope::new(own.clone(), peer.clone(), Msg::AuthResponse(auth)))
            .await
            .map_err(|e| e.context("sending AuthResponse"))?;
        debug!(%peer, "authenticated inbound connection");
        Ok(peer)
    })
    .await
}

/// Run `exchange` under `timeout`, closing `conn` on any failure.
async fn guarded<T>(
    conn: &dyn Conn,
    timeout: Duration,
    exchange: impl Future<Output = Result<T>>,
) -> Result<T> {
    let res = match tokio::time::timeout(timeout, exchange).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout {
            op: "address exchange",
        }),
    };
    if res.is_err() {
        let _ = conn.close();
    }
    res
}

fn expect_auth(env: &Envelope) -> Result<&AuthResponseMsg> {
    match env.msg() {
        Msg::AuthResponse(auth) => Ok(auth),
        other => Err(Error::UnexpectedMsg {
            expected: MsgType::AuthResponse,
            got: other.kind(),
        }),
    }
}

/// Check that `auth` carries exactly one valid signature per entry of `addrs`.
fn verify_signatures(addrs: &AddressMap, auth: &AuthResponseMsg) -> std::result::Result<(), String> {
    if addrs.is_empty() {
        return Err("empty identity".into());
    }
    if auth.signatures.len() != addrs.len() {
        return Err(format!(
            "{} signatures for {} addresses",
            auth.signatures.len(),
            addrs.len()
        ));
    }
    let payload = addrs.encode();
    for (backend, addr) in addrs.iter() {
        let sig = auth
            .signatures
            .get(&backend)
            .ok_or_else(|| format!("missing signature for backend {backend}"))?;
        addr.verify(&payload, sig)
            .map_err(|e| format!("backend {backend}: {e}"))?;
    }
    Ok(())
}
