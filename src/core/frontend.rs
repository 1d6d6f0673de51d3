/// Client-side handshake
///
/// The proxy speaks as a MySQL server towards clients: it sends a greeting
/// carrying the identity of its backends, checks the login against the one
/// configured account and answers with OK or "Access denied".
use super::connection::{read_packet, send_packet};
use crate::error::ProxyResult;
use crate::pool::ServerInfo;
use crate::protocol::{capabilities, generate_challenge, verify, AuthResult, Buffer, ErrorPacket, Greeting, Login, CHALLENGE_LEN};
use tokio::net::TcpStream;

/// The single account clients log in with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Check a client's login against the challenge it was sent
    pub fn accepts(&self, challenge: &[u8], login: &Login) -> bool {
        login.user == self.user && verify(challenge, &self.password, &login.scramble)
    }
}

/// Greeting shown to a client, mirroring the latest backend greeting
pub fn client_greeting(info: &ServerInfo, conn_id: u32, challenge: [u8; CHALLENGE_LEN]) -> Greeting {
    Greeting {
        protocol_version: info.protocol_version,
        server_version: info.server_version.clone(),
        connection_id: conn_id,
        challenge,
        capabilities: capabilities::for_client(info.capabilities),
        charset: info.charset,
        status: info.status,
    }
}

/// Send a fresh greeting (seq 0); returns the challenge it carried
pub async fn send_greeting(
    stream: &TcpStream,
    buf: &mut Buffer,
    info: &ServerInfo,
    conn_id: u32,
) -> ProxyResult<[u8; CHALLENGE_LEN]> {
    let challenge = generate_challenge();
    let greeting = client_greeting(info, conn_id, challenge);
    send_packet(stream, buf, 0, &greeting.encode()).await?;
    Ok(challenge)
}

/// Read and decode the client's login packet
pub async fn read_login(stream: &TcpStream, buf: &mut Buffer) -> ProxyResult<Login> {
    buf.reset();
    read_packet(stream, buf).await?;
    Ok(Login::decode(buf.payload())?)
}

/// OK with the given sequence number
pub async fn send_ok(stream: &TcpStream, buf: &mut Buffer, seq: u8) -> ProxyResult<()> {
    send_packet(stream, buf, seq, &AuthResult::Ok.encode()).await
}

pub async fn send_error(stream: &TcpStream, buf: &mut Buffer, seq: u8, err: &ErrorPacket) -> ProxyResult<()> {
    send_packet(stream, buf, seq, &err.encode()).await
}
