/// Backend-side protocol exchanges
///
/// Logging in (greeting, login, auth result), keepalive pings and the
/// INIT_DB sent before a command whose session database differs from the
/// backend's.
use super::connection::{connect, exchange, read_packet};
use crate::error::{ProxyError, ProxyResult};
use crate::pool::{ConnectTarget, ServerInfo};
use crate::protocol::{scramble, AuthResult, Buffer, Command, CommandPacket, ErrorPacket, Greeting, Login};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Open and authenticate one backend connection within `limit`
pub async fn handshake(target: &ConnectTarget, limit: Duration) -> ProxyResult<(TcpStream, ServerInfo)> {
    match timeout(limit, login(target, limit)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::timeout(format!("handshake with {}", target.addr))),
    }
}

async fn login(target: &ConnectTarget, limit: Duration) -> ProxyResult<(TcpStream, ServerInfo)> {
    let stream = connect(&target.addr, limit).await?;
    let mut buf = Buffer::new();

    read_packet(&stream, &mut buf).await?;
    if buf.payload().first() == Some(&ErrorPacket::HEADER) {
        let err = ErrorPacket::decode(buf.payload())?;
        return Err(ProxyError::backend(format!(
            "{} refused connection: {} {}",
            target.addr, err.code, err.message
        )));
    }
    let greeting = Greeting::decode(buf.payload())?;

    let token = scramble(&greeting.challenge, &target.password);
    let login = Login::for_backend(&greeting, &target.user, token);
    exchange(&stream, &mut buf, 1, &login.encode()).await?;

    match AuthResult::decode(buf.payload())? {
        AuthResult::Ok => {
            debug!(
                "logged into {} as {} ({})",
                target.addr, target.user, greeting.server_version
            );
            Ok((stream, ServerInfo::from(&greeting)))
        }
        AuthResult::Err(err) => Err(ProxyError::auth(format!(
            "{} rejected {}: {} {}",
            target.addr, target.user, err.code, err.message
        ))),
    }
}

/// COM_PING on an idle connection
pub async fn ping(stream: &TcpStream, buf: &mut Buffer) -> ProxyResult<()> {
    let packet = CommandPacket::new(Command::Ping, &[]);
    exchange(stream, buf, 0, &packet.encode()).await?;
    match AuthResult::decode(buf.payload())? {
        AuthResult::Ok => Ok(()),
        AuthResult::Err(err) => Err(ProxyError::backend(format!("ping: {} {}", err.code, err.message))),
    }
}

/// Select `database` on the backend. A server-side refusal is returned as
/// the error packet so it can be relayed to the client.
pub async fn init_db(stream: &TcpStream, buf: &mut Buffer, database: &str) -> ProxyResult<AuthResult> {
    let packet = CommandPacket::new(Command::InitDb, database.as_bytes());
    exchange(stream, buf, 0, &packet.encode()).await?;
    Ok(AuthResult::decode(buf.payload())?)
}
