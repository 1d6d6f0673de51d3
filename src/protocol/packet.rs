/// Encoders and decoders for the packets the proxy has to understand
///
/// Payloads only: framing lives in `Buffer`. All integers are fixed-width
/// little-endian.
use super::auth::CHALLENGE_LEN;
use super::capabilities;
use super::{Command, DEFAULT_CHARSET, SERVER_STATUS_AUTOCOMMIT};
use crate::error::ProtocolError;
use bytes::BufMut;

/// Largest payload a single packet can carry
pub const MAX_PAYLOAD_LEN: usize = 0xff_ff_ff;
/// Longest command argument a session keeps for routing and auditing
pub const MAX_ARG_LEN: usize = 1024;

const CHALLENGE_HEAD: usize = 8;
const LOGIN_FILLER: usize = 23;
const GREETING_RESERVED: usize = 10;

/// Bounds-checked reader over a packet payload
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated { field });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self, field: &'static str) -> Result<&'a [u8], ProtocolError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::Unterminated { field })?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// NUL-terminated string that may also simply run to the end
    fn trailing_str(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        self.pos = (self.pos + end + 1).min(self.buf.len());
        &rest[..end]
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Initial handshake sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub challenge: [u8; CHALLENGE_LEN],
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
}

impl Greeting {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.server_version.len());
        buf.put_u8(self.protocol_version);
        buf.put_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);
        buf.put_slice(&self.challenge[..CHALLENGE_HEAD]);
        buf.put_u8(0);
        buf.put_u16_le((self.capabilities & 0xffff) as u16);
        buf.put_u8(self.charset);
        buf.put_u16_le(self.status);
        buf.put_u16_le((self.capabilities >> 16) as u16);
        buf.put_u8(CHALLENGE_LEN as u8 + 1);
        buf.put_bytes(0, GREETING_RESERVED);
        buf.put_slice(&self.challenge[CHALLENGE_HEAD..]);
        buf.put_u8(0);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let protocol_version = r.u8("protocol version")?;
        let server_version = lossy(r.cstr("server version")?);
        let connection_id = r.u32("connection id")?;

        let mut challenge = [0u8; CHALLENGE_LEN];
        challenge[..CHALLENGE_HEAD].copy_from_slice(r.take(CHALLENGE_HEAD, "challenge")?);
        r.u8("filler")?;

        let cap_low = r.u16("capabilities")? as u32;
        let charset = r.u8("charset")?;
        let status = r.u16("status")?;
        let cap_high = r.u16("capabilities")? as u32;
        r.u8("scramble length")?;
        r.take(GREETING_RESERVED, "reserved")?;
        challenge[CHALLENGE_HEAD..].copy_from_slice(r.take(CHALLENGE_LEN - CHALLENGE_HEAD, "challenge")?);

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            challenge,
            capabilities: cap_high << 16 | cap_low,
            charset,
            status,
        })
    }
}

/// Handshake response sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub capabilities: u32,
    pub max_packet: u32,
    pub charset: u8,
    pub user: String,
    pub scramble: Vec<u8>,
    pub database: String,
}

impl Login {
    /// Login the proxy sends to a backend; the database is always deferred
    pub fn for_backend(greeting: &Greeting, user: &str, scramble: Vec<u8>) -> Self {
        Self {
            capabilities: capabilities::for_backend(greeting.capabilities),
            max_packet: 16 * 1024 * 1024,
            charset: DEFAULT_CHARSET,
            user: user.to_string(),
            scramble,
            database: String::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.user.len() + self.database.len());
        buf.put_u32_le(self.capabilities);
        buf.put_u32_le(self.max_packet);
        buf.put_u8(self.charset);
        buf.put_bytes(0, LOGIN_FILLER);
        buf.put_slice(self.user.as_bytes());
        buf.put_u8(0);
        buf.put_u8(self.scramble.len() as u8);
        buf.put_slice(&self.scramble);
        if !self.database.is_empty() {
            buf.put_slice(self.database.as_bytes());
            buf.put_u8(0);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let capabilities = r.u32("capabilities")?;
        let max_packet = r.u32("max packet")?;
        let charset = r.u8("charset")?;
        r.take(LOGIN_FILLER, "filler")?;
        let user = lossy(r.cstr("user")?);
        let len = r.u8("scramble length")? as usize;
        let scramble = r.take(len, "scramble")?.to_vec();
        let database = if r.remaining() > 0 {
            lossy(r.trailing_str())
        } else {
            String::new()
        };

        Ok(Self {
            capabilities,
            max_packet,
            charset,
            user,
            scramble,
            database,
        })
    }
}

/// Error result packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: u16,
    pub marker: u8,
    pub sql_state: [u8; 5],
    pub message: String,
}

impl ErrorPacket {
    pub const HEADER: u8 = 0xff;

    pub fn new(code: u16, sql_state: &str, message: &str) -> Self {
        let mut state = [b'0'; 5];
        for (dst, src) in state.iter_mut().zip(sql_state.bytes()) {
            *dst = src;
        }
        Self {
            code,
            marker: b'#',
            sql_state: state,
            message: message.to_string(),
        }
    }

    /// Rejection sent to clients presenting the wrong credential
    pub fn access_denied() -> Self {
        Self::new(1045, "28000", "Access denied")
    }

    /// Rejection for commands the proxy does not relay
    pub fn unsupported(opcode: u8) -> Self {
        Self::new(
            1047,
            "08S01",
            &format!("Unsupported command [{}]", opcode),
        )
    }

    pub fn sql_state(&self) -> String {
        lossy(&self.sql_state)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.message.len());
        buf.put_u8(Self::HEADER);
        buf.put_u16_le(self.code);
        buf.put_u8(self.marker);
        buf.put_slice(&self.sql_state);
        buf.put_slice(self.message.as_bytes());
        buf.put_u8(0);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let header = r.u8("error header")?;
        if header != Self::HEADER {
            return Err(ProtocolError::Unexpected(format!(
                "error packet starts with 0x{:02x}",
                header
            )));
        }
        let code = r.u16("error code")?;
        let marker = r.u8("sql state marker")?;
        let mut sql_state = [0u8; 5];
        sql_state.copy_from_slice(r.take(5, "sql state")?);
        let message = lossy(r.trailing_str());

        Ok(Self {
            code,
            marker,
            sql_state,
            message,
        })
    }
}

/// Result of an authentication or a simple command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Ok,
    Err(ErrorPacket),
}

impl AuthResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, AuthResult::Ok)
    }

    /// The proxy's OK: header, zero affected rows, zero insert id,
    /// autocommit status, zero warnings
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AuthResult::Ok => {
                let mut out = Vec::with_capacity(7);
                out.put_u8(0x00);
                out.put_u8(0);
                out.put_u8(0);
                out.put_u16_le(SERVER_STATUS_AUTOCOMMIT);
                out.put_u16_le(0);
                out
            }
            AuthResult::Err(err) => err.encode(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload.first() {
            Some(0x00) => Ok(AuthResult::Ok),
            Some(&ErrorPacket::HEADER) => Ok(AuthResult::Err(ErrorPacket::decode(payload)?)),
            Some(other) => Err(ProtocolError::Unexpected(format!(
                "result packet starts with 0x{:02x}",
                other
            ))),
            None => Err(ProtocolError::Truncated { field: "result code" }),
        }
    }
}

/// A client command: opcode plus raw argument bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket<'a> {
    pub opcode: u8,
    pub arg: &'a [u8],
}

impl<'a> CommandPacket<'a> {
    pub fn new(command: Command, arg: &'a [u8]) -> Self {
        Self {
            opcode: command as u8,
            arg,
        }
    }

    pub fn command(&self) -> Command {
        Command::from(self.opcode)
    }

    /// Argument as text, cut to `MAX_ARG_LEN` bytes
    pub fn arg_text(&self) -> String {
        let end = self.arg.len().min(MAX_ARG_LEN);
        lossy(&self.arg[..end])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.arg.len());
        buf.put_u8(self.opcode);
        buf.put_slice(self.arg);
        buf
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self, ProtocolError> {
        match payload.split_first() {
            Some((&opcode, arg)) => Ok(Self { opcode, arg }),
            None => Err(ProtocolError::Truncated { field: "command" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::*;

    fn greeting() -> Greeting {
        Greeting {
            protocol_version: 10,
            server_version: "5.7.44-log".to_string(),
            connection_id: 0x0102_0304,
            challenge: *b"abcdefghijklmnopqrst",
            capabilities: DEFAULT_CAPABILITIES | CLIENT_PLUGIN_AUTH,
            charset: DEFAULT_CHARSET,
            status: 0x0002,
        }
    }

    #[test]
    fn test_greeting_layout() {
        let bytes = greeting().encode();
        assert_eq!(bytes[0], 10);
        assert_eq!(&bytes[1..11], b"5.7.44-log");
        assert_eq!(bytes[11], 0);
        assert_eq!(&bytes[12..16], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[16..24], b"abcdefgh");
        assert_eq!(bytes[24], 0);
        // scramble length, ten reserved zero bytes, the tail of the
        // challenge and its terminator
        assert_eq!(bytes[32], 21);
        assert!(bytes[33..43].iter().all(|&b| b == 0));
        assert_eq!(&bytes[43..55], b"ijklmnopqrst");
        assert_eq!(bytes[55], 0);
        assert_eq!(bytes.len(), 56);
    }

    #[test]
    fn test_greeting_round_trip() {
        let original = greeting();
        let bytes = original.encode();
        let decoded = Greeting::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_greeting_truncated() {
        let bytes = greeting().encode();
        let err = Greeting::decode(&bytes[..30]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_login_round_trip_empty_database() {
        let login = Login {
            capabilities: DEFAULT_CAPABILITIES,
            max_packet: 16 * 1024 * 1024,
            charset: DEFAULT_CHARSET,
            user: "app".to_string(),
            scramble: vec![7; 20],
            database: String::new(),
        };
        let bytes = login.encode();
        // 32 fixed bytes, "app\0", length byte, 20 scramble bytes
        assert_eq!(bytes.len(), 32 + 4 + 1 + 20);
        let decoded = Login::decode(&bytes).unwrap();
        assert_eq!(decoded, login);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_login_round_trip_long_user_and_database() {
        let login = Login {
            capabilities: DEFAULT_CAPABILITIES,
            max_packet: 1,
            charset: 8,
            user: "u".repeat(255),
            scramble: vec![0xab; 255],
            database: "orders".to_string(),
        };
        let bytes = login.encode();
        let decoded = Login::decode(&bytes).unwrap();
        assert_eq!(decoded, login);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_login_empty_scramble() {
        let login = Login {
            capabilities: 0,
            max_packet: 0,
            charset: 0,
            user: String::new(),
            scramble: Vec::new(),
            database: String::new(),
        };
        let decoded = Login::decode(&login.encode()).unwrap();
        assert!(decoded.scramble.is_empty());
        assert!(decoded.user.is_empty());
    }

    #[test]
    fn test_login_unterminated_user() {
        let mut bytes = vec![0u8; 32];
        bytes.extend_from_slice(b"root");
        let err = Login::decode(&bytes).unwrap_err();
        assert_eq!(err, ProtocolError::Unterminated { field: "user" });
    }

    #[test]
    fn test_backend_login_masks_capabilities() {
        let g = greeting();
        let login = Login::for_backend(&g, "proxy", Vec::new());
        assert_eq!(login.capabilities & CLIENT_CONNECT_WITH_DB, 0);
        assert_eq!(login.capabilities & CLIENT_PLUGIN_AUTH, 0);
        assert_eq!(login.max_packet, 16_777_216);
        assert!(login.database.is_empty());
    }

    #[test]
    fn test_error_round_trip() {
        let err = ErrorPacket::access_denied();
        let bytes = err.encode();
        assert_eq!(bytes[0], 0xff);
        assert_eq!(&bytes[1..3], &1045u16.to_le_bytes());
        assert_eq!(bytes[3], b'#');
        assert_eq!(&bytes[4..9], b"28000");
        assert_eq!(*bytes.last().unwrap(), 0);

        let decoded = ErrorPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, err);
        assert_eq!(decoded.sql_state(), "28000");
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_error_without_terminator() {
        let mut bytes = ErrorPacket::new(1049, "42000", "Unknown database 'x'").encode();
        bytes.pop();
        let decoded = ErrorPacket::decode(&bytes).unwrap();
        assert_eq!(decoded.message, "Unknown database 'x'");
    }

    #[test]
    fn test_auth_result() {
        assert_eq!(AuthResult::Ok.encode(), vec![0, 0, 0, 2, 0, 0, 0]);
        assert!(AuthResult::decode(&[0, 0, 0, 2, 0, 0, 0]).unwrap().is_ok());

        let denied = AuthResult::Err(ErrorPacket::access_denied());
        let decoded = AuthResult::decode(&denied.encode()).unwrap();
        assert_eq!(decoded, denied);

        assert!(AuthResult::decode(&[0xfe]).is_err());
        assert!(AuthResult::decode(&[]).is_err());
    }

    #[test]
    fn test_command_round_trip() {
        let cmd = CommandPacket::new(Command::Query, b"select 1");
        let bytes = cmd.encode();
        assert_eq!(bytes, b"\x03select 1");
        let decoded = CommandPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.command(), Command::Query);
        assert_eq!(decoded.arg_text(), "select 1");
    }

    #[test]
    fn test_command_empty_argument() {
        let bytes = CommandPacket::new(Command::Ping, b"").encode();
        assert_eq!(bytes, vec![0x0e]);
        let decoded = CommandPacket::decode(&bytes).unwrap();
        assert!(decoded.arg.is_empty());
        assert_eq!(decoded.encode(), bytes);
        assert!(CommandPacket::decode(&[]).is_err());
    }

    #[test]
    fn test_command_arg_text_is_capped() {
        let arg = vec![b'a'; MAX_ARG_LEN * 2];
        let cmd = CommandPacket::new(Command::Query, &arg);
        assert_eq!(cmd.arg_text().len(), MAX_ARG_LEN);
    }
}
