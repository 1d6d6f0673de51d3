/// MySQL client/server wire protocol
///
/// Framing, the growable I/O buffer, the handful of packets the proxy has to
/// understand, and native-password scrambling. Everything else that crosses
/// the proxy is relayed as opaque bytes.
pub mod auth;
pub mod buffer;
pub mod packet;

pub use auth::{generate_challenge, scramble, verify, CHALLENGE_LEN};
pub use buffer::{Buffer, Progress, TryIo, HEADER_SIZE, PREALLOC_SIZE};
pub use packet::{
    AuthResult, CommandPacket, ErrorPacket, Greeting, Login, MAX_ARG_LEN, MAX_PAYLOAD_LEN,
};

/// MySQL capability flags
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
    pub const CLIENT_SSL_VERIFY_SERVER_CERT: u32 = 1 << 30;

    /// Flags the proxy never negotiates with a backend.
    pub const BACKEND_UMASK: u32 = CLIENT_FOUND_ROWS
        | CLIENT_NO_SCHEMA
        | CLIENT_ODBC
        | CLIENT_COMPRESS
        | CLIENT_SSL_VERIFY_SERVER_CERT
        | CLIENT_LOCAL_FILES
        | CLIENT_IGNORE_SPACE
        | CLIENT_IGNORE_SIGPIPE
        | CLIENT_RESERVED
        | CLIENT_CONNECT_WITH_DB;

    /// Flags that would change packet layouts the proxy does not speak.
    /// Stripped on both sides so clients and backends agree on result framing.
    pub const PROTOCOL_UMASK: u32 = CLIENT_SSL
        | CLIENT_PLUGIN_AUTH
        | CLIENT_CONNECT_ATTRS
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_SESSION_TRACK
        | CLIENT_DEPRECATE_EOF;

    /// Capabilities advertised when no backend greeting has been seen yet.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS;

    /// Capabilities the proxy offers clients given a backend's greeting.
    pub fn for_client(backend: u32) -> u32 {
        (backend & !PROTOCOL_UMASK) | CLIENT_CONNECT_WITH_DB
    }

    /// Capabilities the proxy requests when logging into a backend.
    pub fn for_backend(backend: u32) -> u32 {
        backend & !BACKEND_UMASK & !PROTOCOL_UMASK
    }
}

/// utf8_general_ci
pub const DEFAULT_CHARSET: u8 = 33;

/// Status flag reported in the proxy's OK packets
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

/// MySQL command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Unknown = 0xff,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            _ => Command::Unknown,
        }
    }
}

/// Write the 4-byte packet header for a payload of `len` bytes.
pub fn write_header(dst: &mut [u8], len: usize, seq: u8) {
    dst[0] = (len & 0xff) as u8;
    dst[1] = ((len >> 8) & 0xff) as u8;
    dst[2] = ((len >> 16) & 0xff) as u8;
    dst[3] = seq;
}

/// Decode a packet header into (payload length, sequence number).
pub fn read_header(src: &[u8]) -> (usize, u8) {
    let len = src[0] as usize | (src[1] as usize) << 8 | (src[2] as usize) << 16;
    (len, src[3])
}
