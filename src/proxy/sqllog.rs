/// Audit log of client commands
///
/// Sessions hand finished records to a background writer thread through a
/// bounded channel, so the relay path never blocks on disk. One line per
/// command:
///
/// `2024-05-01 12:00:00 conn:7 10.0.0.5:51234 db1:3306 3ms - select 1`
use crate::protocol::{Command, CommandPacket};
use chrono::{DateTime, Local};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, LineWriter, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANNEL_BUFFER_SIZE: usize = 4096;

/// One completed client command
#[derive(Debug, Clone)]
pub struct SqlRecord {
    pub at: DateTime<Local>,
    pub conn_id: u32,
    pub client: SocketAddr,
    /// `host:port` of the backend that served the command, if any
    pub backend: Option<String>,
    pub elapsed: Duration,
    pub text: String,
}

impl fmt::Display for SqlRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} conn:{} {}:{} {} {}ms - {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.conn_id,
            self.client.ip(),
            self.client.port(),
            self.backend.as_deref().unwrap_or("-:0"),
            self.elapsed.as_millis(),
            self.text
        )
    }
}

/// Audit text for a command
pub fn describe(cmd: &CommandPacket<'_>) -> String {
    match cmd.command() {
        Command::Quit => "quit".to_string(),
        Command::Shutdown => "shutdown".to_string(),
        Command::Refresh => "refresh".to_string(),
        Command::ProcessKill => "kill".to_string(),
        Command::Debug => "debug".to_string(),
        Command::InitDb => format!("use {}", cmd.arg_text()),
        Command::BinlogDump | Command::TableDump | Command::RegisterSlave | Command::ChangeUser => {
            format!("unsupported command[{}]", cmd.opcode)
        }
        Command::CreateDb => format!("create database {}", cmd.arg_text()),
        Command::DropDb => format!("drop database {}", cmd.arg_text()),
        Command::Query => cmd.arg_text(),
        _ => format!("unknown command[{}]", cmd.opcode),
    }
}

/// Caller side of the audit log; cheap to clone
#[derive(Debug, Clone)]
pub struct SqlLogSender {
    tx: Option<mpsc::Sender<SqlRecord>>,
}

impl SqlLogSender {
    /// A sender that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue a record without blocking. Records are dropped when the
    /// writer falls behind.
    pub fn record(&self, record: SqlRecord) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(record).is_ok(),
            None => false,
        }
    }
}

/// Open `path` for appending and start the writer thread. The thread exits
/// once every sender is dropped.
pub fn start<P: AsRef<Path>>(path: P) -> io::Result<(SqlLogSender, thread::JoinHandle<()>)> {
    let file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
    let mut writer = LineWriter::new(file);
    let (tx, mut rx) = mpsc::channel::<SqlRecord>(CHANNEL_BUFFER_SIZE);
    debug!("sql log opened: {}", path.as_ref().display());

    let handle = thread::Builder::new().name("sqllog".to_string()).spawn(move || {
        let mut failed = false;
        while let Some(record) = rx.blocking_recv() {
            if let Err(e) = writeln!(writer, "{}", record) {
                if !failed {
                    warn!("Failed to write sql log: {}", e);
                    failed = true;
                }
            }
        }
        let _ = writer.flush();
    })?;

    Ok((SqlLogSender { tx: Some(tx) }, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(text: &str, backend: Option<&str>) -> SqlRecord {
        SqlRecord {
            at: Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            conn_id: 7,
            client: "10.0.0.5:51234".parse().unwrap(),
            backend: backend.map(str::to_string),
            elapsed: Duration::from_millis(3),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_line_format() {
        assert_eq!(
            record("select 1", Some("db1:3306")).to_string(),
            "2024-05-01 12:00:00 conn:7 10.0.0.5:51234 db1:3306 3ms - select 1"
        );
        assert_eq!(
            record("quit", None).to_string(),
            "2024-05-01 12:00:00 conn:7 10.0.0.5:51234 -:0 3ms - quit"
        );
    }

    #[test]
    fn test_describe() {
        let text = |cmd: Command, arg: &[u8]| describe(&CommandPacket::new(cmd, arg));
        assert_eq!(text(Command::Quit, b""), "quit");
        assert_eq!(text(Command::ProcessKill, &[1, 0, 0, 0]), "kill");
        assert_eq!(text(Command::InitDb, b"shop"), "use shop");
        assert_eq!(text(Command::CreateDb, b"shop"), "create database shop");
        assert_eq!(text(Command::DropDb, b"shop"), "drop database shop");
        assert_eq!(text(Command::Query, b"SELECT 1"), "SELECT 1");
        assert_eq!(text(Command::ChangeUser, b""), "unsupported command[17]");
        assert_eq!(text(Command::Ping, b""), "unknown command[14]");

        let long = vec![b'x'; 5000];
        assert_eq!(text(Command::Query, &long).len(), crate::protocol::MAX_ARG_LEN);
    }

    #[test]
    fn test_writer_appends_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "earlier\n").unwrap();

        let (sender, handle) = start(file.path()).unwrap();
        assert!(sender.record(record("select 1", Some("db1:3306"))));
        assert!(sender.record(record("quit", None)));
        drop(sender);
        handle.join().unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "earlier");
        assert!(lines[1].ends_with("db1:3306 3ms - select 1"));
        assert!(lines[2].ends_with("-:0 3ms - quit"));
    }

    #[test]
    fn test_disabled_sender() {
        assert!(!SqlLogSender::disabled().record(record("select 1", None)));
    }
}
