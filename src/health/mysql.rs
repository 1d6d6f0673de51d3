/// MySQL COM_PING health checker
use super::{HealthChecker, HealthStatus};
use crate::core::backend::ping;
use crate::protocol::Buffer;
use std::time::Duration;
use tokio::net::TcpStream;

/// Sends COM_PING on the idle connection and expects an OK back
pub struct MysqlPingChecker {
    check_interval: Duration,
    check_timeout: Duration,
}

impl MysqlPingChecker {
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            check_timeout,
        }
    }
}

#[async_trait::async_trait]
impl HealthChecker for MysqlPingChecker {
    async fn check_health(&self, link: &TcpStream) -> HealthStatus {
        let mut buf = Buffer::new();
        match ping(link, &mut buf).await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn check_interval(&self) -> Duration {
        self.check_interval
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::tests::{read_frame, write_packet};
    use crate::health::probe;
    use crate::protocol::{AuthResult, ErrorPacket};
    use tokio::net::TcpListener;

    async fn run(reply: Option<Vec<u8>>) -> HealthStatus {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream).await;
            match reply {
                Some(payload) => write_packet(&mut stream, 1, &payload).await,
                None => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        });

        let link = TcpStream::connect(addr).await.unwrap();
        let checker = MysqlPingChecker::new(Duration::from_millis(200));
        probe(&checker, &link).await
    }

    #[tokio::test]
    async fn test_ping_ok() {
        assert_eq!(run(Some(AuthResult::Ok.encode())).await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_ping_error() {
        let err = ErrorPacket::new(1053, "08S01", "Server shutdown in progress");
        let status = run(Some(err.encode())).await;
        assert!(matches!(status, HealthStatus::Unhealthy { .. }));
    }

    #[tokio::test]
    async fn test_ping_silent() {
        assert_eq!(run(None).await, HealthStatus::Timeout);
    }
}
