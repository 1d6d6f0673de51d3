/// Keepalive probing of idle backend connections
pub mod mysql;

pub use mysql::MysqlPingChecker;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Probe run on an idle backend connection
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe the connection in place; the socket stays usable on success
    async fn check_health(&self, link: &TcpStream) -> HealthStatus;

    /// How often idle connections are probed
    fn check_interval(&self) -> Duration;

    fn check_timeout(&self) -> Duration;
}

/// Run `checker` against `link`, bounded by the checker's timeout
pub async fn probe(checker: &dyn HealthChecker, link: &TcpStream) -> HealthStatus {
    match timeout(checker.check_timeout(), checker.check_health(link)).await {
        Ok(status) => status,
        Err(_) => HealthStatus::Timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct MockHealthChecker {
        should_pass: bool,
        delay: Duration,
    }

    #[async_trait]
    impl HealthChecker for MockHealthChecker {
        async fn check_health(&self, _link: &TcpStream) -> HealthStatus {
            tokio::time::sleep(self.delay).await;
            if self.should_pass {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy {
                    reason: "Mock failure".to_string(),
                }
            }
        }

        fn check_interval(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn check_timeout(&self) -> Duration {
            Duration::from_millis(50)
        }
    }

    async fn link() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert_eq!(
            HealthStatus::Unhealthy { reason: "test".to_string() }.to_string(),
            "Unhealthy: test"
        );
        assert_eq!(HealthStatus::Timeout.to_string(), "Timeout");
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Timeout.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_results() {
        let (client, _server) = link().await;

        let pass = MockHealthChecker { should_pass: true, delay: Duration::ZERO };
        assert!(probe(&pass, &client).await.is_healthy());

        let fail = MockHealthChecker { should_pass: false, delay: Duration::ZERO };
        assert!(matches!(probe(&fail, &client).await, HealthStatus::Unhealthy { .. }));

        let slow = MockHealthChecker { should_pass: true, delay: Duration::from_secs(1) };
        assert_eq!(probe(&slow, &client).await, HealthStatus::Timeout);
    }
}
