use deadpool::managed::{Manager, Metrics, Pool, RecycleError, RecycleResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// One configured upstream server. Several may be tried in fallback
/// order per §4.5.
#[derive(Debug, Clone)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bounds concurrent open connections to this server (§5 Resource
    /// limits: "no more than `max_connections` may be open").
    pub max_connections: usize,
}

pub struct NntpConnection {
    stream: BufReader<TlsStream<TcpStream>>,
    /// Updated whenever a command round-trip completes successfully;
    /// `NntpManager::recycle` compares this against `idle_timeout` before
    /// handing the connection back out of the pool.
    last_used: Instant,
}

impl NntpConnection {
    pub async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.stream.get_mut().write_all(line.as_bytes()).await?;
        self.stream.get_mut().write_all(b"\r\n").await?;
        self.stream.get_mut().flush().await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.stream.get_mut().write_all(data).await?;
        Ok(())
    }

    pub async fn read_line(&mut self) -> anyhow::Result<String> {
        let mut line = String::new();
        self.stream.read_line(&mut line).await?;
        self.last_used = Instant::now();
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Reads a multi-line response body, terminated by a lone `.` line,
    /// undoing dot-stuffing as it goes.
    pub async fn read_multiline(&mut self) -> anyhow::Result<String> {
        let mut body = String::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                break;
            }
            let unstuffed = line.strip_prefix("..").map(|rest| format!(".{rest}"));
            body.push_str(unstuffed.as_deref().unwrap_or(&line));
            body.push_str("\r\n");
        }
        self.last_used = Instant::now();
        Ok(body)
    }
}

pub struct NntpManager {
    endpoint: ServerEndpoint,
    tls_connector: TlsConnector,
    /// §4.5 "health-check replacement of sockets whose last successful
    /// command was older than `idle_timeout`".
    idle_timeout: Duration,
}

impl NntpManager {
    pub fn new(endpoint: ServerEndpoint, tls_connector: TlsConnector, idle_timeout: Duration) -> Self {
        Self {
            endpoint,
            tls_connector,
            idle_timeout,
        }
    }
}

impl Manager for NntpManager {
    type Type = NntpConnection;
    type Error = anyhow::Error;

    async fn create(&self) -> Result<NntpConnection, anyhow::Error> {
        let tcp = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        let server_name = rustls::pki_types::ServerName::try_from(self.endpoint.host.clone())
            .map_err(|_| anyhow::anyhow!("invalid server name: {}", self.endpoint.host))?;
        let tls = self.tls_connector.connect(server_name, tcp).await?;
        let mut conn = NntpConnection {
            stream: BufReader::new(tls),
            last_used: Instant::now(),
        };

        let greeting = conn.read_line().await?;
        anyhow::ensure!(
            greeting.starts_with("200") || greeting.starts_with("201"),
            "unexpected NNTP greeting: {greeting}"
        );

        if let (Some(user), Some(pass)) = (&self.endpoint.username, &self.endpoint.password) {
            conn.write_line(&format!("AUTHINFO USER {user}")).await?;
            let resp = conn.read_line().await?;
            anyhow::ensure!(resp.starts_with("381"), "AUTHINFO USER rejected: {resp}");
            conn.write_line(&format!("AUTHINFO PASS {pass}")).await?;
            let resp = conn.read_line().await?;
            anyhow::ensure!(resp.starts_with("281"), "AUTHINFO PASS rejected: {resp}");
        }

        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut NntpConnection,
        _metrics: &Metrics,
    ) -> RecycleResult<anyhow::Error> {
        let idle = conn.last_used.elapsed();
        if idle > self.idle_timeout {
            return Err(RecycleError::message(format!(
                "connection idle for {idle:?}, exceeds idle_timeout {:?}",
                self.idle_timeout
            )));
        }
        Ok(())
    }
}

pub type NntpPool = Pool<NntpManager>;

pub fn build_pool(
    endpoint: ServerEndpoint,
    tls_connector: TlsConnector,
    idle_timeout: Duration,
) -> anyhow::Result<NntpPool> {
    let max_size = endpoint.max_connections;
    let manager = NntpManager::new(endpoint, tls_connector, idle_timeout);
    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build NNTP connection pool: {e}"))
}

/// Builds a `TlsConnector` trusting the platform's native root store,
/// the ordinary case for connecting to a commercial Usenet provider.
pub fn default_tls_connector() -> anyhow::Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()? {
        roots.add(cert)?;
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
