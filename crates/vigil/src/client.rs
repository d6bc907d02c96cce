use std::path::PathBuf;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};

use crate::protocol::{ApiRequest, ApiResponse};

pub const DEFAULT_TCP_ADDR: &str = "127.0.0.1:1787";

pub enum QueryClient {
    Uds(BufReader<UnixStream>),
    Tcp(BufReader<TcpStream>),
}

impl QueryClient {
    pub async fn connect(uds: Option<PathBuf>, addr: Option<String>) -> anyhow::Result<Self> {
        if let Some(path) = uds {
            let stream = UnixStream::connect(&path)
                .await
                .with_context(|| format!("connect UDS {}", path.display()))?;
            return Ok(Self::Uds(BufReader::new(stream)));
        }

        if addr.is_none()
            && let Ok(path) = std::env::var("VIGIL_QUERY_UDS_PATH")
            && let Ok(stream) = UnixStream::connect(path).await
        {
            return Ok(Self::Uds(BufReader::new(stream)));
        }

        let addr = addr
            .or_else(|| std::env::var("VIGIL_QUERY_TCP_ADDR").ok())
            .unwrap_or_else(|| DEFAULT_TCP_ADDR.to_string());
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connect vigil daemon at {addr}"))?;
        Ok(Self::Tcp(BufReader::new(stream)))
    }

    pub async fn request(&mut self, req: ApiRequest) -> anyhow::Result<ApiResponse> {
        match self {
            QueryClient::Uds(stream) => exchange(stream, &req).await,
            QueryClient::Tcp(stream) => exchange(stream, &req).await,
        }
    }
}

async fn exchange<T>(stream: &mut BufReader<T>, req: &ApiRequest) -> anyhow::Result<ApiResponse>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(req)?;
    stream.get_mut().write_all(&payload).await?;
    stream.get_mut().write_all(b"\n").await?;
    stream.get_mut().flush().await?;

    let mut line = String::new();
    let n = stream.read_line(&mut line).await?;
    anyhow::ensure!(n > 0, "daemon closed the connection without a response");
    serde_json::from_str(&line).context("decode daemon response")
}
