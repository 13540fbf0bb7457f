use super::server::{TestServer, TestUser};
use anyhow::{Result, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use switchboard_protocol::{Envelope, MessageType};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// WebSocket client speaking the envelope protocol.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect with the session cookie.
    pub async fn connect(server: &TestServer, user: &TestUser) -> Result<Self> {
        let mut request = server.ws_url().into_client_request()?;
        request.headers_mut().insert(
            COOKIE,
            HeaderValue::from_str(&format!("session_id={}", user.token))?,
        );
        let (ws, _) = connect_async(request).await?;
        Ok(Self { ws })
    }

    /// Connect with `?token=` instead of a cookie.
    pub async fn connect_with_query(server: &TestServer, token: &str) -> Result<Self> {
        let url = format!("{}?token={token}", server.ws_url());
        let (ws, _) = connect_async(url).await?;
        Ok(Self { ws })
    }

    /// Attempt an upgrade that is expected to be refused; returns the HTTP status.
    pub async fn rejected_status(server: &TestServer, token: Option<&str>) -> Result<u16> {
        let url = match token {
            Some(token) => format!("{}?token={token}", server.ws_url()),
            None => server.ws_url(),
        };
        match connect_async(url).await {
            Err(tungstenite::Error::Http(resp)) => Ok(resp.status().as_u16()),
            Err(e) => Err(e.into()),
            Ok(_) => bail!("upgrade unexpectedly succeeded"),
        }
    }

    pub async fn send_json(&mut self, value: Value) -> Result<()> {
        self.send_raw(&value.to_string()).await
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    /// Next envelope, skipping transport control frames.
    pub async fn next_envelope(&mut self) -> Result<Envelope> {
        loop {
            let Ok(next) = tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await else {
                bail!("timed out waiting for an envelope");
            };
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Envelope::decode(text.as_str())?),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Binary(_))) => bail!("unexpected binary frame"),
                Some(Ok(Message::Close(frame))) => bail!("connection closed: {frame:?}"),
                Some(Err(e)) => return Err(e.into()),
                None => bail!("connection ended"),
            }
        }
    }

    /// Next envelope of `kind`, discarding anything else (presence, backlog).
    pub async fn next_of(&mut self, kind: MessageType) -> Result<Envelope> {
        loop {
            let envelope = self.next_envelope().await?;
            if envelope.kind == kind {
                return Ok(envelope);
            }
        }
    }

    /// Fail if any envelope arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return Ok(()),
                Ok(Some(Ok(Message::Text(text)))) => bail!("expected silence, got {text}"),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Ok(()),
            }
        }
    }

    /// Wait for the server's close frame and return its code.
    pub async fn close_code(&mut self) -> Result<Option<u16>> {
        loop {
            let Ok(next) = tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await else {
                bail!("timed out waiting for close");
            };
            match next {
                Some(Ok(Message::Close(frame))) => return Ok(frame.map(|f| u16::from(f.code))),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Ok(None),
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
