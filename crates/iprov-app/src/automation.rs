//! Automation agent sessions
//!
//! Only session creation is implemented. WDA is reached over HTTP on the
//! forwarded automation port. CFA answers SP requests on the same port.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_json::{json, Value};

use iprov_core::prelude::*;
use iprov_core::types::AgentKind;
use iprov_daemon::stream::sp::ReqSocket;

/// App WDA opens when asked for a session without a bundle id
const DEFAULT_SESSION_BUNDLE: &str = "com.apple.Preferences";
/// Transport failures tolerated while creating a WDA session
const SESSION_RETRIES: u32 = 5;
const SESSION_RETRY_DELAY: Duration = Duration::from_secs(1);
const CFA_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Session-capable client for the device's automation agent
pub enum AutomationClient {
    Wda(WdaClient),
    Cfa(CfaClient),
}

impl AutomationClient {
    /// Client for `kind` listening on local `port`
    pub fn new(kind: AgentKind, port: u16, http: reqwest::Client) -> Self {
        match kind {
            AgentKind::Wda => {
                AutomationClient::Wda(WdaClient::new(format!("http://127.0.0.1:{}", port), http))
            }
            AgentKind::Cfa => AutomationClient::Cfa(CfaClient::new(SocketAddr::from((
                Ipv4Addr::LOCALHOST,
                port,
            )))),
        }
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            AutomationClient::Wda(_) => AgentKind::Wda,
            AutomationClient::Cfa(_) => AgentKind::Cfa,
        }
    }

    /// Reuse the agent's session or create one; returns the session id
    pub async fn ensure_session(&mut self) -> Result<String> {
        match self {
            AutomationClient::Wda(wda) => wda.ensure_session().await,
            AutomationClient::Cfa(cfa) => cfa.ensure_session().await,
        }
    }

    /// Forget session state after the agent restarts
    pub fn reset(&mut self) {
        match self {
            AutomationClient::Wda(wda) => wda.session_id = None,
            AutomationClient::Cfa(cfa) => {
                cfa.socket = None;
                cfa.session_made = false;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// WDA
// ─────────────────────────────────────────────────────────

pub struct WdaClient {
    base: String,
    http: reqwest::Client,
    session_id: Option<String>,
}

impl WdaClient {
    pub fn new(base: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base: base.into(),
            http,
            session_id: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub async fn ensure_session(&mut self) -> Result<String> {
        let sid = match self.get_session().await {
            Some(sid) => {
                debug!("Reusing WDA session {}", sid);
                sid
            }
            None => self.create_session(DEFAULT_SESSION_BUNDLE).await?,
        };
        self.session_id = Some(sid.clone());
        Ok(sid)
    }

    /// Session the agent already has, from `GET /status`
    async fn get_session(&self) -> Option<String> {
        let resp = self
            .http
            .get(format!("{}/status", self.base))
            .send()
            .await
            .ok()?;
        let status: Value = resp.json().await.ok()?;
        session_id(&status)
    }

    async fn create_session(&self, bundle_id: &str) -> Result<String> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "arguments": [],
                    "bundleId": bundle_id,
                    "environment": {},
                    "shouldUseSingletonTestManager": true,
                    "shouldUseTestManagerForVisibilityDetection": false,
                    "shouldWaitForQuiescence": false
                },
                "firstMatch": [{}]
            }
        });
        let url = format!("{}/session", self.base);

        let mut attempt = 0;
        let resp = loop {
            attempt += 1;
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) => break resp,
                Err(e) if attempt < SESSION_RETRIES => {
                    warn!("Creating WDA session failed ({}), retrying", e);
                    tokio::time::sleep(SESSION_RETRY_DELAY).await;
                }
                Err(e) => return Err(Error::http(format!("WDA session create: {}", e))),
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::http(format!(
                "WDA session create returned HTTP {}: {}",
                status, text
            )));
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| Error::http(format!("WDA session create: {}", e)))?;
        let sid = session_id(&value)
            .ok_or_else(|| Error::http("WDA session create returned no sessionId"))?;
        info!("Created WDA session {}", sid);
        Ok(sid)
    }
}

/// `sessionId` at the top level or under `value`
fn session_id(body: &Value) -> Option<String> {
    [&body["sessionId"], &body["value"]["sessionId"]]
        .into_iter()
        .find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string))
}

// ─────────────────────────────────────────────────────────
// CFA
// ─────────────────────────────────────────────────────────

pub struct CfaClient {
    addr: SocketAddr,
    socket: Option<ReqSocket>,
    session_made: bool,
}

impl CfaClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            socket: None,
            session_made: false,
        }
    }

    pub async fn ensure_session(&mut self) -> Result<String> {
        if !self.session_made {
            self.create_session("").await?;
        }
        Ok("1".to_string())
    }

    async fn create_session(&mut self, bundle_id: &str) -> Result<()> {
        let mut socket = match self.socket.take() {
            Some(socket) => socket,
            None => ReqSocket::dial(self.addr).await?,
        };

        let body = json!({ "action": "createSession", "bundleId": bundle_id }).to_string();
        debug!("Creating CFA session at {}", self.addr);
        tokio::time::timeout(CFA_REQUEST_TIMEOUT, socket.request(body.as_bytes()))
            .await
            .map_err(|_| Error::connection_lost("CFA"))??;

        self.socket = Some(socket);
        self.session_made = true;
        info!("Created CFA session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iprov_daemon::stream::sp::RepSocket;
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_session_id_locations() {
        assert_eq!(
            session_id(&json!({"sessionId": "abc"})),
            Some("abc".to_string())
        );
        assert_eq!(
            session_id(&json!({"value": {"sessionId": "def"}})),
            Some("def".to_string())
        );
        assert_eq!(session_id(&json!({"sessionId": null})), None);
        assert_eq!(session_id(&json!({"sessionId": ""})), None);
    }

    #[tokio::test]
    async fn test_wda_reuses_existing_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sessionId": "existing",
                "value": {"ready": true}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut wda = WdaClient::new(server.uri(), reqwest::Client::new());
        assert_eq!(wda.ensure_session().await.unwrap(), "existing");
        assert_eq!(wda.session_id(), Some("existing"));
    }

    #[tokio::test]
    async fn test_wda_creates_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": {"ready": true}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .and(body_string_contains("com.apple.Preferences"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": {"sessionId": "fresh", "capabilities": {}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut wda = WdaClient::new(server.uri(), reqwest::Client::new());
        assert_eq!(wda.ensure_session().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_wda_create_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(500).set_body_string("no"))
            .mount(&server)
            .await;

        let mut wda = WdaClient::new(server.uri(), reqwest::Client::new());
        let err = wda.ensure_session().await.unwrap_err();
        assert!(matches!(err, Error::Http { .. }));
        assert_eq!(wda.session_id(), None);
    }

    #[tokio::test]
    async fn test_cfa_session_created_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let agent = tokio::spawn(async move {
            let mut rep = RepSocket::accept(&listener).await.unwrap();
            let (id, body) = rep.recv().await.unwrap();
            rep.reply(id, b"{}").await.unwrap();
            let request: Value = serde_json::from_slice(&body).unwrap();
            assert!(rep.recv().await.is_err());
            request
        });

        let mut client = AutomationClient::new(AgentKind::Cfa, addr.port(), reqwest::Client::new());
        assert_eq!(client.kind(), AgentKind::Cfa);
        client.ensure_session().await.unwrap();
        client.ensure_session().await.unwrap();
        client.reset();

        let request = agent.await.unwrap();
        assert_eq!(request["action"], "createSession");
        assert_eq!(request["bundleId"], "");
    }

    #[tokio::test]
    async fn test_cfa_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfa = CfaClient::new(addr);
        assert!(cfa.ensure_session().await.is_err());
    }
}
