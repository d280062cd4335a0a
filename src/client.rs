//! REST Client - control channel for a single VPN session server
//!
//! This module provides the [`RestClient`] that resolves the session server
//! once, then runs the connect, disconnect, access token and filter
//! operations against it over pinned TLS. Retry policy belongs to the caller;
//! no operation here retries on its own.

use crate::config::Config;
use crate::crypto::{client_config, PinSet};
use crate::error::{Result, RestError};
use crate::net::{
    Dialer, DnsLookup, EndpointResolver, Exchange, HostLookup, HttpsTransport, Resolution, Target,
};
use crate::protocol::constants::{FILTER_HOST, FILTER_PORT};
use crate::protocol::{
    service_host, to_indented_json, AccessTokenRequest, ConnectRequest, ConnectResponse,
    DisconnectRequest,
};
use crate::token::TokenStore;
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Control channel client for one session server
///
/// Call [`RestClient::resolve`] before any session operation; requests are
/// refused until the server address is known.
pub struct RestClient<T: Exchange = HttpsTransport> {
    config: Config,
    transport: T,
    resolver: EndpointResolver,
    tokens: TokenStore,
}

impl RestClient<HttpsTransport> {
    /// Create a client with the production dialer, DNS lookup and pinned TLS
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the CA bundle
    /// cannot be loaded
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let tls = client_config(config.ca.as_deref(), Arc::new(PinSet::authorized()))?;
        let dialer = Arc::new(Dialer::new(
            config.firewall_mark,
            config.dns_server_addrs()?,
        ));
        let lookup: Arc<dyn HostLookup> = Arc::new(DnsLookup::new(dialer.clone()));
        let transport =
            HttpsTransport::new(dialer, tls).with_user_agent(config.user_agent.clone());

        Ok(Self::with_parts(config, transport, lookup))
    }
}

impl<T: Exchange> RestClient<T> {
    /// Assemble a client from its parts
    pub fn with_parts(config: Config, transport: T, lookup: Arc<dyn HostLookup>) -> Self {
        let tokens = TokenStore::load(config.access_token_file.clone());
        Self {
            config,
            transport,
            resolver: EndpointResolver::new(lookup),
            tokens,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Session server address, once resolved
    pub fn remote(&self) -> Option<SocketAddr> {
        self.resolver.remote()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.resolver.server_name()
    }

    pub fn have_access_token(&self) -> bool {
        self.tokens.has_token()
    }

    /// Resolve the configured host and pin the session to the result
    pub async fn resolve(&mut self) -> Result<Resolution> {
        let port = self.config.effective_port();
        self.resolver.resolve(&self.config.host, port).await
    }

    /// Request a WireGuard session for `public_key`
    pub async fn connect(&self, public_key: &[u8]) -> Result<ConnectResponse> {
        let request = ConnectRequest {
            host: service_host(&self.config.host),
            domain: &self.config.domain,
            access_token: self.tokens.token(),
            public_key,
        };
        request.check()?;

        let body = self.post_session("connect", &request).await?;
        let response: ConnectResponse = serde_json::from_slice(&body)?;
        log::info!(
            "Rest: connected, endpoint {}, keepalive {:?}",
            response.endpoint.socket_addr(),
            response.persistent_keepalive()
        );
        Ok(response)
    }

    /// Tear down the session identified by `session_token`
    pub async fn disconnect(&self, session_token: &[u8]) -> Result<()> {
        let request = DisconnectRequest {
            host: service_host(&self.config.host),
            domain: &self.config.domain,
            session_token,
        };
        request.check()?;

        self.post_session("disconnect", &request).await?;
        log::info!("Rest: disconnected");
        Ok(())
    }

    /// Fetch a new access token and store it
    ///
    /// The current token is presented when there is one; otherwise the
    /// configured username and password are used.
    pub async fn get_access_token(&mut self) -> Result<()> {
        let request = AccessTokenRequest {
            host: service_host(&self.config.host),
            domain: &self.config.domain,
            access_token: self.tokens.token(),
            username: self.config.username.as_deref(),
            password: self.config.password.as_deref(),
        };
        request.check()?;

        let body = self.post_session("accessToken", &request).await?;
        let encoded: String = serde_json::from_slice(&body)?;
        self.tokens.replace_from_base64(&encoded)?;
        log::info!("Rest: access token updated");
        Ok(())
    }

    /// Push the configured filter policy to the filter service
    pub async fn apply_filter(&self) -> Result<()> {
        let filter = &self.config.filter;
        filter.check()?;

        let addr = self.resolver.lookup_once(FILTER_HOST, FILTER_PORT).await?;
        let target = Target {
            addr,
            server_name: FILTER_HOST.to_string(),
        };
        let url = format!("https://{FILTER_HOST}:{FILTER_PORT}/filter");

        let body = self.post(&target, &url, filter).await?;
        if String::from_utf8_lossy(&body).trim() == "false" {
            return Err(RestError::FilterFailed);
        }
        log::info!("Rest: filter applied");
        Ok(())
    }

    async fn post_session<R: Serialize>(&self, op: &str, request: &R) -> Result<Bytes> {
        let (Some(addr), Some(server_name)) = (self.remote(), self.server_name()) else {
            return Err(RestError::Validation(
                "server address is not resolved".to_string(),
            ));
        };
        let target = Target {
            addr,
            server_name: server_name.to_string(),
        };
        let url = format!("https://{addr}/{}/{op}", self.config.api_version);
        self.post(&target, &url, request).await
    }

    async fn post<R: Serialize>(&self, target: &Target, url: &str, request: &R) -> Result<Bytes> {
        let body = to_indented_json(request)?;
        let timeout = self.config.rest_timeout();

        let reply = tokio::time::timeout(timeout, self.transport.post_json(target, url, body))
            .await
            .map_err(|_| RestError::Timeout(format!("POST {url} after {timeout:?}")))??;

        match reply.status {
            200 => Ok(reply.body),
            403 => {
                log::error!("Rest: {url} refused this client version, update required");
                Err(RestError::UpdateRequired)
            }
            status => Err(RestError::BadStatus(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::resolver::tests::ScriptedLookup;
    use crate::net::Reply;
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::net::IpAddr;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Sent {
        target: Target,
        url: String,
        body: String,
    }

    /// Records requests and replays canned replies
    #[derive(Default)]
    struct FakeExchange {
        replies: Mutex<VecDeque<Reply>>,
        sent: Mutex<Vec<Sent>>,
    }

    impl FakeExchange {
        fn replying(replies: Vec<(u16, &str)>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|(status, body)| Reply {
                            status,
                            body: Bytes::from(body.to_string()),
                        })
                        .collect(),
                ),
                sent: Mutex::default(),
            }
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Exchange for FakeExchange {
        fn post_json<'a>(
            &'a self,
            target: &'a Target,
            url: &'a str,
            body: Vec<u8>,
        ) -> BoxFuture<'a, Result<Reply>> {
            self.sent.lock().unwrap().push(Sent {
                target: target.clone(),
                url: url.to_string(),
                body: String::from_utf8(body).unwrap(),
            });
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| RestError::Network("no scripted reply".to_string()));
            Box::pin(async move { reply })
        }
    }

    const CONNECT_REPLY: &str = r#"{
        "publicKey": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
        "presharedKey": null,
        "endpoint": {"IP": "198.51.100.7", "Port": 432, "Zone": ""},
        "persistentKeepaliveInterval": 20000000000,
        "allowedIps": ["0.0.0.0", "::"],
        "DNS": ["10.128.0.1"],
        "gateway": ["10.128.0.1"],
        "sessionToken": "c2Vzc2lvbg==",
        "staleAccessToken": true
    }"#;

    fn client(
        config: Config,
        replies: Vec<(u16, &str)>,
        answers: Vec<Result<Vec<IpAddr>>>,
    ) -> (RestClient<FakeExchange>, Arc<ScriptedLookup>) {
        let lookup = Arc::new(ScriptedLookup::new(answers));
        let client = RestClient::with_parts(config, FakeExchange::replying(replies), lookup.clone());
        (client, lookup)
    }

    #[tokio::test]
    async fn test_literal_host_resolves_without_lookup() {
        let (mut client, lookup) = client(Config::for_host("203.0.113.9"), vec![], vec![]);

        let resolution = client.resolve().await.unwrap();
        assert_eq!(resolution, Resolution::Literal("203.0.113.9:432".parse().unwrap()));
        assert_eq!(client.remote(), Some("203.0.113.9:432".parse().unwrap()));
        assert_eq!(client.server_name(), Some("hideservers.net"));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_requires_resolution() {
        let (client, _) = client(Config::for_host("nl.hideservers.net"), vec![(200, "{}")], vec![]);

        let err = client.connect(&[7u8; 32]).await.unwrap_err();
        assert!(matches!(err, RestError::Validation(_)));
        assert!(client.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_bad_public_key_is_not_sent() {
        let (mut client, _) = client(Config::for_host("203.0.113.9"), vec![(200, "{}")], vec![]);
        client.resolve().await.unwrap();

        for key in [&[][..], &[1u8; 31][..], &[1u8; 33][..]] {
            let err = client.connect(key).await.unwrap_err();
            assert!(matches!(err, RestError::Validation(_)));
        }
        assert!(client.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_connect_request_and_response() {
        let config = Config::for_host("nl.hideservers.net");
        let (mut client, _) = client(
            config,
            vec![(200, CONNECT_REPLY)],
            vec![Ok(vec!["192.0.2.10".parse().unwrap()])],
        );
        assert!(matches!(client.resolve().await.unwrap(), Resolution::Fresh(_)));

        let response = client.connect(&[0u8; 32]).await.unwrap();
        assert_eq!(response.endpoint.socket_addr(), "198.51.100.7:432".parse().unwrap());
        assert_eq!(response.session_token, b"session".to_vec());
        assert!(response.preshared_key.is_empty());
        assert!(response.stale_access_token);

        let sent = client.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "https://192.0.2.10:432/v1.0.0/connect");
        assert_eq!(sent[0].target.server_name, "nl.hideservers.net");

        let body: serde_json::Value = serde_json::from_str(&sent[0].body).unwrap();
        assert_eq!(body["host"], "nl");
        assert_eq!(body["domain"], "hide.me");
        assert!(body["accessToken"].is_null());
        assert!(sent[0].body.contains("\n\t\"host\""));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (mut client, _) = client(
            Config::for_host("203.0.113.9"),
            vec![(403, "forbidden"), (500, "oops"), (200, "")],
            vec![],
        );
        client.resolve().await.unwrap();

        let err = client.disconnect(b"session").await.unwrap_err();
        assert!(matches!(err, RestError::UpdateRequired));
        assert!(!err.is_retriable());

        let err = client.disconnect(b"session").await.unwrap_err();
        assert!(matches!(err, RestError::BadStatus(500)));

        client.disconnect(b"session").await.unwrap();
        assert_eq!(
            client.transport.sent()[2].url,
            "https://203.0.113.9:432/v1.0.0/disconnect"
        );
    }

    #[tokio::test]
    async fn test_empty_session_token_is_rejected() {
        let (mut client, _) = client(Config::for_host("203.0.113.9"), vec![], vec![]);
        client.resolve().await.unwrap();

        let err = client.disconnect(b"").await.unwrap_err();
        assert!(matches!(err, RestError::Validation(_)));
    }

    #[tokio::test]
    async fn test_access_token_refresh_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accessToken.txt");
        let mut config = Config::for_host("203.0.113.9");
        config.access_token_file = Some(path.clone());
        config.username = Some("user".to_string());
        config.password = Some("secret".to_string());

        let (mut client, _) = client(config, vec![(200, "\"bmV3LXRva2Vu\"")], vec![]);
        assert!(!client.have_access_token());
        client.resolve().await.unwrap();

        client.get_access_token().await.unwrap();
        assert!(client.have_access_token());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "bmV3LXRva2Vu");

        let sent = client.transport.sent();
        assert_eq!(sent[0].url, "https://203.0.113.9:432/v1.0.0/accessToken");
        let body: serde_json::Value = serde_json::from_str(&sent[0].body).unwrap();
        assert_eq!(body["username"], "user");
        assert!(body["accessToken"].is_null());
    }

    #[tokio::test]
    async fn test_access_token_refresh_presents_current_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accessToken.txt");
        std::fs::write(&path, "b2xk").unwrap();
        let mut config = Config::for_host("203.0.113.9");
        config.access_token_file = Some(path.clone());

        let (mut client, _) = client(config, vec![(200, "\"bmV3\"")], vec![]);
        client.resolve().await.unwrap();
        client.get_access_token().await.unwrap();

        let body: serde_json::Value =
            serde_json::from_str(&client.transport.sent()[0].body).unwrap();
        assert_eq!(body["accessToken"], "b2xk");
        assert!(body.get("username").is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "bmV3");
    }

    #[tokio::test]
    async fn test_undecodable_token_reply_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accessToken.txt");
        let mut config = Config::for_host("203.0.113.9");
        config.access_token_file = Some(path.clone());
        config.username = Some("user".to_string());
        config.password = Some("secret".to_string());

        let (mut client, _) = client(config, vec![(200, "\"not*base64\"")], vec![]);
        client.resolve().await.unwrap();

        let err = client.get_access_token().await.unwrap_err();
        assert!(matches!(err, RestError::Decode(_)));
        assert!(!client.have_access_token());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_access_token_without_credentials() {
        let (mut client, _) = client(Config::for_host("203.0.113.9"), vec![], vec![]);
        client.resolve().await.unwrap();

        let err = client.get_access_token().await.unwrap_err();
        assert!(matches!(err, RestError::Validation(_)));
        assert!(client.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_filter_rejected() {
        let mut config = Config::for_host("203.0.113.9");
        config.filter.ads = true;
        let (client, _) = client(
            config,
            vec![(200, " false\n"), (200, "true")],
            vec![
                Ok(vec!["192.0.2.44".parse().unwrap()]),
                Ok(vec!["192.0.2.44".parse().unwrap()]),
            ],
        );

        let err = client.apply_filter().await.unwrap_err();
        assert!(matches!(err, RestError::FilterFailed));
        client.apply_filter().await.unwrap();

        let sent = client.transport.sent();
        assert_eq!(sent[0].url, "https://vpn.hide.me:4321/filter");
        assert_eq!(sent[0].target.addr, "192.0.2.44:4321".parse().unwrap());
        assert_eq!(sent[0].target.server_name, "vpn.hide.me");
        // The session address stays untouched by the filter lookup
        assert_eq!(client.remote(), None);
    }

    #[tokio::test]
    async fn test_invalid_filter_is_not_sent() {
        let mut config = Config::for_host("203.0.113.9");
        config.filter.pg = 7;
        let (client, lookup) = client(config, vec![], vec![]);

        let err = client.apply_filter().await.unwrap_err();
        assert!(matches!(err, RestError::Validation(_)));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        struct Stalled;
        impl Exchange for Stalled {
            fn post_json<'a>(
                &'a self,
                _target: &'a Target,
                _url: &'a str,
                _body: Vec<u8>,
            ) -> BoxFuture<'a, Result<Reply>> {
                Box::pin(futures::future::pending())
            }
        }

        let mut config = Config::for_host("203.0.113.9");
        config.rest_timeout = 1;
        let mut client =
            RestClient::with_parts(config, Stalled, Arc::new(ScriptedLookup::default()));
        client.resolve().await.unwrap();

        tokio::time::pause();
        let err = client.disconnect(b"session").await.unwrap_err();
        assert!(matches!(err, RestError::Timeout(_)));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = RestClient::new(Config::for_host(""));
        assert!(matches!(result, Err(RestError::Config(_))));
    }

    #[test]
    fn test_new_uses_configured_user_agent() {
        let mut config = Config::for_host("nl.hideservers.net");
        config.user_agent = "HIDE.ME.LINUX.CLI-1.0.0".to_string();
        let client = RestClient::new(config).unwrap();
        assert_eq!(client.transport.user_agent(), "HIDE.ME.LINUX.CLI-1.0.0");
    }
}
