//! TCP request dispatch
//!
//! One `ProtocolDispatcher` per connection. It owns the connection's
//! session, routes decoded requests to the directory and returns the
//! replies in the order they must be written.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::error::Ed2kError;
use crate::protocol::{ClientRequest, Endpoint, LoginRequest, Message, OfferedFile, SearchExpr, ServerMessage};
use crate::server::context::ServerContext;
use crate::server::directory::Source;
use crate::session::{ClientSession, SessionHandle};

/// What the connection should do after a message
#[derive(Debug, Default)]
pub struct Outcome {
    /// Replies for this connection, in order
    pub replies: Vec<Message>,
    /// Close once the replies are written
    pub close: bool,
}

impl Outcome {
    fn reply(messages: Vec<ServerMessage>) -> Self {
        Self {
            replies: messages.iter().map(ServerMessage::to_message).collect(),
            close: false,
        }
    }

    fn close() -> Self {
        Self {
            replies: Vec::new(),
            close: true,
        }
    }
}

pub struct ProtocolDispatcher {
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    handle: SessionHandle,
    session: Option<ClientSession>,
}

impl ProtocolDispatcher {
    pub fn new(ctx: Arc<ServerContext>, handle: SessionHandle) -> Self {
        Self {
            peer: handle.peer(),
            ctx,
            handle,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    fn peer_ipv4(&self) -> Ipv4Addr {
        match self.peer.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Handle one inbound message. Decode failures are returned as errors and
    /// leave the session untouched.
    pub async fn dispatch(&mut self, message: &Message) -> Result<Outcome> {
        let request = ClientRequest::decode(message)?;
        debug!("{} < {}", message.name(), self.peer);

        if let ClientRequest::Login(login) = request {
            return self.login(login).await;
        }

        let Some(session) = self.session.clone() else {
            warn!("Ignoring {} from {} before login", message.name(), self.peer);
            return Ok(Outcome::default());
        };

        let outcome = match request {
            ClientRequest::Login(_) => Outcome::default(),
            ClientRequest::OfferFiles(files) => {
                self.offer_files(&session, &files).await;
                Outcome::default()
            }
            ClientRequest::GetServerList => self.server_list().await,
            ClientRequest::GetSources { hash, size, obfuscated } => self.sources(hash, size, obfuscated).await,
            ClientRequest::Search(expr) => self.search(&expr).await,
            ClientRequest::CallbackRequest { low_id } => self.callback(&session, low_id).await,
            ClientRequest::Unknown(opcode) => {
                warn!("Unhandled opcode 0x{:02x} from {}", opcode, self.peer);
                Outcome::default()
            }
        };
        for reply in &outcome.replies {
            debug!("{} > {}", reply.name(), self.peer);
        }
        Ok(outcome)
    }

    async fn login(&mut self, login: LoginRequest) -> Result<Outcome> {
        if self.session.is_some() {
            warn!("Repeated login from {}, ignoring", self.peer);
            return Ok(Outcome::default());
        }

        let mut session = ClientSession::from_login(&login, self.peer_ipv4());

        // claimed before the probe so a second login with this hash is refused
        match self.ctx.directory.register(&session).await {
            Ok(Some(storage_id)) => session.storage_id = Some(storage_id),
            Ok(None) => {
                warn!("Client {} already connected, closing {}", session.hash_hex(), self.peer);
                return Ok(Outcome::close());
            }
            Err(e) => {
                error!("Failed to register {}: {}", self.peer, e);
                return Ok(Outcome::close());
            }
        }

        let mut bundle = Vec::new();
        let reachable = self.ctx.probe.is_reachable(session.ip, session.port, session.hash).await;
        if reachable {
            session.assigned_id = session.high_id();
            info!("Assign HighID {} to {}", session.assigned_id, self.peer);
        } else {
            match self.ctx.registry.register_low_id(self.handle.clone()).await {
                Ok(id) => {
                    session.assigned_id = id;
                    info!("Assign LowID {} to {}", id, self.peer);
                    bundle.push(ServerMessage::Text(self.ctx.info.low_id_message.clone()));
                }
                Err(e) => {
                    warn!("No LowID for {}: {}", self.peer, e);
                    self.unregister(&session).await;
                    return Ok(Outcome::close());
                }
            }
        }

        let info = &self.ctx.info;
        let users = self.ctx.directory.client_count().await.unwrap_or(0);
        let files = self.ctx.directory.file_count().await.unwrap_or(0);
        bundle.push(ServerMessage::Text(info.login_message.clone()));
        bundle.push(ServerMessage::Text(info.version_banner()));
        bundle.push(ServerMessage::Status { users, files });
        bundle.push(ServerMessage::IdChange {
            id: session.assigned_id,
            flags: info.tcp_flags(),
        });
        bundle.push(info.ident());

        info!(
            "Client {} logged in from {} ({})",
            session.hash_hex(),
            self.peer,
            session.name().unwrap_or("unnamed")
        );
        self.session = Some(session);

        let outcome = Outcome::reply(bundle);
        for reply in &outcome.replies {
            debug!("{} > {}", reply.name(), self.peer);
        }
        Ok(outcome)
    }

    async fn offer_files(&self, session: &ClientSession, files: &[OfferedFile]) {
        let Some(storage_id) = session.storage_id else {
            return;
        };
        let source = Source {
            client_id: session.assigned_id,
            port: session.port,
        };
        for file in files {
            if let Err(e) = self.ctx.directory.add_source(storage_id, source, file).await {
                warn!("Failed to add {} from {}: {}", hex::encode(file.info.hash), self.peer, e);
            }
        }
        trace!("Got {} files from {}", files.len(), self.peer);
    }

    async fn server_list(&self) -> Outcome {
        let mut replies = Vec::new();
        match self.ctx.directory.servers().await {
            Ok(servers) => replies.push(ServerMessage::ServerList(servers)),
            Err(e) => warn!("Server list unavailable: {}", e),
        }
        replies.push(self.ctx.info.ident());
        Outcome::reply(replies)
    }

    async fn sources(&self, hash: [u8; 16], size: u64, obfuscated: bool) -> Outcome {
        match self.ctx.directory.get_sources(&hash, Some(size)).await {
            Ok(sources) => {
                trace!("Got {} sources for {}", sources.len(), hex::encode(hash));
                let sources = sources
                    .into_iter()
                    .map(|s| Endpoint {
                        ip: s.client_id,
                        port: s.port,
                    })
                    .collect();
                Outcome::reply(vec![ServerMessage::FoundSources {
                    hash,
                    sources,
                    obfuscated,
                }])
            }
            Err(e) => {
                warn!("Sources unavailable for {}: {}", hex::encode(hash), e);
                Outcome::default()
            }
        }
    }

    async fn search(&self, expr: &SearchExpr) -> Outcome {
        info!("Search from {}: {}", self.peer, expr);
        match self.ctx.directory.find(expr).await {
            Ok(hits) => Outcome::reply(vec![ServerMessage::SearchResult(hits)]),
            Err(e) => {
                warn!("Search failed: {}", e);
                Outcome::default()
            }
        }
    }

    async fn callback(&self, session: &ClientSession, low_id: u32) -> Outcome {
        let requested = ServerMessage::CallbackRequested(session.endpoint()).to_message();
        if self.ctx.registry.relay(low_id, requested).await {
            debug!("CALLBACKREQUESTED > LowID {} for {}", low_id, self.peer);
            Outcome::default()
        } else {
            debug!("Callback to LowID {} failed, client not connected", low_id);
            Outcome::reply(vec![ServerMessage::CallbackFailed])
        }
    }

    /// Release everything the session holds
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.is_low_id() {
            self.ctx.registry.release_low_id(session.assigned_id).await;
        }
        self.unregister(&session).await;
        debug!("Session for {} closed", self.peer);
    }

    async fn unregister(&self, session: &ClientSession) {
        let Some(storage_id) = session.storage_id else {
            return;
        };
        if let Err(e) = self.ctx.directory.unregister(storage_id).await {
            let e = Ed2kError::directory_unavailable_with_source("Failed to unregister client", e.to_string());
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HandshakeStrategy;
    use crate::protocol::constants::*;
    use crate::protocol::{FileInfo, SearchField, Tag};
    use crate::server::context::ServerInfo;
    use crate::server::directory::{Directory, MemoryDirectory};
    use crate::session::{pack_ipv4, LowIdPool, ReachabilityProbe, SessionRegistry, StaticProbe};
    use std::time::Duration;

    fn context(reachable: bool, pool: LowIdPool) -> Arc<ServerContext> {
        let info = ServerInfo {
            name: "test server".to_string(),
            description: "unit tests".to_string(),
            login_message: "welcome".to_string(),
            low_id_message: "You have LowID.".to_string(),
            ..ServerInfo::default()
        };
        let probe: Arc<dyn ReachabilityProbe> = Arc::new(StaticProbe(reachable));
        Arc::new(ServerContext {
            info,
            directory: Arc::new(MemoryDirectory::new(vec![Endpoint { ip: 0x0200000a, port: 4661 }])),
            registry: SessionRegistry::new(pool),
            probe,
            handshake: HandshakeStrategy::DiffieHellman,
            handshake_timeout: Duration::from_millis(500),
        })
    }

    fn dispatcher(ctx: &Arc<ServerContext>, port: u16) -> (ProtocolDispatcher, tokio::sync::mpsc::Receiver<Message>) {
        let peer: SocketAddr = format!("10.0.0.{}:{}", port % 200 + 1, port).parse().unwrap();
        let (handle, rx) = SessionHandle::new(peer);
        (ProtocolDispatcher::new(ctx.clone(), handle), rx)
    }

    fn login(hash: [u8; 16]) -> Message {
        ClientRequest::Login(LoginRequest {
            hash,
            client_id: 0x01020304,
            port: 5555,
            tags: vec![Tag::string(TAG_NAME, "test")],
        })
        .encode()
        .unwrap()
    }

    fn opcodes(outcome: &Outcome) -> Vec<u8> {
        outcome.replies.iter().map(|m| m.opcode).collect()
    }

    #[tokio::test]
    async fn test_login_high_id_bundle() {
        let ctx = context(true, LowIdPool::new(1, 10, true));
        let (mut d, _rx) = dispatcher(&ctx, 5555);

        let outcome = d.dispatch(&login([0; 16])).await.unwrap();
        assert!(!outcome.close);
        assert_eq!(
            opcodes(&outcome),
            vec![OP_SERVERMESSAGE, OP_SERVERMESSAGE, OP_SERVERSTATUS, OP_IDCHANGE, OP_SERVERIDENT]
        );

        let session = d.session().unwrap();
        assert_eq!(session.assigned_id, pack_ipv4(Ipv4Addr::new(10, 0, 0, 156)));
        assert_eq!(session.name(), Some("test"));

        match ServerMessage::decode(&outcome.replies[3]).unwrap() {
            ServerMessage::IdChange { id, flags } => {
                assert_eq!(id, session.assigned_id);
                assert_eq!(flags, ctx.info.tcp_flags());
            }
            other => panic!("unexpected {:?}", other),
        }
        match ServerMessage::decode(&outcome.replies[2]).unwrap() {
            ServerMessage::Status { users, .. } => assert_eq!(users, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_low_id_bundle() {
        let ctx = context(false, LowIdPool::new(1, 10, true));
        let (mut d, _rx) = dispatcher(&ctx, 4000);

        let outcome = d.dispatch(&login([1; 16])).await.unwrap();
        assert_eq!(outcome.replies.len(), 6);
        assert_eq!(
            ServerMessage::decode(&outcome.replies[0]).unwrap(),
            ServerMessage::Text("You have LowID.".to_string())
        );
        assert_eq!(d.session().unwrap().assigned_id, 1);
        assert_eq!(ctx.registry.low_id_count().await, 1);

        d.close().await;
        assert_eq!(ctx.registry.low_id_count().await, 0);
        assert!(!ctx.directory.is_connected(&[1; 16]).await.unwrap());
    }

    #[tokio::test]
    async fn test_low_id_exhaustion_closes() {
        let ctx = context(false, LowIdPool::new(1, 1, true));
        let (mut first, _rx1) = dispatcher(&ctx, 4001);
        let (mut second, _rx2) = dispatcher(&ctx, 4002);

        assert!(!first.dispatch(&login([1; 16])).await.unwrap().close);
        let outcome = second.dispatch(&login([2; 16])).await.unwrap();
        assert!(outcome.close);
        assert!(second.session().is_none());
        assert!(!ctx.directory.is_connected(&[2; 16]).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_hash_closes() {
        let ctx = context(true, LowIdPool::new(1, 10, true));
        let (mut first, _rx1) = dispatcher(&ctx, 4001);
        let (mut second, _rx2) = dispatcher(&ctx, 4002);

        first.dispatch(&login([7; 16])).await.unwrap();
        assert!(second.dispatch(&login([7; 16])).await.unwrap().close);
    }

    struct SlowReachability;

    #[async_trait::async_trait]
    impl ReachabilityProbe for SlowReachability {
        async fn is_reachable(&self, _ip: Ipv4Addr, _port: u16, _hash: [u8; 16]) -> bool {
            tokio::time::sleep(Duration::from_millis(100)).await;
            true
        }
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_login_refused() {
        let ctx = Arc::new(ServerContext {
            info: ServerInfo::default(),
            directory: Arc::new(MemoryDirectory::new(Vec::new())),
            registry: SessionRegistry::new(LowIdPool::new(1, 10, true)),
            probe: Arc::new(SlowReachability),
            handshake: HandshakeStrategy::DiffieHellman,
            handshake_timeout: Duration::from_millis(500),
        });
        let (mut a, _rx1) = dispatcher(&ctx, 4001);
        let (mut b, _rx2) = dispatcher(&ctx, 4002);

        let request = login([7; 16]);
        let (first, second) = tokio::join!(a.dispatch(&request), b.dispatch(&request));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.close != second.close);

        let (mut winner, loser) = if first.close { (b, a) } else { (a, b) };
        assert!(loser.session().is_none());
        assert!(ctx.directory.is_connected(&[7; 16]).await.unwrap());

        winner.close().await;
        assert!(!ctx.directory.is_connected(&[7; 16]).await.unwrap());
        assert_eq!(ctx.directory.client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_low_id_failure_releases_hash() {
        let ctx = context(false, LowIdPool::new(1, 1, false));
        let (mut d, _rx) = dispatcher(&ctx, 4001);
        assert!(d.dispatch(&login([8; 16])).await.unwrap().close);
        assert!(!ctx.directory.is_connected(&[8; 16]).await.unwrap());
        assert_eq!(ctx.directory.client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requests_before_login_ignored() {
        let ctx = context(true, LowIdPool::new(1, 10, true));
        let (mut d, _rx) = dispatcher(&ctx, 4001);
        let outcome = d.dispatch(&ClientRequest::GetServerList.encode().unwrap()).await.unwrap();
        assert!(outcome.replies.is_empty());
        assert!(!outcome.close);
    }

    #[tokio::test]
    async fn test_offer_then_sources_and_search() {
        let ctx = context(true, LowIdPool::new(1, 10, true));
        let (mut d, _rx) = dispatcher(&ctx, 4001);
        d.dispatch(&login([3; 16])).await.unwrap();

        let file = OfferedFile {
            info: FileInfo {
                hash: [9; 16],
                size: 1234,
                name: "some movie.avi".to_string(),
                file_type: "Video".to_string(),
                ..FileInfo::default()
            },
            complete: true,
        };
        let offer = ClientRequest::OfferFiles(vec![file]).encode().unwrap();
        assert!(d.dispatch(&offer).await.unwrap().replies.is_empty());

        let get = ClientRequest::GetSources {
            hash: [9; 16],
            size: 1234,
            obfuscated: false,
        };
        let outcome = d.dispatch(&get.encode().unwrap()).await.unwrap();
        let session = d.session().unwrap().clone();
        match ServerMessage::decode(&outcome.replies[0]).unwrap() {
            ServerMessage::FoundSources { hash, sources, .. } => {
                assert_eq!(hash, [9; 16]);
                assert_eq!(sources, vec![Endpoint { ip: session.assigned_id, port: 5555 }]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let search = ClientRequest::Search(SearchExpr::StringMatch {
            value: "Video".to_string(),
            field: SearchField::Code(TAG_TYPE),
        });
        let outcome = d.dispatch(&search.encode().unwrap()).await.unwrap();
        assert_eq!(opcodes(&outcome), vec![OP_SEARCHRESULT]);
        assert_eq!(&outcome.replies[0].payload_bytes()[..4], &1u32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_server_list_then_ident() {
        let ctx = context(true, LowIdPool::new(1, 10, true));
        let (mut d, _rx) = dispatcher(&ctx, 4001);
        d.dispatch(&login([4; 16])).await.unwrap();
        let outcome = d.dispatch(&ClientRequest::GetServerList.encode().unwrap()).await.unwrap();
        assert_eq!(opcodes(&outcome), vec![OP_SERVERLIST, OP_SERVERIDENT]);
    }

    #[tokio::test]
    async fn test_callback_relay() {
        // B is firewalled and gets a LowID
        let ctx = context(false, LowIdPool::new(1, 10, true));
        let (mut b, mut b_rx) = dispatcher(&ctx, 4001);
        b.dispatch(&login([5; 16])).await.unwrap();
        let low_id = b.session().unwrap().assigned_id;

        let (mut a, _a_rx) = dispatcher(&ctx, 4002);
        a.dispatch(&login([6; 16])).await.unwrap();
        let a_endpoint = a.session().unwrap().endpoint();

        let request = ClientRequest::CallbackRequest { low_id }.encode().unwrap();
        let outcome = a.dispatch(&request).await.unwrap();
        assert!(outcome.replies.is_empty());

        let relayed = b_rx.recv().await.unwrap();
        assert_eq!(
            ServerMessage::decode(&relayed).unwrap(),
            ServerMessage::CallbackRequested(a_endpoint)
        );

        b.close().await;
        let outcome = a.dispatch(&request).await.unwrap();
        assert_eq!(opcodes(&outcome), vec![OP_CALLBACKFAILED]);
    }

    #[tokio::test]
    async fn test_unknown_opcode_ignored() {
        let ctx = context(true, LowIdPool::new(1, 10, true));
        let (mut d, _rx) = dispatcher(&ctx, 4001);
        d.dispatch(&login([8; 16])).await.unwrap();
        let outcome = d.dispatch(&Message::ed2k(0x7f, vec![1, 2, 3])).await.unwrap();
        assert!(outcome.replies.is_empty());
    }
}
