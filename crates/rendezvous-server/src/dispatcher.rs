//! Per-connection protocol handling.
//!
//! Each accepted socket is split: a writer task drains the connection's
//! outbox, while the dispatcher loop reads envelopes and applies them to the
//! registry. Replies, forwarded envelopes and presence updates all travel
//! through the same outbox, so the peer sees them in the order they were
//! queued.
//!
//! A connection starts unauthenticated and only REGISTER and LOGIN are
//! honoured until a LOGIN succeeds. It closes on LOGOUT, on a stream error,
//! or when the registry terminates the session (account deletion).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rendezvous_shared::{read_envelope, write_envelope, Attachment, Envelope, EnvelopeKind};

use crate::actor::RegistryHandle;
use crate::broadcaster::presence_envelope;
use crate::error::ServerError;
use crate::registry::{outbox_channel, try_deliver, Outbox, Session};
use crate::resolver::AddressResolver;

/// How long a closing connection may spend flushing queued envelopes.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state handed to every connection.
pub struct ConnectionContext {
    pub registry: RegistryHandle,
    pub resolver: Arc<dyn AddressResolver>,
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, ctx: Arc<ConnectionContext>) {
    let mut next_id: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                next_id += 1;
                let ctx = ctx.clone();
                tokio::spawn(handle_connection(stream, peer, next_id, ctx));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

enum Flow {
    Continue,
    Close,
}

struct Connection {
    id: u64,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
    outbox: Outbox,
    session: Session,
    username: Option<String>,
}

pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    ctx: Arc<ConnectionContext>,
) {
    info!(conn = id, peer = %peer, "Connection accepted");

    let (mut reader, writer) = stream.into_split();
    let (outbox, rx) = outbox_channel();
    let writer_task = tokio::spawn(write_loop(writer, rx, id));

    let session = Session::new(id, peer, outbox.clone());
    let terminate = session.terminate.clone();
    let mut conn = Connection {
        id,
        peer,
        ctx,
        outbox,
        session,
        username: None,
    };

    loop {
        let read = tokio::select! {
            read = read_envelope(&mut reader) => read,
            _ = terminate.notified() => {
                info!(conn = id, "Session terminated by registry");
                break;
            }
        };

        match read {
            Ok(envelope) => {
                if let Flow::Close = conn.handle(envelope).await {
                    break;
                }
            }
            Err(e) if e.is_fatal() => {
                debug!(conn = id, error = %e, "Stream closed");
                break;
            }
            Err(e) => {
                warn!(conn = id, error = %e, "Malformed envelope");
                let receiver = conn.username.clone().unwrap_or_default();
                conn.reply(Envelope::error(receiver, ServerError::from(e).to_string()));
            }
        }
    }

    conn.close().await;
    drop(conn);

    let mut writer_task = writer_task;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
    info!(conn = id, peer = %peer, "Connection closed");
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Envelope>, id: u64) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            debug!(conn = id, error = %e, "Write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

impl Connection {
    fn reply(&self, envelope: Envelope) {
        if let Err(failure) = try_deliver(&self.outbox, envelope) {
            debug!(conn = self.id, ?failure, "Reply dropped");
        }
    }

    /// ERROR answering a request of kind `request`.
    fn reply_error(&self, request: EnvelopeKind, receiver: &str, err: &ServerError) {
        self.reply(Envelope::error_reply(request, receiver, err.to_string()));
    }

    async fn handle(&mut self, envelope: Envelope) -> Flow {
        debug!(
            conn = self.id,
            kind = %envelope.kind(),
            sender = %envelope.sender(),
            receiver = %envelope.receiver(),
            "Envelope received"
        );

        match (envelope.kind(), self.username.clone()) {
            (EnvelopeKind::Register, _) => self.on_register(&envelope).await,
            (EnvelopeKind::Login, None) => self.on_login(&envelope).await,
            (EnvelopeKind::Login, Some(current)) => {
                self.reply_error(
                    EnvelopeKind::Login,
                    envelope.sender(),
                    &ServerError::AlreadyAuthenticated(current),
                );
            }
            (EnvelopeKind::Error, _) => {
                debug!(conn = self.id, content = %envelope.content(), "Client reported an error");
            }
            (kind, None) => {
                self.reply_error(kind, envelope.sender(), &ServerError::NotAuthenticated);
            }
            (EnvelopeKind::Logout, Some(username)) => {
                self.reply(Envelope::from_server(
                    EnvelopeKind::Logout,
                    username.as_str(),
                    "Logged out",
                ));
                return Flow::Close;
            }
            (kind, Some(username)) => self.on_authenticated(kind, &username, envelope).await,
        }
        Flow::Continue
    }

    async fn on_register(&self, envelope: &Envelope) {
        let credentials = match envelope.credentials() {
            Ok(credentials) => credentials,
            Err(e) => {
                self.reply_error(EnvelopeKind::Register, envelope.sender(), &ServerError::from(e));
                return;
            }
        };
        let username = credentials.username.clone();
        match self.ctx.registry.register(credentials).await {
            Ok(()) => self.reply(Envelope::from_server(
                EnvelopeKind::Register,
                username.as_str(),
                "Registration successful",
            )),
            Err(e) => self.reply_error(EnvelopeKind::Register, &username, &e),
        }
    }

    async fn on_login(&mut self, envelope: &Envelope) {
        let credentials = match envelope.credentials() {
            Ok(credentials) => credentials,
            Err(e) => {
                self.reply_error(EnvelopeKind::Login, envelope.sender(), &ServerError::from(e));
                return;
            }
        };
        let username = credentials.username.clone();
        let advertised = self.ctx.resolver.advertised_address(self.peer);

        match self
            .ctx
            .registry
            .login(credentials, self.session.clone(), advertised.clone())
            .await
        {
            Ok(()) => {
                info!(conn = self.id, username = %username, address = %advertised, "Authenticated");
                self.reply(
                    Envelope::from_server(
                        EnvelopeKind::Login,
                        username.as_str(),
                        "Login successful",
                    )
                    .with_attachment(Attachment::Address(advertised)),
                );
                self.username = Some(username);
            }
            Err(e) => {
                debug!(conn = self.id, username = %username, error = %e, "Login refused");
                self.reply_error(EnvelopeKind::Login, &username, &e);
            }
        }
    }

    async fn on_authenticated(&self, kind: EnvelopeKind, username: &str, envelope: Envelope) {
        let registry = &self.ctx.registry;
        let other = envelope.receiver().to_string();

        let result = match kind {
            EnvelopeKind::FriendRequest => registry.send_friend_request(username, &other).await,
            EnvelopeKind::FriendAccept => registry.accept_friend_request(username, &other).await,
            EnvelopeKind::FriendReject => registry.reject_friend_request(username, &other).await,
            EnvelopeKind::FriendRemove => registry.remove_friend(username, &other).await,
            EnvelopeKind::FriendListUpdate => self.send_presence(username).await,
            EnvelopeKind::FileTransferRequest => {
                registry
                    .forward_transfer_request(username, envelope.with_sender(username))
                    .await
            }
            EnvelopeKind::FileTransferResponse => {
                registry.route(&other, envelope.with_sender(username)).await
            }
            EnvelopeKind::Register
            | EnvelopeKind::Login
            | EnvelopeKind::Logout
            | EnvelopeKind::Error => Ok(()),
        };

        if let Err(e) = result {
            debug!(
                conn = self.id,
                username = %username,
                kind = %kind,
                error = %e,
                "Request failed"
            );
            self.reply_error(kind, username, &e);
        }
    }

    /// Presence snapshot for this user only, on demand.
    async fn send_presence(&self, username: &str) -> Result<(), ServerError> {
        match self.ctx.registry.presence_target(username).await? {
            Some(target) => {
                self.reply(presence_envelope(&target, self.ctx.resolver.as_ref()));
                Ok(())
            }
            None => Err(ServerError::NotAuthenticated),
        }
    }

    async fn close(&mut self) {
        if let Some(username) = self.username.take() {
            match self.ctx.registry.end_session(&username, self.id).await {
                Ok(true) => info!(conn = self.id, username = %username, "Session ended"),
                Ok(false) => {}
                Err(e) => warn!(conn = self.id, error = %e, "Failed to end session"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::spawn_registry;
    use crate::registry::Registry;
    use crate::resolver::PeerAddressResolver;
    use crate::store::{AccountStore, AccountTable};
    use rendezvous_shared::Credentials;

    async fn start_server(dir: &std::path::Path) -> (SocketAddr, RegistryHandle) {
        let store = AccountStore::new(dir.join("users.json"));
        let (registry, _task) = spawn_registry(Registry::new(AccountTable::new(), true), store);
        let ctx = Arc::new(ConnectionContext {
            registry: registry.clone(),
            resolver: Arc::new(PeerAddressResolver),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, ctx));
        (addr, registry)
    }

    async fn exchange(stream: &mut TcpStream, envelope: &Envelope) -> Envelope {
        write_envelope(stream, envelope).await.unwrap();
        read_envelope(stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_unauthenticated_requests_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _registry) = start_server(dir.path()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let request = Envelope::new(EnvelopeKind::FriendRequest, "alice", "bob", "");
        let reply = exchange(&mut stream, &request).await;
        assert_eq!(reply.kind(), EnvelopeKind::Error);
        assert_eq!(reply.in_reply_to(), Some(EnvelopeKind::FriendRequest));

        // The connection stays usable.
        let creds = Credentials::new("alice", "pw");
        let reply = exchange(&mut stream, &Envelope::register(&creds)).await;
        assert_eq!(reply.kind(), EnvelopeKind::Register);
    }

    #[tokio::test]
    async fn test_login_reply_carries_address() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, registry) = start_server(dir.path()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let creds = Credentials::new("alice", "pw");

        exchange(&mut stream, &Envelope::register(&creds)).await;
        let reply = exchange(&mut stream, &Envelope::login(&creds)).await;
        assert_eq!(reply.kind(), EnvelopeKind::Login);
        assert_eq!(reply.address(), Some("127.0.0.1"));
        assert_eq!(registry.stats().await.unwrap().online_users, 1);

        let again = exchange(&mut stream, &Envelope::login(&creds)).await;
        assert_eq!(again.kind(), EnvelopeKind::Error);
        assert_eq!(again.in_reply_to(), Some(EnvelopeKind::Login));
    }

    #[tokio::test]
    async fn test_bad_credentials_format() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _registry) = start_server(dir.path()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let bad = Envelope::new(EnvelopeKind::Register, "x", "SERVER", "a:b:c");
        let reply = exchange(&mut stream, &bad).await;
        assert_eq!(reply.kind(), EnvelopeKind::Error);
        assert_eq!(reply.in_reply_to(), Some(EnvelopeKind::Register));
    }

    #[tokio::test]
    async fn test_disconnect_logs_out() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, registry) = start_server(dir.path()).await;
        let creds = Credentials::new("alice", "pw");

        {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            exchange(&mut stream, &Envelope::register(&creds)).await;
            exchange(&mut stream, &Envelope::login(&creds)).await;
        }

        let mut online = 1;
        for _ in 0..50 {
            online = registry.stats().await.unwrap().online_users;
            if online == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(online, 0);

        // Same account can log in again from a new connection.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = exchange(&mut stream, &Envelope::login(&creds)).await;
        assert_eq!(reply.kind(), EnvelopeKind::Login);
    }

    #[tokio::test]
    async fn test_logout_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, registry) = start_server(dir.path()).await;
        let creds = Credentials::new("alice", "pw");
        let mut stream = TcpStream::connect(addr).await.unwrap();
        exchange(&mut stream, &Envelope::register(&creds)).await;
        exchange(&mut stream, &Envelope::login(&creds)).await;

        let reply = exchange(&mut stream, &Envelope::logout("alice")).await;
        assert_eq!(reply.kind(), EnvelopeKind::Logout);
        assert!(read_envelope(&mut stream).await.unwrap_err().is_fatal());
        assert!(!registry.logout("alice").await.unwrap());
    }
}
