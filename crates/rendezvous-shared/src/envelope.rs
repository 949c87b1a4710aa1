//! The envelope: one typed message unit exchanged between a client and the
//! rendezvous server.
//!
//! Envelopes carry no sequence number. Ordering relies entirely on the FIFO
//! delivery of the stream they travel on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{DECISION_ACCEPT, DECISION_REJECT, SERVER_NAME};
use crate::error::ProtocolError;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Closed set of envelope kinds understood by every party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Register,
    Login,
    Logout,
    FriendRequest,
    FriendAccept,
    FriendReject,
    FriendRemove,
    FriendListUpdate,
    FileTransferRequest,
    FileTransferResponse,
    Error,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Register => "REGISTER",
            EnvelopeKind::Login => "LOGIN",
            EnvelopeKind::Logout => "LOGOUT",
            EnvelopeKind::FriendRequest => "FRIEND_REQUEST",
            EnvelopeKind::FriendAccept => "FRIEND_ACCEPT",
            EnvelopeKind::FriendReject => "FRIEND_REJECT",
            EnvelopeKind::FriendRemove => "FRIEND_REMOVE",
            EnvelopeKind::FriendListUpdate => "FRIEND_LIST_UPDATE",
            EnvelopeKind::FileTransferRequest => "FILE_TRANSFER_REQUEST",
            EnvelopeKind::FileTransferResponse => "FILE_TRANSFER_RESPONSE",
            EnvelopeKind::Error => "ERROR",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// Full (non-delta) view of a user's friends pushed by the broadcaster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    /// Online flag for every friend.
    pub status: BTreeMap<String, bool>,
    /// Advertised address for every online friend.
    pub addresses: BTreeMap<String, String>,
}

impl PresenceSnapshot {
    pub fn is_online(&self, friend: &str) -> bool {
        self.status.get(friend).copied().unwrap_or(false)
    }

    pub fn address(&self, friend: &str) -> Option<&str> {
        self.addresses.get(friend).map(String::as_str)
    }

    pub fn friend_count(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }
}

/// Where a receiver is listening for one inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEndpoint {
    pub address: String,
    pub port: u16,
}

/// Describes one file a requester wants to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
}

/// Receiver's answer to a [`FileOffer`]. `endpoint` is set only on accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAnswer {
    pub transfer_id: Uuid,
    pub endpoint: Option<TransferEndpoint>,
}

/// Typed payload carried next to the free-text content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attachment {
    /// Network address the server observed for the client (LOGIN reply).
    Address(String),
    /// Friend presence snapshot (FRIEND_LIST_UPDATE).
    Presence(PresenceSnapshot),
    /// File description (FILE_TRANSFER_REQUEST).
    Offer(FileOffer),
    /// Accept/reject details (FILE_TRANSFER_RESPONSE).
    Answer(TransferAnswer),
    /// Kind of the request an ERROR answers.
    InReplyTo(EnvelopeKind),
}

/// Accept/reject decision carried in the content of a transfer response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDecision {
    Accept,
    Reject,
}

impl TransferDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDecision::Accept => DECISION_ACCEPT,
            TransferDecision::Reject => DECISION_REJECT,
        }
    }

    pub fn parse(content: &str) -> Option<Self> {
        match content {
            DECISION_ACCEPT => Some(TransferDecision::Accept),
            DECISION_REJECT => Some(TransferDecision::Reject),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// `"<username>:<secret>"` content of REGISTER and LOGIN envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Parse the content of a REGISTER/LOGIN envelope.
    ///
    /// Exactly one `:` separator is allowed and neither part may be empty.
    pub fn parse(content: &str) -> Result<Self, ProtocolError> {
        let (username, secret) = content
            .split_once(':')
            .ok_or_else(|| ProtocolError::Malformed("expected <username>:<secret>".into()))?;

        if secret.contains(':') {
            return Err(ProtocolError::Malformed(
                "credentials may contain only one ':'".into(),
            ));
        }
        if username.is_empty() || secret.is_empty() {
            return Err(ProtocolError::Malformed(
                "username and secret must not be empty".into(),
            ));
        }

        Ok(Self::new(username, secret))
    }

    pub fn to_content(&self) -> String {
        format!("{}:{}", self.username, self.secret)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One message on a client/server stream. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    kind: EnvelopeKind,
    sender: String,
    receiver: String,
    content: String,
    attachment: Option<Attachment>,
}

impl Envelope {
    pub fn new(
        kind: EnvelopeKind,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender: sender.into(),
            receiver: receiver.into(),
            content: content.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Envelope authored by the server.
    pub fn from_server(
        kind: EnvelopeKind,
        receiver: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(kind, SERVER_NAME, receiver, content)
    }

    /// ERROR envelope from the server.
    pub fn error(receiver: impl Into<String>, content: impl Into<String>) -> Self {
        Self::from_server(EnvelopeKind::Error, receiver, content)
    }

    /// ERROR answering a request of kind `request`.
    pub fn error_reply(
        request: EnvelopeKind,
        receiver: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::error(receiver, content).with_attachment(Attachment::InReplyTo(request))
    }

    pub fn register(credentials: &Credentials) -> Self {
        Self::new(
            EnvelopeKind::Register,
            credentials.username.clone(),
            SERVER_NAME,
            credentials.to_content(),
        )
    }

    pub fn login(credentials: &Credentials) -> Self {
        Self::new(
            EnvelopeKind::Login,
            credentials.username.clone(),
            SERVER_NAME,
            credentials.to_content(),
        )
    }

    pub fn logout(username: &str) -> Self {
        Self::new(EnvelopeKind::Logout, username, SERVER_NAME, "")
    }

    /// FILE_TRANSFER_REQUEST describing `offer`.
    pub fn file_offer(sender: &str, receiver: &str, offer: FileOffer) -> Self {
        let content = format!(
            "File transfer request for: {} (Size: {} bytes)",
            offer.file_name, offer.file_size
        );
        Self::new(EnvelopeKind::FileTransferRequest, sender, receiver, content)
            .with_attachment(Attachment::Offer(offer))
    }

    /// FILE_TRANSFER_RESPONSE for the offer identified by `transfer_id`.
    pub fn file_answer(
        sender: &str,
        receiver: &str,
        decision: TransferDecision,
        transfer_id: Uuid,
        endpoint: Option<TransferEndpoint>,
    ) -> Self {
        Self::new(
            EnvelopeKind::FileTransferResponse,
            sender,
            receiver,
            decision.as_str(),
        )
        .with_attachment(Attachment::Answer(TransferAnswer {
            transfer_id,
            endpoint,
        }))
    }

    /// Same envelope with the sender replaced, used when the server stamps
    /// the authenticated identity onto a forwarded envelope.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn credentials(&self) -> Result<Credentials, ProtocolError> {
        Credentials::parse(&self.content)
    }

    pub fn address(&self) -> Option<&str> {
        match &self.attachment {
            Some(Attachment::Address(addr)) => Some(addr),
            _ => None,
        }
    }

    pub fn presence(&self) -> Option<&PresenceSnapshot> {
        match &self.attachment {
            Some(Attachment::Presence(snapshot)) => Some(snapshot),
            _ => None,
        }
    }

    pub fn offer(&self) -> Option<&FileOffer> {
        match &self.attachment {
            Some(Attachment::Offer(offer)) => Some(offer),
            _ => None,
        }
    }

    pub fn answer(&self) -> Option<&TransferAnswer> {
        match &self.attachment {
            Some(Attachment::Answer(answer)) => Some(answer),
            _ => None,
        }
    }

    /// Request kind an ERROR answers. `None` for unsolicited errors.
    pub fn in_reply_to(&self) -> Option<EnvelopeKind> {
        match &self.attachment {
            Some(Attachment::InReplyTo(kind)) => Some(*kind),
            _ => None,
        }
    }

    pub fn decision(&self) -> Option<TransferDecision> {
        TransferDecision::parse(&self.content)
    }

    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}: {}",
            self.kind, self.sender, self.receiver, self.content
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_parse() {
        let creds = Credentials::parse("alice:pw1").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.secret, "pw1");
        assert_eq!(creds.to_content(), "alice:pw1");
    }

    #[test]
    fn test_credentials_reject_bad_format() {
        assert!(Credentials::parse("alice").is_err());
        assert!(Credentials::parse("alice:").is_err());
        assert!(Credentials::parse(":pw").is_err());
        assert!(Credentials::parse("alice:pw:extra").is_err());
    }

    #[test]
    fn test_presence_envelope_survives_bincode() {
        let mut snapshot = PresenceSnapshot::default();
        snapshot.status.insert("bob".into(), true);
        snapshot.status.insert("carol".into(), false);
        snapshot.addresses.insert("bob".into(), "10.0.0.2".into());

        let env = Envelope::from_server(
            EnvelopeKind::FriendListUpdate,
            "alice",
            "Friend list update",
        )
        .with_attachment(Attachment::Presence(snapshot.clone()));

        let restored = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.kind(), EnvelopeKind::FriendListUpdate);
        assert_eq!(restored.sender(), SERVER_NAME);
        assert_eq!(restored.presence(), Some(&snapshot));
        assert!(restored.presence().unwrap().is_online("bob"));
        assert!(!restored.presence().unwrap().is_online("carol"));
        assert_eq!(restored.presence().unwrap().address("carol"), None);
    }

    #[test]
    fn test_file_answer_carries_decision_and_endpoint() {
        let id = Uuid::new_v4();
        let endpoint = TransferEndpoint {
            address: "192.168.1.7".into(),
            port: 40000,
        };
        let env = Envelope::file_answer(
            "bob",
            "alice",
            TransferDecision::Accept,
            id,
            Some(endpoint.clone()),
        );

        assert_eq!(env.decision(), Some(TransferDecision::Accept));
        let answer = env.answer().unwrap();
        assert_eq!(answer.transfer_id, id);
        assert_eq!(answer.endpoint.as_ref(), Some(&endpoint));
        assert!(env.offer().is_none());
    }

    #[test]
    fn test_with_sender_keeps_everything_else() {
        let offer = FileOffer {
            transfer_id: Uuid::new_v4(),
            file_name: "notes.txt".into(),
            file_size: 12,
        };
        let env = Envelope::file_offer("mallory", "bob", offer.clone()).with_sender("alice");
        assert_eq!(env.sender(), "alice");
        assert_eq!(env.receiver(), "bob");
        assert_eq!(env.offer(), Some(&offer));
    }

    #[test]
    fn test_error_reply_names_the_request() {
        let reply = Envelope::error_reply(EnvelopeKind::Logout, "alice", "Not logged in");
        assert_eq!(reply.kind(), EnvelopeKind::Error);
        assert_eq!(reply.sender(), SERVER_NAME);
        assert_eq!(reply.in_reply_to(), Some(EnvelopeKind::Logout));

        let restored = Envelope::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.in_reply_to(), Some(EnvelopeKind::Logout));

        let unsolicited = Envelope::error("alice", "Your account has been removed");
        assert_eq!(unsolicited.in_reply_to(), None);
    }
}
