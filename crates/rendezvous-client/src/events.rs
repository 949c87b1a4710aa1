//! Events surfaced by the server connection.

use rendezvous_shared::{FileOffer, PresenceSnapshot, TransferAnswer, TransferDecision};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Someone wants to be our friend.
    FriendRequest { from: String, message: String },
    /// A friendship with `friend` now exists.
    FriendAdded { friend: String, message: String },
    FriendRejected { by: String, message: String },
    /// A friendship ended, either by removal or account deletion.
    FriendRemoved { message: String },
    Presence(PresenceSnapshot),
    IncomingOffer { from: String, offer: FileOffer },
    OfferAnswered {
        from: String,
        decision: TransferDecision,
        answer: TransferAnswer,
    },
    /// ERROR envelope not claimed by a pending request.
    ServerError(String),
    /// The server closed the connection.
    Disconnected,
}
