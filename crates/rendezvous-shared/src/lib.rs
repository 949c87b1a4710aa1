// Wire model and framing shared by the rendezvous server, the client and
// the peer-to-peer transfer transport.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod framing;

pub use envelope::{
    Attachment, Credentials, Envelope, EnvelopeKind, FileOffer, PresenceSnapshot,
    TransferAnswer, TransferDecision, TransferEndpoint,
};
pub use error::ProtocolError;
pub use framing::{read_envelope, read_frame, write_envelope, write_frame};
