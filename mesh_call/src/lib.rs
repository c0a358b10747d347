pub mod blocking;
pub mod error;
pub mod history;
pub mod media;
pub mod meeting;
pub mod message;
pub mod negotiation;
pub mod peer;
pub mod registry;
pub mod relay;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{Error, Result, TransportError};
pub use meeting::{Meeting, MeetingBuilder, MeetingHandle, MeetingView, PeerView};
pub use message::{
    ChatMessage, ClientMessage, IceCandidate, MeetingCode, PeerId, SdpType, ServerMessage,
    SessionDescription, SignalPayload,
};
pub use peer::{NegotiationState, RtcConfig, RtcConfigBuilder, RtcTransportFactory};
pub use relay::{Relay, RelayConnector, RelayEvent, WsConnector};
