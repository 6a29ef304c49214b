pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod history;
pub mod logging;
pub mod reassembler;
pub mod session;
pub mod state;
pub mod transcript;
pub mod transport;

// Re-export main types for convenience
pub use api::{AccountClient, SmsPurpose, SmsReceipt};
pub use config::{Config, RetryPolicy, TransportConfig};
pub use controller::{ChatController, TurnOutcome};
pub use error::{ApiError, ChatError};
pub use history::HistoryBuffer;
pub use reassembler::StreamReassembler;
pub use session::Session;
pub use state::{ChatMessage, ChatRole, DisplayMessage, TokenResponse};
pub use transcript::{ListChange, MessageList, Transcript};
pub use transport::{ChatTransport, StreamEnd, TurnEvent, TurnHandle};
