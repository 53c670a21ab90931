//! Streaming text generation against a Triton inference server.
//!
//! The crate is layered in two parts:
//!
//! - [`session::SessionClient`] owns the connection to the server. It loads
//!   models, builds the ten-tensor generation request and turns the
//!   server's asynchronous pushes into an ordered [`session::EventStream`].
//! - [`adapter::GenerationAdapter`] drives a session to produce the full
//!   completion of a prompt, forwarding tokens to an optional callback and
//!   cutting the output at the first stop token.
//!
//! ```rust,ignore
//! use triton_llm_core::{GenerationAdapter, GenerationOverrides, Settings};
//!
//! let settings = Settings::load(&Default::default())?;
//! let adapter = GenerationAdapter::from_settings(&settings)?;
//! let mut print = |token: &str| print!("{}", token);
//! let text = adapter
//!     .generate("What is Triton?", None, Some(&mut print), &GenerationOverrides::default())
//!     .await?;
//! ```

pub mod adapter;
pub mod cli;
pub mod config;
pub mod error;
pub mod session;
pub mod tensor;
pub mod transport;

// Re-export commonly used types
pub use adapter::{AdapterConfig, GenerationAdapter, ModelIdentity, TokenCallback};
pub use config::Settings;
pub use error::{Error, Result};
pub use session::{EventFeed, EventStream, SessionClient, StreamEvent};
pub use tensor::{GenerationOverrides, GenerationParameters};
pub use transport::{GrpcTransport, InferenceTransport, ScriptedPush, ScriptedTransport};
