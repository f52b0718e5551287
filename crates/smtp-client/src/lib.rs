//! Minimal ESMTP client for outbound delivery: one connection per
//! destination host, EHLO capability discovery, opportunistic STARTTLS
//! and multi-recipient message submission.

pub mod client;
pub mod client_types;
pub mod tls;
mod traits;

pub use client::{ClientError, Command, EsmtpCapability, SmtpClient, TlsInformation, TlsStatus};
pub use client_types::{EnhancedStatusCode, Response, SmtpClientTimeouts};
pub use tls::TlsOptions;
pub use traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
