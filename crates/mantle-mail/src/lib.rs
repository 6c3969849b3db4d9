// SPDX-License-Identifier: MIT OR Apache-2.0
//! Email: connections, templates, the email outbox, recipient resolution,
//! and the provider transport boundary.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod provider;
mod recipients;
mod stores;

pub use provider::{
    EmailMessage, EmailProvider, HttpApiProvider, MockEmailProvider, ProviderRegistry,
    ProviderReceipt,
};
pub use recipients::{dedupe_recipients, resolve_recipients, split_recipients};
pub use stores::{
    ConnectionConfig, ConnectionStore, EmailConnection, EmailError, EmailOutboxRow,
    EmailOutboxStore, EmailTemplate, EmailTemplateStore, SmtpSecurity, validate_connection,
};
