// SPDX-License-Identifier: MIT OR Apache-2.0
//! Storage boundary, attachment rows and links, and the encrypted secret
//! store.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachments;
mod secrets;
mod storage;

pub use attachments::{Attachment, AttachmentLink, AttachmentStore};
pub use secrets::{SecretStore, SecretStoreError, decrypt_secret, encrypt_secret};
pub use storage::{ATTACHMENTS_BUCKET, LocalStorage, Storage, StoredObject};
