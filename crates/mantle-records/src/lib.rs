// SPDX-License-Identifier: MIT OR Apache-2.0
//! Generic entity records: storage, schema validation, activity, chatter.
//!
//! The store holds uninterpreted JSON records per `(workspace, entity)`;
//! everything type-aware (required fields, enum membership, lookup domains)
//! lives in the validation layer and runs on the executor's behalf.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod activity;
mod chatter;
mod query;
mod store;
mod validate;

pub use activity::{ActivityAuthor, ActivityEntry, ActivityEventType, ActivityStore};
pub use chatter::{ChatterEntry, ChatterStore};
pub use query::{AggregateRow, Measure, PivotCell, aggregate, pivot};
pub use store::{LookupRow, RecordError, RecordPageItem, RecordStore, WorkspaceRecords};
pub use validate::{LookupResolver, ValidationMode, validate_record_data};
