//! Reconciles user records between an LDAP export, a GAD export and a
//! provisioning sync table, then merges GAD group memberships into the sync
//! table's fixed group column block.

pub mod allocator;
pub mod error;
pub mod groups;
pub mod models;
pub mod reconcile;
pub mod table;

pub use allocator::{append_groups, email_key, AllocationReport, GroupBlock};
pub use error::{Result, SyncError};
pub use groups::GroupIndex;
pub use models::{Config, UsernameMismatch};
pub use reconcile::{reconcile, ReconcileInputs, Reconciliation};
pub use table::{AnonymousNaming, RecordTable};
