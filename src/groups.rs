use crate::error::Result;
use crate::models::{is_filled, normalize_email};
use crate::table::RecordTable;
use std::collections::HashMap;

/// Lookup from normalized email to the user's group names, in source row order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupIndex {
    by_email: HashMap<String, Vec<String>>,
}

impl GroupIndex {
    /// Build from raw (email, group) pairs. Pairs missing either side are
    /// dropped; duplicates within a user's list are kept.
    pub fn from_pairs<I, E, G>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Option<E>, Option<G>)>,
        E: AsRef<str>,
        G: AsRef<str>,
    {
        let mut by_email: HashMap<String, Vec<String>> = HashMap::new();

        for (email, group) in pairs {
            let (Some(email), Some(group)) = (email, group) else {
                continue;
            };
            if !is_filled(Some(email.as_ref())) || !is_filled(Some(group.as_ref())) {
                continue;
            }
            by_email
                .entry(normalize_email(email.as_ref()))
                .or_default()
                .push(group.as_ref().trim().to_string());
        }

        Self { by_email }
    }

    /// Build from a groups table with one membership per row
    pub fn from_table(table: &RecordTable, email_column: &str, group_column: &str) -> Result<Self> {
        table.require(email_column)?;
        table.require(group_column)?;

        let pairs = table.rows().iter().map(|row| {
            (
                table.value_by_name(row, email_column),
                table.value_by_name(row, group_column),
            )
        });
        Ok(Self::from_pairs(pairs))
    }

    /// Groups for a normalized email; unknown emails have none
    pub fn groups_for(&self, email: &str) -> &[String] {
        self.by_email.get(email).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn user_count(&self) -> usize {
        self.by_email.len()
    }

    pub fn membership_count(&self) -> usize {
        self.by_email.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }
}
