//! Directory comparison and the merge that produces the final sync table.

use crate::allocator::{append_groups, email_key, AllocationReport, GroupBlock};
use crate::error::{Result, SyncError};
use crate::groups::GroupIndex;
use crate::models::{
    is_filled, normalize_email, normalize_username, Config, DirectoryColumns, UsernameMismatch,
};
use crate::table::{AnonymousNaming, RecordTable};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// The four tables a run works from
#[derive(Debug, Clone)]
pub struct ReconcileInputs {
    pub ldap: RecordTable,
    pub gad: RecordTable,
    pub sync: RecordTable,
    pub groups: RecordTable,
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub missing_in_gad: Vec<String>,
    pub missing_in_ldap: Vec<String>,
    pub mismatches: Vec<UsernameMismatch>,
    pub group_index_users: usize,
    pub group_memberships: usize,
    pub allocation: AllocationReport,
    pub mismatch_rows: usize,
    pub remaining_rows: usize,
    pub final_table: RecordTable,
    /// Anonymous columns found after the last-auth column, with their filled cell count
    pub trailing_columns: Vec<(String, usize)>,
}

/// Normalized emails of `left` that do not appear in `right`, in first-seen order
pub fn missing_users(
    left: &RecordTable,
    left_email: &str,
    right: &RecordTable,
    right_email: &str,
) -> Result<Vec<String>> {
    left.require(left_email)?;
    let present = email_set(right, right_email)?;

    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    for row in left.rows() {
        let Some(email) = left.value_by_name(row, left_email).map(normalize_email) else {
            continue;
        };
        if !present.contains(&email) && seen.insert(email.clone()) {
            missing.push(email);
        }
    }
    Ok(missing)
}

fn email_set(table: &RecordTable, column: &str) -> Result<HashSet<String>> {
    table.require(column)?;
    Ok(table
        .rows()
        .iter()
        .filter_map(|row| table.value_by_name(row, column).map(normalize_email))
        .collect())
}

/// First username per normalized email
fn usernames_by_email(
    table: &RecordTable,
    columns: &DirectoryColumns,
) -> Result<Vec<(String, String)>> {
    table.require(&columns.email)?;
    table.require(&columns.username)?;

    let mut seen = HashSet::new();
    let mut pairs = Vec::new();
    for row in table.rows() {
        let Some(email) = table.value_by_name(row, &columns.email).map(normalize_email) else {
            continue;
        };
        if !seen.insert(email.clone()) {
            continue;
        }
        let username = table
            .value_by_name(row, &columns.username)
            .map(|u| u.trim().to_string())
            .unwrap_or_default();
        pairs.push((email, username));
    }
    Ok(pairs)
}

/// Users present in both directories whose usernames differ, in LDAP order
pub fn username_mismatches(
    ldap: &RecordTable,
    ldap_columns: &DirectoryColumns,
    gad: &RecordTable,
    gad_columns: &DirectoryColumns,
) -> Result<Vec<UsernameMismatch>> {
    let gad_users: HashMap<String, String> =
        usernames_by_email(gad, gad_columns)?.into_iter().collect();

    let mut mismatches = Vec::new();
    for (email, ldap_username) in usernames_by_email(ldap, ldap_columns)? {
        let Some(gad_username) = gad_users.get(&email) else {
            continue;
        };
        if normalize_username(&ldap_username) != normalize_username(gad_username) {
            mismatches.push(UsernameMismatch {
                email,
                ldap_username,
                gad_username: gad_username.clone(),
            });
        }
    }
    Ok(mismatches)
}

/// Sync rows for mismatched users, with the email normalized and the username
/// replaced by the GAD one
pub fn correct_mismatched_rows(
    sync: &RecordTable,
    email_column: &str,
    username_column: &str,
    mismatches: &[UsernameMismatch],
) -> Result<RecordTable> {
    sync.require(email_column)?;
    sync.require(username_column)?;

    let corrections: HashMap<&str, &str> = mismatches
        .iter()
        .map(|m| (m.email.as_str(), m.gad_username.as_str()))
        .collect();

    let mut rows = sync.filter_rows(|table, row| {
        table
            .value_by_name(row, email_column)
            .map(|e| corrections.contains_key(normalize_email(e).as_str()))
            .unwrap_or(false)
    });

    let email_positions = rows.index().all(email_column).to_vec();
    let username_positions = rows.index().all(username_column).to_vec();
    for row_idx in 0..rows.row_count() {
        let row = &rows.rows()[row_idx];
        let Some(email) = rows.value_by_name(row, email_column).map(normalize_email) else {
            continue;
        };
        let Some(username) = corrections.get(email.as_str()).map(|u| u.to_string()) else {
            continue;
        };
        for &pos in &email_positions {
            if is_filled(rows.cell(row_idx, pos)) {
                rows.set_cell(row_idx, pos, Some(email.clone()));
            }
        }
        for &pos in &username_positions {
            rows.set_cell(row_idx, pos, Some(username.clone()));
        }
    }
    Ok(rows)
}

/// Logged-in sync rows that are not part of the mismatch set.
/// Without a last-auth column every row counts as logged in.
pub fn remaining_logged(
    sync: &RecordTable,
    email_column: &str,
    last_auth_column: Option<&str>,
    mismatches: &[UsernameMismatch],
) -> Result<RecordTable> {
    sync.require(email_column)?;
    if let Some(column) = last_auth_column {
        sync.require(column)?;
    }
    let excluded: HashSet<&str> = mismatches.iter().map(|m| m.email.as_str()).collect();

    Ok(sync.filter_rows(|table, row| {
        let logged_in = last_auth_column
            .map(|c| table.any_filled(row, c))
            .unwrap_or(true);
        let email = table
            .value_by_name(row, email_column)
            .map(normalize_email)
            .unwrap_or_default();
        logged_in && !excluded.contains(email.as_str())
    }))
}

/// Reshape `target` to exactly the column sequence of `template`.
///
/// Cells move by name; the n-th column named X in the target fills the n-th
/// column named X in the template. Template columns the target lacks are left
/// empty and target-only columns are dropped.
pub fn align_columns(target: &RecordTable, template: &RecordTable) -> RecordTable {
    let mut used: HashMap<&str, usize> = HashMap::new();
    let sources: Vec<Option<usize>> = template
        .columns()
        .iter()
        .map(|name| {
            let nth = used.entry(name.as_str()).or_insert(0);
            let source = target.index().all(name).get(*nth).copied();
            *nth += 1;
            source
        })
        .collect();

    let mut aligned = RecordTable::new(template.columns().to_vec());
    for row in target.rows() {
        aligned.push_row(
            sources
                .iter()
                .map(|source| source.and_then(|pos| row.get(pos)).map(str::to_string))
                .collect(),
        );
    }
    aligned
}

/// Rows of `first` then `second`, keeping one row per normalized email
pub fn concat_dedupe(
    first: &RecordTable,
    second: &RecordTable,
    email_column: &str,
) -> Result<RecordTable> {
    if first.columns() != second.columns() {
        return Err(SyncError::schema(
            "cannot concatenate tables with different column layouts",
        ));
    }
    first.require(email_column)?;

    let mut seen = HashSet::new();
    let mut merged = RecordTable::new(first.columns().to_vec());
    for (table, row) in first
        .rows()
        .iter()
        .map(|r| (first, r))
        .chain(second.rows().iter().map(|r| (second, r)))
    {
        let email = table
            .value_by_name(row, email_column)
            .map(normalize_email)
            .unwrap_or_default();
        if seen.insert(email) {
            merged.push_row(row.cells().to_vec());
        }
    }
    Ok(merged)
}

/// Anonymous columns positioned after `after_column`, each with the number of
/// rows holding a value in it
pub fn trailing_anonymous_columns(
    table: &RecordTable,
    after_column: &str,
    naming: &AnonymousNaming,
) -> Result<Vec<(String, usize)>> {
    let after = table.require(after_column)?;
    Ok(table
        .columns()
        .iter()
        .enumerate()
        .skip(after + 1)
        .filter(|(_, name)| naming.is_anonymous(name))
        .map(|(pos, name)| {
            let filled = table.rows().iter().filter(|r| is_filled(r.get(pos))).count();
            (name.clone(), filled)
        })
        .collect())
}

/// Run the whole comparison and merge over already loaded tables
pub fn reconcile(config: &Config, inputs: &ReconcileInputs) -> Result<Reconciliation> {
    let naming = AnonymousNaming::new(&config.anonymous_column_prefix)?;
    let sync_cols = &config.sync_columns;

    let missing_in_gad = missing_users(
        &inputs.ldap,
        &config.ldap_columns.email,
        &inputs.gad,
        &config.gad_columns.email,
    )?;
    let missing_in_ldap = missing_users(
        &inputs.gad,
        &config.gad_columns.email,
        &inputs.ldap,
        &config.ldap_columns.email,
    )?;
    info!(
        missing_in_gad = missing_in_gad.len(),
        missing_in_ldap = missing_in_ldap.len(),
        "compared directories"
    );

    let mismatches = username_mismatches(
        &inputs.ldap,
        &config.ldap_columns,
        &inputs.gad,
        &config.gad_columns,
    )?;
    info!(mismatches = mismatches.len(), "found username mismatches");

    let group_index = GroupIndex::from_table(
        &inputs.groups,
        &config.group_columns.email,
        &config.group_columns.group,
    )?;
    if group_index.is_empty() {
        warn!("groups table has no usable email/group rows");
    }

    let block = GroupBlock::new(&sync_cols.block_start, &sync_cols.block_end);
    // fail on a bad layout before anything else touches the sync table
    block.resolve(&inputs.sync)?;

    let corrected = correct_mismatched_rows(
        &inputs.sync,
        &sync_cols.email,
        &sync_cols.username,
        &mismatches,
    )?;
    let (mismatch_sync, allocation) =
        append_groups(corrected, &block, &group_index, &naming, email_key(&sync_cols.email))?;

    let remaining = remaining_logged(
        &inputs.sync,
        &sync_cols.email,
        sync_cols.last_auth.as_deref(),
        &mismatches,
    )?;
    let remaining = align_columns(&remaining, &mismatch_sync);

    let final_table = concat_dedupe(&remaining, &mismatch_sync, &sync_cols.email)?;

    let trailing_columns = match sync_cols.last_auth.as_deref() {
        Some(last_auth) => trailing_anonymous_columns(&final_table, last_auth, &naming)?,
        None => Vec::new(),
    };
    if !trailing_columns.is_empty() {
        warn!(
            count = trailing_columns.len(),
            "anonymous columns found after last-auth column"
        );
    }
    if let Some((name, filled)) = trailing_columns.iter().find(|(_, filled)| *filled > 0) {
        warn!(column = %name, filled, "data found in anonymous column after last-auth column");
        return Err(SyncError::schema(format!(
            "anonymous column '{}' after '{}' holds {} values",
            name,
            sync_cols.last_auth.as_deref().unwrap_or_default(),
            filled
        )));
    }

    Ok(Reconciliation {
        missing_in_gad,
        missing_in_ldap,
        group_index_users: group_index.user_count(),
        group_memberships: group_index.membership_count(),
        allocation,
        mismatch_rows: mismatch_sync.row_count(),
        remaining_rows: remaining.row_count(),
        mismatches,
        final_table,
        trailing_columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[&str], rows: &[&[&str]]) -> RecordTable {
        let mut table = RecordTable::new(columns.iter().map(|c| c.to_string()).collect());
        for row in rows {
            table.push_row(
                row.iter()
                    .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                    .collect(),
            );
        }
        table
    }

    fn dir_columns(email: &str, username: &str) -> DirectoryColumns {
        DirectoryColumns {
            email: email.to_string(),
            username: username.to_string(),
        }
    }

    #[test]
    fn missing_users_both_directions() {
        let ldap = table(
            &["mail", "uid"],
            &[&["A@x.com", "a"], &["b@x.com", "b"], &["b@x.com", "b"]],
        );
        let gad = table(&["email_add", "user_name"], &[&["a@x.com", "a"], &["c@x.com", "c"]]);

        assert_eq!(missing_users(&ldap, "mail", &gad, "email_add").unwrap(), vec!["b@x.com"]);
        assert_eq!(missing_users(&gad, "email_add", &ldap, "mail").unwrap(), vec!["c@x.com"]);
    }

    #[test]
    fn mismatches_compare_normalized_usernames() {
        let ldap = table(
            &["mail", "uid"],
            &[&["a@x.com", "Alice"], &["b@x.com", "bob"], &["c@x.com", "carol"]],
        );
        let gad = table(
            &["email_add", "user_name"],
            &[&["A@X.COM", " alice "], &["b@x.com", "robert"]],
        );

        let found = username_mismatches(
            &ldap,
            &dir_columns("mail", "uid"),
            &gad,
            &dir_columns("email_add", "user_name"),
        )
        .unwrap();

        assert_eq!(
            found,
            vec![UsernameMismatch {
                email: "b@x.com".to_string(),
                ldap_username: "bob".to_string(),
                gad_username: "robert".to_string(),
            }]
        );
    }

    #[test]
    fn corrected_rows_take_gad_username() {
        let sync = table(
            &["ATTR_EMAIL", "ATTR_USERNAME", "other"],
            &[&[" B@x.com", "bob", "1"], &["a@x.com", "alice", "2"]],
        );
        let mismatches = vec![UsernameMismatch {
            email: "b@x.com".to_string(),
            ldap_username: "bob".to_string(),
            gad_username: "robert".to_string(),
        }];

        let rows =
            correct_mismatched_rows(&sync, "ATTR_EMAIL", "ATTR_USERNAME", &mismatches).unwrap();
        assert_eq!(rows.row_count(), 1);
        assert_eq!(rows.cell(0, 0), Some("b@x.com"));
        assert_eq!(rows.cell(0, 1), Some("robert"));
        assert_eq!(rows.cell(0, 2), Some("1"));
    }

    #[test]
    fn remaining_excludes_mismatches_and_logged_out_users() {
        let sync = table(
            &["ATTR_EMAIL", "LAST"],
            &[&["a@x.com", "2024"], &["b@x.com", "2024"], &["c@x.com", ""]],
        );
        let mismatches = vec![UsernameMismatch {
            email: "b@x.com".to_string(),
            ldap_username: "b".to_string(),
            gad_username: "bee".to_string(),
        }];

        let rows = remaining_logged(&sync, "ATTR_EMAIL", Some("LAST"), &mismatches).unwrap();
        assert_eq!(rows.row_count(), 1);
        assert_eq!(rows.cell(0, 0), Some("a@x.com"));

        let all = remaining_logged(&sync, "ATTR_EMAIL", None, &[]).unwrap();
        assert_eq!(all.row_count(), 3);
    }

    #[test]
    fn align_moves_cells_by_name_and_fills_new_columns() {
        let target = table(&["a", "x", "b", "x"], &[&["1", "x1", "2", "x2"]]);
        let template = table(&["a", "x", "new", "x", "b"], &[]);

        let aligned = align_columns(&target, &template);
        assert_eq!(aligned.columns(), template.columns());
        let values: Vec<_> = (0..aligned.width()).map(|p| aligned.cell(0, p)).collect();
        assert_eq!(values, vec![Some("1"), Some("x1"), None, Some("x2"), Some("2")]);
    }

    #[test]
    fn concat_keeps_first_row_per_email() {
        let first = table(&["ATTR_EMAIL", "v"], &[&["a@x.com", "1"], &["A@x.com ", "dup"]]);
        let second = table(&["ATTR_EMAIL", "v"], &[&["b@x.com", "2"], &["a@x.com", "3"]]);

        let merged = concat_dedupe(&first, &second, "ATTR_EMAIL").unwrap();
        assert_eq!(merged.row_count(), 2);
        assert_eq!(merged.cell(0, 1), Some("1"));
        assert_eq!(merged.cell(1, 1), Some("2"));

        let other = table(&["ATTR_EMAIL"], &[]);
        assert!(concat_dedupe(&first, &other, "ATTR_EMAIL").is_err());
    }

    #[test]
    fn trailing_anonymous_columns_are_counted() {
        let t = table(
            &["ATTR_LAST_AUTH_CONSOLIDATED", "Unnamed: 9", "ok", "Unnamed: 10"],
            &[&["x", "", "", "leak"], &["y", "", "", ""]],
        );
        let naming = AnonymousNaming::new("Unnamed:").unwrap();
        let found = trailing_anonymous_columns(&t, "ATTR_LAST_AUTH_CONSOLIDATED", &naming).unwrap();
        assert_eq!(
            found,
            vec![("Unnamed: 9".to_string(), 0), ("Unnamed: 10".to_string(), 1)]
        );
    }

    fn sample_config() -> Config {
        Config::default()
    }

    fn sample_inputs() -> ReconcileInputs {
        ReconcileInputs {
            ldap: table(
                &["mail", "uid"],
                &[&["a@x.com", "alice"], &["b@x.com", "bob"], &["d@x.com", "dave"]],
            ),
            gad: table(
                &["email_add", "user_name"],
                &[&["a@x.com", "alice"], &["b@x.com", "robert"], &["e@x.com", "eve"]],
            ),
            sync: table(
                &[
                    "ATTR_EMAIL",
                    "ATTR_USERNAME",
                    "ATTR_GROUPS",
                    "Unnamed: 3",
                    "ATTR_USER_KEY",
                    "ATTR_LAST_AUTH_CONSOLIDATED",
                ],
                &[
                    &["a@x.com", "alice", "staff", "", "ka", "2024-05-01"],
                    &["B@x.com", "bob", "staff", "", "kb", "2024-05-02"],
                    &["d@x.com", "dave", "", "", "kd", ""],
                ],
            ),
            groups: table(
                &["email_add", "group_name"],
                &[&["b@x.com", "eng"], &["b@x.com", "ops"], &["a@x.com", "ignored"]],
            ),
        }
    }

    #[test]
    fn full_reconciliation_over_tables() {
        let result = reconcile(&sample_config(), &sample_inputs()).unwrap();

        assert_eq!(result.missing_in_gad, vec!["d@x.com"]);
        assert_eq!(result.missing_in_ldap, vec!["e@x.com"]);
        assert_eq!(result.mismatches.len(), 1);
        assert_eq!(result.mismatch_rows, 1);
        assert_eq!(result.remaining_rows, 1);
        assert_eq!(result.allocation.added_columns, vec!["Unnamed: 4"]);
        assert_eq!(result.allocation.writes.cells_written, 2);

        let t = &result.final_table;
        assert_eq!(
            t.columns(),
            &[
                "ATTR_EMAIL",
                "ATTR_USERNAME",
                "ATTR_GROUPS",
                "Unnamed: 3",
                "Unnamed: 4",
                "ATTR_USER_KEY",
                "ATTR_LAST_AUTH_CONSOLIDATED"
            ]
        );
        assert_eq!(t.row_count(), 2);
        // logged-in, unchanged user first, with the new column left empty
        let row0: Vec<_> = (0..t.width()).map(|p| t.cell(0, p)).collect();
        assert_eq!(
            row0,
            vec![
                Some("a@x.com"),
                Some("alice"),
                Some("staff"),
                None,
                None,
                Some("ka"),
                Some("2024-05-01"),
            ]
        );
        let row1: Vec<_> = (0..t.width()).map(|p| t.cell(1, p)).collect();
        assert_eq!(
            row1,
            vec![
                Some("b@x.com"),
                Some("robert"),
                Some("staff"),
                Some("eng"),
                Some("ops"),
                Some("kb"),
                Some("2024-05-02")
            ]
        );
        assert_eq!(result.trailing_columns, Vec::<(String, usize)>::new());
    }

    #[test]
    fn data_after_last_auth_column_stops_the_run() {
        let mut inputs = sample_inputs();
        inputs.sync = table(
            &[
                "ATTR_EMAIL",
                "ATTR_USERNAME",
                "ATTR_GROUPS",
                "Unnamed: 3",
                "ATTR_USER_KEY",
                "ATTR_LAST_AUTH_CONSOLIDATED",
                "Unnamed: 9",
            ],
            &[
                &["a@x.com", "alice", "staff", "", "ka", "2024-05-01", "leak"],
                &["b@x.com", "bob", "staff", "", "kb", "2024-05-02", ""],
            ],
        );

        let err = reconcile(&sample_config(), &inputs).unwrap_err();
        assert!(
            matches!(err, SyncError::Schema(ref msg) if msg.contains("Unnamed: 9")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn empty_columns_after_last_auth_are_reported_not_fatal() {
        let mut inputs = sample_inputs();
        inputs.sync = table(
            &[
                "ATTR_EMAIL",
                "ATTR_USERNAME",
                "ATTR_GROUPS",
                "ATTR_USER_KEY",
                "ATTR_LAST_AUTH_CONSOLIDATED",
                "Unnamed: 9",
            ],
            &[&["a@x.com", "alice", "staff", "ka", "2024-05-01", ""]],
        );

        let result = reconcile(&sample_config(), &inputs).unwrap();
        assert_eq!(result.trailing_columns, vec![("Unnamed: 9".to_string(), 0)]);
        assert_eq!(result.group_index_users, 2);
        assert_eq!(result.group_memberships, 3);
    }

    #[test]
    fn bad_block_layout_stops_the_run() {
        let mut inputs = sample_inputs();
        inputs.sync = table(&["ATTR_EMAIL", "ATTR_USERNAME", "ATTR_USER_KEY", "ATTR_GROUPS"], &[]);
        let err = reconcile(&sample_config(), &inputs).unwrap_err();
        assert!(matches!(err, SyncError::Schema(_)));
    }
}
