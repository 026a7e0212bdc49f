use anyhow::{Context, Result};
use clap::{Arg, Command};
use std::fs;
use std::path::Path;
use user_sync_reconciler::{
    reconcile, AnonymousNaming, Config, ReconcileInputs, Reconciliation, RecordTable,
    UsernameMismatch,
};

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("user_sync_reconciler=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let matches = Command::new("user-sync-reconciler")
        .version("1.0")
        .about("Reconciles LDAP and GAD users against the sync export and merges GAD groups")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Output directory (overrides the configuration file)"),
        )
        .get_matches();

    let config_file = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");

    // Load or create configuration
    let config = if Path::new(config_file).exists() {
        println!("📋 Loading configuration from: {}", config_file);
        Config::load_from_file(config_file)
            .with_context(|| format!("Failed to load configuration: {}", config_file))?
    } else {
        println!("📝 Creating default configuration file: {}", config_file);
        Config::default()
            .save_to_file(config_file)
            .with_context(|| format!("Failed to write configuration: {}", config_file))?;
        println!(
            "⚠️  Please edit {} and point it at your exports, then run the program again.",
            config_file
        );
        return Ok(());
    };

    let missing = config.missing_inputs();
    if !missing.is_empty() {
        println!("❌ Error: input paths not set in configuration file: {}", missing.join(", "));
        println!("   Please edit {} and set them", config_file);
        return Ok(());
    }

    let output_dir = matches
        .get_one::<String>("output")
        .cloned()
        .or_else(|| config.output_directory.clone())
        .unwrap_or_else(|| "output".to_string());

    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir))?;
    clean_output_directory(&output_dir)?;

    let naming = AnonymousNaming::new(&config.anonymous_column_prefix)?;
    let inputs = ReconcileInputs {
        ldap: load_table(&config.ldap_csv, "LDAP users", &naming)?,
        gad: load_table(&config.gad_csv, "GAD users", &naming)?,
        sync: load_table(&config.sync_csv, "sync export", &naming)?,
        groups: load_table(&config.gad_groups_csv, "GAD groups", &naming)?,
    };

    header("Reconciling directories");
    let result = reconcile(&config, &inputs).context("Reconciliation failed")?;

    write_email_list(&result.missing_in_gad, &Path::new(&output_dir).join("missing_in_gad.csv"))?;
    write_email_list(&result.missing_in_ldap, &Path::new(&output_dir).join("missing_in_ldap.csv"))?;
    write_mismatches(&result.mismatches, &Path::new(&output_dir).join("username_mismatches.csv"))?;

    let final_path = Path::new(&output_dir).join("final_sync.csv");
    result
        .final_table
        .write_csv_path(&final_path)
        .with_context(|| format!("Failed to write {}", final_path.display()))?;

    print_summary(&config, &inputs, &result);

    println!("\n✅ Reconciliation complete!");
    println!("📂 Results: {}", output_dir);
    Ok(())
}

fn load_table(path: &str, label: &str, naming: &AnonymousNaming) -> Result<RecordTable> {
    println!("📄 Reading {}: {}", label, path);
    let table = RecordTable::from_csv_path(path, naming)
        .with_context(|| format!("Failed to read {} from {}", label, path))?;
    println!("   ✅ {} rows, {} columns", table.row_count(), table.width());
    Ok(table)
}

fn write_email_list(emails: &[String], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["email"])?;
    for email in emails {
        writer.write_record([email])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_mismatches(mismatches: &[UsernameMismatch], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["email", "ldap_username", "gad_username"])?;
    for mismatch in mismatches {
        writer.write_record([&mismatch.email, &mismatch.ldap_username, &mismatch.gad_username])?;
    }
    writer.flush()?;
    Ok(())
}

fn header(title: &str) {
    println!("\n{}", title);
    println!("{}", "=".repeat(title.chars().count()));
}

fn print_summary(config: &Config, inputs: &ReconcileInputs, result: &Reconciliation) {
    header("📊 SUMMARY");

    println!("LDAP users: {}", inputs.ldap.row_count());
    println!("GAD users: {}", inputs.gad.row_count());
    println!("Sync rows: {}", inputs.sync.row_count());

    println!("\n🔍 Directory comparison:");
    println!("   Missing from GAD: {}", result.missing_in_gad.len());
    println!("   Missing from LDAP: {}", result.missing_in_ldap.len());
    println!("   Username mismatches: {}", result.mismatches.len());

    let allocation = &result.allocation;
    println!(
        "\n👥 Appending GAD groups ({} memberships for {} users):",
        result.group_memberships, result.group_index_users
    );
    println!(
        "   Block {}..{}: width {} -> {}",
        config.sync_columns.block_start,
        config.sync_columns.block_end,
        allocation.plan.current_width,
        allocation.plan.current_width + allocation.added_columns.len()
    );
    if !allocation.added_columns.is_empty() {
        println!("   Added columns: {}", allocation.added_columns.join(", "));
    }
    println!(
        "   Wrote {} groups into {} users",
        allocation.writes.cells_written, allocation.writes.rows_updated
    );

    println!("\n📦 Final merge:");
    println!("   Users in previously filtered rows: {}", result.remaining_rows);
    println!("   Corrected users: {}", result.mismatch_rows);
    println!("   Final count of users to be imported: {}", result.final_table.row_count());
    println!(
        "   Final count check (user count should equal this): {}",
        result.remaining_rows + result.mismatch_rows
    );

    if let Some(last_auth) = &config.sync_columns.last_auth {
        if result.trailing_columns.is_empty() {
            println!("   ✅ No unnamed columns after {}", last_auth);
        } else {
            let names: Vec<&str> = result
                .trailing_columns
                .iter()
                .take(10)
                .map(|(n, _)| n.as_str())
                .collect();
            println!(
                "   ❌ {} unnamed columns after {} (all empty). First 10: {}",
                result.trailing_columns.len(),
                last_auth,
                names.join(", ")
            );
        }
    }
}

// Clean up previous results from output directory
fn clean_output_directory(output_dir: &str) -> Result<()> {
    let output_path = Path::new(output_dir);

    if !output_path.exists() {
        return Ok(());
    }

    println!("🧹 Cleaning previous results...");

    let items_to_clean = [
        "missing_in_gad.csv",
        "missing_in_ldap.csv",
        "username_mismatches.csv",
        "final_sync.csv",
    ];

    for item in &items_to_clean {
        let item_path = output_path.join(item);

        if item_path.is_file() {
            fs::remove_file(&item_path)?;
            println!("   🗑️  Removed file: {}", item);
        }
    }

    println!("   ✅ Output directory cleaned");
    Ok(())
}
